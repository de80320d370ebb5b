//! Dedicated speed test client run as a subprocess.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{Measurement, SpeedMethod, SpeedTestError};
use crate::config::SpeedTestConfig;

/// Runs `speedtest-cli --json` (or a compatible command) and parses its report.
pub struct PrimaryMethod {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl PrimaryMethod {
    pub fn new(command: &str, args: &[String], timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            timeout,
        }
    }

    pub fn from_config(cfg: &SpeedTestConfig) -> Self {
        Self::new(
            &cfg.primary_command,
            &cfg.primary_args,
            Duration::from_secs(cfg.timeout_seconds),
        )
    }
}

#[async_trait]
impl SpeedMethod for PrimaryMethod {
    async fn measure(&self) -> Result<Measurement, SpeedTestError> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpeedTestError::Command(format!("failed to execute {}: {}", self.command, e)))?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SpeedTestError::Timeout(self.timeout))?
            .map_err(|e| SpeedTestError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SpeedTestError::Command(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        parse_report(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    /// Bits per second.
    download: f64,
    upload: Option<f64>,
    /// Milliseconds.
    ping: Option<f64>,
    server: Option<ReportServer>,
}

#[derive(Debug, Deserialize)]
struct ReportServer {
    sponsor: Option<String>,
    name: Option<String>,
    country: Option<String>,
}

impl ReportServer {
    /// "Sponsor (Name, Country)" with whatever parts are present.
    fn describe(&self) -> Option<String> {
        let place: Vec<&str> = [&self.name, &self.country]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .filter(|s| !s.is_empty())
            .collect();

        match (self.sponsor.as_deref().filter(|s| !s.is_empty()), place.is_empty()) {
            (Some(sponsor), false) => Some(format!("{} ({})", sponsor, place.join(", "))),
            (Some(sponsor), true) => Some(sponsor.to_string()),
            (None, false) => Some(place.join(", ")),
            (None, true) => None,
        }
    }
}

fn parse_report(stdout: &str) -> Result<Measurement, SpeedTestError> {
    let report: Report =
        serde_json::from_str(stdout.trim()).map_err(|e| SpeedTestError::Parse(e.to_string()))?;

    if !report.download.is_finite() || report.download <= 0.0 {
        return Err(SpeedTestError::Parse(format!(
            "implausible download rate: {}",
            report.download
        )));
    }

    Ok(Measurement {
        download_mbps: report.download / 1_000_000.0,
        upload_mbps: report
            .upload
            .filter(|u| u.is_finite() && *u > 0.0)
            .map(|u| u / 1_000_000.0),
        ping_ms: report.ping.filter(|p| p.is_finite() && *p >= 0.0),
        server: report.server.as_ref().and_then(ReportServer::describe),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"download": 93456789.5, "upload": 11234567.0, "ping": 14.2,
        "server": {"url": "https://sp.example/upload.php", "name": "Phoenix, AZ",
        "country": "United States", "sponsor": "Cox Communications", "id": "1234"},
        "timestamp": "2024-01-01T12:00:00.000000Z", "bytes_sent": 1, "bytes_received": 2}"#;

    #[test]
    fn test_parse_report() {
        let m = parse_report(SAMPLE).unwrap();
        assert!((m.download_mbps - 93.4567895).abs() < 1e-9);
        assert!((m.upload_mbps.unwrap() - 11.234567).abs() < 1e-9);
        assert_eq!(m.ping_ms, Some(14.2));
        assert_eq!(
            m.server.as_deref(),
            Some("Cox Communications (Phoenix, AZ, United States)")
        );
    }

    #[test]
    fn test_parse_report_minimal() {
        let m = parse_report(r#"{"download": 5000000}"#).unwrap();
        assert_eq!(m.download_mbps, 5.0);
        assert_eq!(m.upload_mbps, None);
        assert_eq!(m.ping_ms, None);
        assert_eq!(m.server, None);
    }

    #[test]
    fn test_parse_report_rejects_garbage() {
        assert!(matches!(parse_report("Retrieving speedtest.net configuration..."), Err(SpeedTestError::Parse(_))));
        assert!(matches!(parse_report(r#"{"download": 0}"#), Err(SpeedTestError::Parse(_))));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let method = PrimaryMethod::new("linkwatch-no-such-speedtest", &[], Duration::from_secs(5));
        assert!(matches!(method.measure().await, Err(SpeedTestError::Command(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_is_parsed() {
        let args = vec!["-c".to_string(), format!("echo '{}'", r#"{"download": 8000000, "ping": 3.5}"#)];
        let method = PrimaryMethod::new("sh", &args, Duration::from_secs(5));
        let m = method.measure().await.unwrap();
        assert_eq!(m.download_mbps, 8.0);
        assert_eq!(m.ping_ms, Some(3.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let method = PrimaryMethod::new("sh", &args, Duration::from_millis(100));
        assert!(matches!(method.measure().await, Err(SpeedTestError::Timeout(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_status() {
        let args = vec!["-c".to_string(), "echo boom >&2; exit 2".to_string()];
        let method = PrimaryMethod::new("sh", &args, Duration::from_secs(5));
        match method.measure().await {
            Err(SpeedTestError::Command(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
