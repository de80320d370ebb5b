//! HTTP bulk-transfer throughput estimate.
//!
//! Reports raw throughput. Calibration is applied by the caller.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Measurement, SpeedMethod, SpeedTestError};
use crate::config::SpeedTestConfig;

pub struct FallbackMethod {
    client: reqwest::Client,
    download_urls: Vec<String>,
    upload_url: Option<String>,
    upload_bytes: usize,
    latency_urls: Vec<String>,
    timeout: Duration,
}

impl FallbackMethod {
    pub fn new(
        download_urls: Vec<String>,
        upload_url: Option<String>,
        upload_bytes: usize,
        latency_urls: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            download_urls,
            upload_url,
            upload_bytes,
            latency_urls,
            timeout,
        }
    }

    pub fn from_config(cfg: &SpeedTestConfig) -> Self {
        Self::new(
            cfg.fallback_urls.clone(),
            cfg.fallback_upload_url.clone(),
            cfg.upload_bytes,
            cfg.latency_urls.clone(),
            Duration::from_secs(cfg.fallback_timeout_seconds),
        )
    }

    async fn download(&self, url: &str) -> Result<f64, SpeedTestError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transfer_error(e))?;
        check_status(&response)?;

        let body = response.bytes().await.map_err(|e| self.transfer_error(e))?;
        throughput_mbps(body.len(), start.elapsed())
    }

    async fn upload(&self, url: &str) -> Result<f64, SpeedTestError> {
        let payload = vec![0u8; self.upload_bytes];

        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .body(payload)
            .send()
            .await
            .map_err(|e| self.transfer_error(e))?;
        check_status(&response)?;
        // Wait for the server to finish reading before stopping the timer.
        response.bytes().await.map_err(|e| self.transfer_error(e))?;

        throughput_mbps(self.upload_bytes, start.elapsed())
    }

    /// Minimum round trip over the latency URLs, None if all fail.
    async fn latency(&self) -> Option<f64> {
        let mut best: Option<f64> = None;
        for url in &self.latency_urls {
            let start = Instant::now();
            let result = self
                .client
                .head(url)
                .timeout(self.timeout)
                .send()
                .await;
            match result {
                Ok(_) => {
                    let ms = start.elapsed().as_secs_f64() * 1000.0;
                    best = Some(best.map_or(ms, |b| b.min(ms)));
                }
                Err(e) => tracing::debug!("SpeedTester: latency check {} failed: {}", url, e),
            }
        }
        best
    }

    fn transfer_error(&self, e: reqwest::Error) -> SpeedTestError {
        if e.is_timeout() {
            SpeedTestError::Timeout(self.timeout)
        } else {
            SpeedTestError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl SpeedMethod for FallbackMethod {
    async fn measure(&self) -> Result<Measurement, SpeedTestError> {
        if self.download_urls.is_empty() {
            return Err(SpeedTestError::Network("no fallback URLs configured".to_string()));
        }

        // Sequential so transfers do not compete for the link.
        let mut rates = Vec::with_capacity(self.download_urls.len());
        let mut last_error = None;
        for url in &self.download_urls {
            match self.download(url).await {
                Ok(rate) => rates.push(rate),
                Err(e) => {
                    tracing::debug!("SpeedTester: download from {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        let download_mbps = match median(&mut rates) {
            Some(m) => m,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| SpeedTestError::Network("no downloads completed".to_string())))
            }
        };

        let upload_mbps = match &self.upload_url {
            Some(url) => match self.upload(url).await {
                Ok(rate) => Some(rate),
                Err(e) => {
                    tracing::warn!("SpeedTester: fallback upload to {} failed: {}", url, e);
                    None
                }
            },
            None => None,
        };

        Ok(Measurement {
            download_mbps,
            upload_mbps,
            ping_ms: self.latency().await,
            server: self.download_urls.first().and_then(|u| host_of(u)),
        })
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), SpeedTestError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(SpeedTestError::Network(format!("HTTP {}", status)))
    }
}

/// Megabits per second for `bytes` moved in `elapsed`.
fn throughput_mbps(bytes: usize, elapsed: Duration) -> Result<f64, SpeedTestError> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return Err(SpeedTestError::Network("empty transfer".to_string()));
    }
    Ok(bytes as f64 * 8.0 / secs / 1_000_000.0)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve `body` with a 200 to every request until the test ends.
    async fn serve(body: Vec<u8>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let _ = sock.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = sock.write_all(head.as_bytes()).await;
                    let _ = sock.write_all(&body).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut Vec::<f64>::new()), None);
        assert_eq!(median(&mut [3.0]), Some(3.0));
        assert_eq!(median(&mut [9.0, 1.0, 5.0]), Some(5.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn test_throughput() {
        // 1 MB in one second is 8 Mbps.
        let rate = throughput_mbps(1_000_000, Duration::from_secs(1)).unwrap();
        assert!((rate - 8.0).abs() < 1e-9);
        assert!(throughput_mbps(0, Duration::from_secs(1)).is_err());
        assert!(throughput_mbps(10, Duration::ZERO).is_err());
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://httpbin.org/bytes/1048576").as_deref(), Some("httpbin.org"));
        assert_eq!(host_of("not a url"), None);
    }

    #[tokio::test]
    async fn test_no_urls_configured() {
        let method = FallbackMethod::new(vec![], None, 0, vec![], Duration::from_secs(1));
        assert!(method.measure().await.is_err());
    }

    #[tokio::test]
    async fn test_measure_against_local_server() {
        let base = serve(vec![7u8; 256 * 1024]).await;
        let method = FallbackMethod::new(
            vec![format!("{}/a", base), format!("{}/b", base)],
            None,
            0,
            vec![base.clone()],
            Duration::from_secs(5),
        );

        let m = method.measure().await.unwrap();
        assert!(m.download_mbps > 0.0);
        assert_eq!(m.upload_mbps, None);
        assert!(m.ping_ms.is_some());
        assert_eq!(m.server.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_all_downloads_fail() {
        let method = FallbackMethod::new(
            vec!["http://127.0.0.1:9/nothing".to_string()],
            None,
            0,
            vec![],
            Duration::from_millis(500),
        );
        assert!(method.measure().await.is_err());
    }
}
