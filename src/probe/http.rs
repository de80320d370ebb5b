//! HTTP probe: a GET that must return a success status.

use std::time::{Duration, Instant};

use super::ProbeError;

/// Fetch `address` and return the time to a fully read response.
pub async fn fetch(client: &reqwest::Client, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let start = Instant::now();

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| request_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Network(format!("HTTP {}", status)));
    }

    // Read the full body to measure complete transfer time
    response
        .bytes()
        .await
        .map_err(|e| request_error(e, timeout))?;

    Ok(start.elapsed())
}

fn request_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_invalid_host() {
        let client = reqwest::Client::new();
        let result = fetch(&client, "http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        });

        let client = reqwest::Client::new();
        let result = fetch(&client, &format!("http://{}", addr), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProbeError::Network(msg)) if msg.contains("503")));
    }
}
