//! DNS probe: a single A query over UDP.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::ProbeError;

/// Ask the resolver at `server` for the A record of `query_name` and return
/// the time to a successful answer.
pub async fn query(server: &str, query_name: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let target = resolver_target(server);

    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, query_name)?;

    let exchange = async {
        let target_addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| ProbeError::Network(format!("no address for {}", target)))?;

        let bind_addr = if target_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(target_addr)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

        let start = Instant::now();
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

        let mut response = [0u8; 512];
        let n = socket
            .recv(&mut response)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
        let elapsed = start.elapsed();

        check_response(&response[..n], tx_id)?;
        Ok(elapsed)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// `host:port` for a resolver given as a bare IP, a socket address or a
/// hostname with optional port. Port 53 when none is given.
fn resolver_target(server: &str) -> String {
    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, 53).to_string();
    }
    if server.parse::<SocketAddr>().is_ok() || server.contains(':') {
        return server.to_string();
    }
    format!("{}:53", server)
}

/// Validate the header of a DNS response.
fn check_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // QR bit
    if response[2] & 0x80 == 0 {
        return Err(ProbeError::Network("not a DNS response".to_string()));
    }

    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    Ok(())
}

/// Build a recursive A/IN query for `name`.
fn build_dns_query(tx_id: u16, name: &str) -> Result<Vec<u8>, ProbeError> {
    let mut packet = Vec::with_capacity(18 + name.len());

    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // AN/NS/AR counts

    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(ProbeError::Config("empty DNS query name".to_string()));
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dns_query() {
        let packet = build_dns_query(0xABCD, "google.com").unwrap();
        assert_eq!(packet[..2], [0xAB, 0xCD]);
        assert_eq!(packet[4..6], [0, 1]);
        assert_eq!(
            packet[12..24],
            [6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0]
        );
        assert_eq!(packet[24..], [0, 1, 0, 1]);
    }

    #[test]
    fn test_build_dns_query_trailing_dot() {
        assert_eq!(
            build_dns_query(1, "example.com.").unwrap(),
            build_dns_query(1, "example.com").unwrap()
        );
    }

    #[test]
    fn test_build_dns_query_rejects_bad_names() {
        assert!(matches!(build_dns_query(1, ""), Err(ProbeError::Config(_))));
        assert!(matches!(build_dns_query(1, "a..b"), Err(ProbeError::Config(_))));
        let long = "x".repeat(64);
        assert!(build_dns_query(1, &long).is_err());
    }

    #[test]
    fn test_resolver_target() {
        assert_eq!(resolver_target("8.8.8.8"), "8.8.8.8:53");
        assert_eq!(resolver_target("127.0.0.1:5353"), "127.0.0.1:5353");
        assert_eq!(resolver_target("2001:4860:4860::8888"), "[2001:4860:4860::8888]:53");
        assert_eq!(resolver_target("[::1]:5353"), "[::1]:5353");
        assert_eq!(resolver_target("dns.google"), "dns.google:53");
    }

    #[test]
    fn test_check_response() {
        let mut resp = vec![0u8; 12];
        resp[0..2].copy_from_slice(&7u16.to_be_bytes());
        resp[2] = 0x81;
        resp[3] = 0x80;
        assert!(check_response(&resp, 7).is_ok());
        assert!(check_response(&resp, 8).is_err());
        assert!(check_response(&resp[..4], 7).is_err());

        resp[3] = 0x83; // NXDOMAIN
        assert!(check_response(&resp, 7).is_err());
    }

    #[tokio::test]
    async fn test_query_over_ipv6_loopback() {
        let Ok(server) = tokio::net::UdpSocket::bind("[::1]:0").await else {
            return; // no IPv6 loopback on this host
        };
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply[2] = 0x81;
            reply[3] = 0x80;
            server.send_to(&reply, peer).await.unwrap();
        });

        let result = query(&addr, "google.com", Duration::from_secs(2)).await;
        assert!(result.is_ok(), "{:?}", result);
    }

    #[tokio::test]
    async fn test_query_times_out_on_silent_server() {
        // A bound socket that never answers.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap().to_string();

        let result = query(&addr, "google.com", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
    }
}
