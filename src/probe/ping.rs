//! Ping probe with native ICMP echo and a fallback to the `ping` command.
//!
//! The echo itself runs on a blocking socket inside `spawn_blocking` so the
//! measured round trip is not inflated by executor scheduling.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

static ICMP_AVAILABLE: OnceLock<bool> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Detect whether any ICMP socket can be opened (RAW needs CAP_NET_RAW,
/// DGRAM needs ping_group_range on Linux).
fn detect_icmp() -> bool {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket)");
        return true;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket)");
        return true;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    false
}

/// Ping `address` once and return the round-trip time.
pub async fn ping(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    if *ICMP_AVAILABLE.get_or_init(detect_icmp) {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

        match result {
            Err(ProbeError::PermissionDenied(msg)) => {
                tracing::warn!(
                    "Native ping to {} was denied ({}), falling back to ping command",
                    address,
                    msg
                );
            }
            other => return other,
        }
    }

    ping_command(address, timeout).await
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn socket_error(context: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProbeError::PermissionDenied(format!("{}: {}", context, e))
    } else {
        ProbeError::Network(format!("{}: {}", context, e))
    }
}

/// Blocking ICMP echo to `ip`.
fn echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| socket_error("failed to create ICMP socket", e))?,
            false,
        ),
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("failed to connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_error("failed to send", e))?;

    // DGRAM sockets have their identifier rewritten by the kernel, which also
    // filters replies per socket, so only RAW sockets can match on it.
    let expected_id = raw.then_some(identifier);

    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| socket_error("failed to set timeout", e))?;

        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => socket_error("failed to receive", e),
        })?;

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(&buf[..len], ip.is_ipv4(), reply_type, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Build an ICMP / ICMPv6 echo request with a 56 byte payload.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16, ipv4: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum.
    if ipv4 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Whether `buf` is the reply to our request. IPv4 RAW sockets deliver the IP
/// header too; IPv6 and DGRAM sockets deliver the bare ICMP message.
fn is_echo_reply(
    buf: &[u8],
    ipv4: bool,
    reply_type: u8,
    identifier: Option<u16>,
    sequence: u16,
) -> bool {
    let offset = if ipv4 && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

    icmp[0] == reply_type
        && reply_seq == sequence
        && identifier.map_or(true, |id| id == reply_id)
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via the system command.
async fn ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!(
            "ping exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_ping_output(&stdout)
}

/// Extract the round-trip time from `ping` output.
///
/// Tries the per-packet `time=` field first, then the macOS and Linux
/// summary lines (using the average).
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            r"round-trip\s+min/avg/max/stddev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .find(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output.trim())))
}
