//! ICMP echo probe

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, instrument};

use super::Prober;
use crate::error::{PoolError, Result};
use crate::node::Node;

/// Size of the echo request: 8-byte header plus 32 zero bytes
pub const ECHO_PACKET_LEN: usize = 40;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Build an echo request with identifier 1 and sequence 1
pub fn echo_request(icmp_type: u8) -> [u8; ECHO_PACKET_LEN] {
    let mut packet = [0u8; ECHO_PACKET_LEN];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&1u16.to_be_bytes());
    packet[6..8].copy_from_slice(&1u16.to_be_bytes());
    // The kernel fills in the ICMPv6 checksum
    if icmp_type == ICMPV4_ECHO_REQUEST {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Sends one echo request and waits for any reply
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for PingProber {
    #[instrument(skip(self, node), fields(host = %node.host()))]
    async fn probe(&self, node: &Node) -> Result<Duration> {
        let addr = tokio::net::lookup_host((node.host(), 0))
            .await
            .map_err(|e| PoolError::Probe(format!("resolve {} failed: {}", node.host(), e)))?
            .next()
            .ok_or_else(|| PoolError::Probe(format!("no address for {}", node.host())))?;

        let timeout = self.timeout;
        let elapsed = tokio::task::spawn_blocking(move || ping(addr, timeout))
            .await
            .map_err(|e| PoolError::Probe(format!("ping task failed: {}", e)))??;

        debug!("Ping probe succeeded in {:?}", elapsed);
        Ok(elapsed)
    }

    fn name(&self) -> &str {
        "ping"
    }
}

fn open_socket(ip: IpAddr) -> std::io::Result<Socket> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => Ok(socket),
        // Unprivileged ICMP sockets need no CAP_NET_RAW on Linux
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Socket::new(domain, Type::DGRAM, Some(protocol))
        }
        Err(e) => Err(e),
    }
}

fn ping(addr: SocketAddr, timeout: Duration) -> Result<Duration> {
    let icmp_type = match addr.ip() {
        IpAddr::V4(_) => ICMPV4_ECHO_REQUEST,
        IpAddr::V6(_) => ICMPV6_ECHO_REQUEST,
    };

    let socket = open_socket(addr.ip())?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    socket.connect(&SockAddr::from(addr))?;

    let start = Instant::now();
    socket.send(&echo_request(icmp_type))?;

    let mut buf = [0u8; 128];
    match (&socket).read(&mut buf) {
        Ok(_) => Ok(start.elapsed()),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            Err(PoolError::ProbeTimeout(timeout))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_v4_layout() {
        let packet = echo_request(ICMPV4_ECHO_REQUEST);
        assert_eq!(packet.len(), 40);
        assert_eq!(&packet[..8], &[8, 0, 247, 253, 0, 1, 0, 1]);
        assert!(packet[8..].iter().all(|&b| b == 0));
        // A packet with a correct checksum sums to zero
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_echo_request_v6_leaves_checksum_to_kernel() {
        let packet = echo_request(ICMPV6_ECHO_REQUEST);
        assert_eq!(&packet[..8], &[128, 0, 0, 0, 0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_ping_unresolvable_host() {
        let node = Node::parse("trojan://pw@host.invalid:443").unwrap();
        let prober = PingProber::new(Duration::from_millis(500));
        assert!(prober.probe(&node).await.is_err());
    }
}
