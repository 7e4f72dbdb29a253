//! IPv4 ICMP probe sockets (datagram and raw)

use super::{
    IpVersion, ProbeInfo, ProbeMode, ProbeProtocol, ProbeResponse, ProbeSocket, ResponseType,
    SocketMode,
};
use anyhow::{Context, Result};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{echo_reply, IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util::checksum as pnet_checksum;
use socket2::Socket as Socket2;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Size of the ICMP echo payload
const ICMP_ECHO_PAYLOAD_SIZE: usize = 16;
/// ICMP error header length in bytes
const ICMP_ERROR_HEADER_LEN_BYTES: usize = 8;
/// IPv4 header minimum length in bytes
const IPV4_HEADER_MIN_LEN_BYTES: usize = 20;
/// Upper bound for a single blocking read on the socket
const MAX_READ_SLICE: Duration = Duration::from_millis(100);

/// Probe bookkeeping shared by both socket flavors
struct ProbeLedger {
    identifier: u16,
    outstanding: Mutex<HashMap<u16, ProbeInfo>>,
}

impl ProbeLedger {
    fn new() -> Self {
        ProbeLedger {
            identifier: std::process::id() as u16,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, probe: ProbeInfo) {
        self.outstanding
            .lock()
            .expect("mutex poisoned")
            .insert(probe.sequence, probe);
    }

    fn claim(&self, sequence: u16) -> Option<ProbeInfo> {
        self.outstanding
            .lock()
            .expect("mutex poisoned")
            .remove(&sequence)
    }

    /// Build an ICMP Echo Request carrying our identifier and the probe's
    /// sequence number, with both echoed in the payload for validation.
    fn build_echo_request(&self, sequence: u16) -> Result<Vec<u8>> {
        let mut buf =
            vec![0u8; MutableEchoRequestPacket::minimum_packet_size() + ICMP_ECHO_PAYLOAD_SIZE];
        let mut echo = MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| anyhow::anyhow!("failed to create ICMP packet"))?;

        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(pnet::packet::icmp::IcmpCode(0));
        echo.set_identifier(self.identifier);
        echo.set_sequence_number(sequence);

        let tag = (u32::from(self.identifier)) << 16 | u32::from(sequence);
        let mut payload = [0u8; ICMP_ECHO_PAYLOAD_SIZE];
        payload[..4].copy_from_slice(&tag.to_be_bytes());
        echo.set_payload(&payload);

        let checksum = pnet_checksum(echo.packet(), 1);
        echo.set_checksum(checksum);
        drop(echo);
        Ok(buf)
    }

    /// Match an inbound packet against outstanding probes.
    ///
    /// `packet_data` starts at the IPv4 header for both datagram and raw
    /// receives on Linux.
    fn match_reply(
        &self,
        packet_data: &[u8],
        from_addr: IpAddr,
        recv_time: Instant,
    ) -> Option<ProbeResponse> {
        let outer = Ipv4Packet::new(packet_data)?;
        let icmp_data = outer.payload();
        let icmp_packet = IcmpPacket::new(icmp_data)?;

        match icmp_packet.get_icmp_type() {
            IcmpTypes::TimeExceeded | IcmpTypes::DestinationUnreachable => {
                // The error quotes the original datagram; dig our echo out of it.
                if icmp_data.len() < ICMP_ERROR_HEADER_LEN_BYTES {
                    return None;
                }
                let quoted = &icmp_data[ICMP_ERROR_HEADER_LEN_BYTES..];
                if quoted.len() < IPV4_HEADER_MIN_LEN_BYTES {
                    return None;
                }

                let inner = Ipv4Packet::new(quoted)?;
                let original = inner.payload();
                if original.len() < 8 {
                    return None;
                }

                let original_type = original[0];
                let original_id = u16::from_be_bytes([original[4], original[5]]);
                let original_seq = u16::from_be_bytes([original[6], original[7]]);

                if original_type != IcmpTypes::EchoRequest.0 || original_id != self.identifier {
                    return None;
                }

                let probe_info = self.claim(original_seq)?;
                let response_type = match icmp_packet.get_icmp_type() {
                    IcmpTypes::TimeExceeded => ResponseType::TimeExceeded,
                    IcmpTypes::DestinationUnreachable => {
                        ResponseType::DestinationUnreachable(icmp_packet.get_icmp_code().0)
                    }
                    _ => unreachable!(),
                };
                let rtt = recv_time.duration_since(probe_info.sent_at);
                Some(ProbeResponse {
                    from_addr,
                    response_type,
                    probe_info,
                    rtt,
                })
            }
            IcmpTypes::EchoReply => {
                let reply = echo_reply::EchoReplyPacket::new(icmp_packet.packet())?;
                if reply.get_identifier() != self.identifier {
                    return None;
                }
                let probe_info = self.claim(reply.get_sequence_number())?;
                let rtt = recv_time.duration_since(probe_info.sent_at);
                Some(ProbeResponse {
                    from_addr,
                    response_type: ResponseType::EchoReply,
                    probe_info,
                    rtt,
                })
            }
            _ => None,
        }
    }
}

/// Blocking receive loop shared by both socket flavors
fn recv_matching(
    socket: &Socket2,
    ledger: &ProbeLedger,
    timeout: Duration,
) -> Result<Option<ProbeResponse>> {
    let mut recv_buf = [MaybeUninit::uninit(); 1500];
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        socket.set_read_timeout(Some(remaining.min(MAX_READ_SLICE)))?;

        match socket.recv_from(&mut recv_buf) {
            Ok((size, socket_addr)) => {
                let recv_time = Instant::now();
                let from_addr = match socket_addr.as_socket_ipv4() {
                    Some(s) => IpAddr::V4(*s.ip()),
                    None => continue,
                };

                let initialized: &[MaybeUninit<u8>] = &recv_buf[..size];
                let packet_data: &[u8] =
                    unsafe { &*(initialized as *const [MaybeUninit<u8>] as *const [u8]) };

                if let Some(response) = ledger.match_reply(packet_data, from_addr, recv_time) {
                    return Ok(Some(response));
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// DGRAM ICMP socket for IPv4
///
/// The kernel rewrites the echo identifier for datagram ICMP, but it also
/// demultiplexes replies per socket, so sequence matching still holds.
pub struct DgramIcmpV4Socket {
    socket: Arc<Socket2>,
    mode: ProbeMode,
    ledger: ProbeLedger,
}

impl DgramIcmpV4Socket {
    /// Wrap an already-created datagram ICMP socket
    pub fn new(socket: Socket2) -> Result<Self> {
        socket.set_read_timeout(Some(MAX_READ_SLICE))?;

        Ok(DgramIcmpV4Socket {
            socket: Arc::new(socket),
            mode: ProbeMode {
                ip_version: IpVersion::V4,
                protocol: ProbeProtocol::Icmp,
                socket_mode: SocketMode::Dgram,
            },
            ledger: ProbeLedger::new(),
        })
    }
}

impl ProbeSocket for DgramIcmpV4Socket {
    fn mode(&self) -> ProbeMode {
        self.mode
    }

    fn set_ttl(&self, ttl: u8) -> Result<()> {
        self.socket
            .set_ttl_v4(u32::from(ttl))
            .context("failed to set TTL")?;
        Ok(())
    }

    fn send_probe(&self, target: IpAddr, probe_info: ProbeInfo) -> Result<()> {
        let target_v4 = match target {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => {
                return Err(anyhow::anyhow!("IPv6 target not supported by IPv4 socket"))
            }
        };

        let packet = self.ledger.build_echo_request(probe_info.sequence)?;
        let target_addr = SocketAddr::V4(SocketAddrV4::new(target_v4, 0));
        self.socket
            .send_to(&packet, &target_addr.into())
            .context("failed to send ICMP packet")?;

        self.ledger.track(probe_info);
        Ok(())
    }

    fn recv_response(&self, timeout: Duration) -> Result<Option<ProbeResponse>> {
        recv_matching(&self.socket, &self.ledger, timeout)
    }
}

/// Raw ICMP socket for IPv4
///
/// Builds the full IP header itself so the TTL travels inside each packet
/// rather than as socket state.
pub struct RawIcmpV4Socket {
    socket: Arc<Socket2>,
    mode: ProbeMode,
    ledger: ProbeLedger,
    ttl: Mutex<u8>,
}

impl RawIcmpV4Socket {
    /// Wrap an already-created raw ICMP socket
    pub fn new(socket: Socket2) -> Result<Self> {
        socket.set_read_timeout(Some(MAX_READ_SLICE))?;

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                let enable: i32 = 1;
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_HDRINCL,
                    std::ptr::addr_of!(enable).cast(),
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }

        Ok(RawIcmpV4Socket {
            socket: Arc::new(socket),
            mode: ProbeMode {
                ip_version: IpVersion::V4,
                protocol: ProbeProtocol::Icmp,
                socket_mode: SocketMode::Raw,
            },
            ledger: ProbeLedger::new(),
            ttl: Mutex::new(1),
        })
    }

    fn build_ipv4_packet(&self, target: Ipv4Addr, ttl: u8, icmp_payload: &[u8]) -> Vec<u8> {
        use pnet::packet::ip::IpNextHeaderProtocols;
        use pnet::packet::ipv4::MutableIpv4Packet;

        let total_len = IPV4_HEADER_MIN_LEN_BYTES + icmp_payload.len();
        let mut packet = vec![0u8; total_len];

        if let Some(mut ipv4) = MutableIpv4Packet::new(&mut packet) {
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(total_len as u16);
            ipv4.set_identification(rand::random::<u16>());
            ipv4.set_ttl(ttl);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            // Kernel fills in the source address.
            ipv4.set_source(Ipv4Addr::UNSPECIFIED);
            ipv4.set_destination(target);
            ipv4.set_payload(icmp_payload);

            let checksum = pnet::packet::ipv4::checksum(&ipv4.to_immutable());
            ipv4.set_checksum(checksum);
        }

        packet
    }
}

impl ProbeSocket for RawIcmpV4Socket {
    fn mode(&self) -> ProbeMode {
        self.mode
    }

    fn set_ttl(&self, ttl: u8) -> Result<()> {
        *self.ttl.lock().expect("mutex poisoned") = ttl;
        Ok(())
    }

    fn send_probe(&self, target: IpAddr, probe_info: ProbeInfo) -> Result<()> {
        let target_v4 = match target {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => {
                return Err(anyhow::anyhow!("IPv6 target not supported by IPv4 socket"))
            }
        };

        let echo = self.ledger.build_echo_request(probe_info.sequence)?;
        let ttl = *self.ttl.lock().expect("mutex poisoned");
        let ip_packet = self.build_ipv4_packet(target_v4, ttl, &echo);

        let target_addr = SocketAddr::V4(SocketAddrV4::new(target_v4, 0));
        self.socket
            .send_to(&ip_packet, &target_addr.into())
            .context("failed to send raw ICMP packet")?;

        self.ledger.track(probe_info);
        Ok(())
    }

    fn recv_response(&self, timeout: Duration) -> Result<Option<ProbeResponse>> {
        recv_matching(&self.socket, &self.ledger, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_probe(sequence: u16) -> ProbeLedger {
        let ledger = ProbeLedger::new();
        ledger.track(ProbeInfo {
            ttl: 3,
            identifier: ledger.identifier,
            sequence,
            sent_at: Instant::now(),
        });
        ledger
    }

    /// Wrap an ICMP message in an IPv4 header the way the kernel hands it up.
    fn wrap_in_ipv4(src: Ipv4Addr, icmp: &[u8]) -> Vec<u8> {
        use pnet::packet::ip::IpNextHeaderProtocols;
        use pnet::packet::ipv4::MutableIpv4Packet;

        let total = IPV4_HEADER_MIN_LEN_BYTES + icmp.len();
        let mut buf = vec![0u8; total];
        let mut ipv4 = MutableIpv4Packet::new(&mut buf).unwrap();
        ipv4.set_version(4);
        ipv4.set_header_length(5);
        ipv4.set_total_length(total as u16);
        ipv4.set_ttl(64);
        ipv4.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
        ipv4.set_source(src);
        ipv4.set_destination(Ipv4Addr::new(192, 0, 2, 1));
        ipv4.set_payload(icmp);
        drop(ipv4);
        buf
    }

    /// Build a Time Exceeded message quoting the given echo request.
    fn time_exceeded_quoting(echo: &[u8]) -> Vec<u8> {
        let quoted = wrap_in_ipv4(Ipv4Addr::new(192, 0, 2, 1), echo);
        let mut icmp = vec![0u8; ICMP_ERROR_HEADER_LEN_BYTES + quoted.len()];
        icmp[0] = IcmpTypes::TimeExceeded.0;
        icmp[ICMP_ERROR_HEADER_LEN_BYTES..].copy_from_slice(&quoted);
        icmp
    }

    #[test]
    fn time_exceeded_reply_matches_probe() {
        let ledger = ledger_with_probe(7);
        let echo = ledger.build_echo_request(7).unwrap();
        let icmp = time_exceeded_quoting(&echo);
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let packet = wrap_in_ipv4(router, &icmp);

        let response = ledger
            .match_reply(&packet, IpAddr::V4(router), Instant::now())
            .expect("reply should match");
        assert_eq!(response.response_type, ResponseType::TimeExceeded);
        assert_eq!(response.from_addr, IpAddr::V4(router));
        assert_eq!(response.probe_info.ttl, 3);
        assert_eq!(response.probe_info.sequence, 7);
    }

    #[test]
    fn foreign_identifier_is_ignored() {
        let ledger = ledger_with_probe(7);
        let mut echo = ledger.build_echo_request(7).unwrap();
        // Corrupt the identifier so the quoted echo looks like someone else's.
        echo[4] ^= 0xff;
        let icmp = time_exceeded_quoting(&echo);
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let packet = wrap_in_ipv4(router, &icmp);

        assert!(ledger
            .match_reply(&packet, IpAddr::V4(router), Instant::now())
            .is_none());
        // Probe is still outstanding.
        assert!(ledger.claim(7).is_some());
    }

    #[test]
    fn echo_reply_matches_probe() {
        let ledger = ledger_with_probe(9);
        let mut echo = ledger.build_echo_request(9).unwrap();
        // Flip the type to Echo Reply and clear the checksum; matching does
        // not verify checksums.
        echo[0] = IcmpTypes::EchoReply.0;
        echo[2] = 0;
        echo[3] = 0;
        let target = Ipv4Addr::new(192, 0, 2, 1);
        let packet = wrap_in_ipv4(target, &echo);

        let response = ledger
            .match_reply(&packet, IpAddr::V4(target), Instant::now())
            .expect("echo reply should match");
        assert_eq!(response.response_type, ResponseType::EchoReply);
    }

    #[test]
    fn truncated_packet_is_ignored() {
        let ledger = ledger_with_probe(1);
        let packet = wrap_in_ipv4(Ipv4Addr::new(10, 0, 0, 1), &[11, 0, 0, 0]);
        assert!(ledger
            .match_reply(&packet, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Instant::now())
            .is_none());
    }
}
