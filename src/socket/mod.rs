//! Socket abstraction for TTL-limited probing
//!
//! The discovery engine talks to the network through the [`ProbeSocket`]
//! trait, so tests can substitute a scripted socket and the ICMP plumbing
//! stays in one place.

use anyhow::Result;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub mod factory;
pub mod icmp_v4;
pub mod utils;

use serde::{Deserialize, Serialize};

/// IP version to use for probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4 addressing
    V4,
    /// IPv6 addressing (not yet supported)
    V6,
}

/// Protocol to use for probing
///
/// ICMP echo probes are the implemented transport. UDP is accepted as a
/// configuration choice but the factory currently declines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeProtocol {
    /// ICMP Echo Request probes
    Icmp,
    /// UDP probes with high port numbers (not yet implemented)
    Udp,
}

impl ProbeProtocol {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ProbeProtocol::Icmp => "ICMP",
            ProbeProtocol::Udp => "UDP",
        }
    }
}

/// Socket mode, which determines the permissions required
///
/// - **Raw**: full packet control, requires root or CAP_NET_RAW
/// - **Dgram**: ICMP datagram socket, permissions vary by platform (on Linux
///   it needs root or a configured `net.ipv4.ping_group_range`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketMode {
    /// Raw socket
    Raw,
    /// Datagram socket for ICMP
    Dgram,
}

impl SocketMode {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SocketMode::Raw => "Raw",
            SocketMode::Dgram => "Datagram",
        }
    }
}

/// Combined probe configuration actually in use by a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMode {
    /// IP version in use
    pub ip_version: IpVersion,
    /// Probe protocol in use
    pub protocol: ProbeProtocol,
    /// Socket mode in use
    pub socket_mode: SocketMode,
}

impl ProbeMode {
    /// Get a human-readable description of this mode
    pub fn description(&self) -> String {
        format!(
            "{} {} {}",
            self.socket_mode.description(),
            match self.ip_version {
                IpVersion::V4 => self.protocol.description().to_string(),
                IpVersion::V6 => format!("{}v6", self.protocol.description()),
            },
            match self.ip_version {
                IpVersion::V4 => "IPv4",
                IpVersion::V6 => "IPv6",
            }
        )
    }
}

/// Information about one outbound probe
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    /// Time-to-live carried by the probe packet
    pub ttl: u8,
    /// ICMP identifier, shared by all probes of one run
    pub identifier: u16,
    /// Sequence number, unique per probe within a run
    pub sequence: u16,
    /// When the probe was sent
    pub sent_at: Instant,
}

/// Kind of reply a probe elicited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// ICMP Time Exceeded (TTL expired at an intermediate router)
    TimeExceeded,
    /// ICMP Destination Unreachable, with the ICMP code
    DestinationUnreachable(u8),
    /// ICMP Echo Reply (the probed host answered)
    EchoReply,
}

/// A reply correlated back to the probe that triggered it
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    /// Address that sent the reply
    pub from_addr: IpAddr,
    /// Kind of reply
    pub response_type: ResponseType,
    /// The probe this reply was matched to
    pub probe_info: ProbeInfo,
    /// Round-trip time
    pub rtt: Duration,
}

/// Trait for probe sockets
///
/// Implementations correlate inbound packets to previously sent probes by
/// ICMP identifier and sequence number; anything that does not match a live
/// probe is discarded.
pub trait ProbeSocket: Send + Sync {
    /// Get the mode this socket is operating in
    fn mode(&self) -> ProbeMode;

    /// Set the TTL for subsequently sent probes
    fn set_ttl(&self, ttl: u8) -> Result<()>;

    /// Send one probe towards the target
    fn send_probe(&self, target: IpAddr, probe_info: ProbeInfo) -> Result<()>;

    /// Wait up to `timeout` for a reply to any outstanding probe
    ///
    /// Returns `Ok(None)` when the timeout elapses without a matching reply.
    fn recv_response(&self, timeout: Duration) -> Result<Option<ProbeResponse>>;
}
