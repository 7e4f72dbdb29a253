//! Probe socket creation with privilege-aware fallback

use super::icmp_v4::{DgramIcmpV4Socket, RawIcmpV4Socket};
use super::{IpVersion, ProbeMode, ProbeProtocol, ProbeSocket, SocketMode};
use crate::trace::TraceError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

// Common POSIX error codes
const EPERM: i32 = 1;
const EACCES: i32 = 13;

fn is_permission_error(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::PermissionDenied)
        || err
            .raw_os_error()
            .map(|code| code == EPERM || code == EACCES)
            .unwrap_or(false)
}

fn try_create_socket(mode: ProbeMode) -> Result<Socket, std::io::Error> {
    let domain = match mode.ip_version {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    };
    let proto = match mode.ip_version {
        IpVersion::V4 => Protocol::ICMPV4,
        IpVersion::V6 => Protocol::ICMPV6,
    };
    let socket_type = match mode.socket_mode {
        SocketMode::Raw => Type::RAW,
        SocketMode::Dgram => Type::DGRAM,
    };

    Socket::new(domain, socket_type, Some(proto))
}

/// Create a probe socket for the target, trying the most capable mode first
/// and falling back to less privileged ones.
///
/// Permission failures across every candidate surface as a structured
/// [`TraceError::InsufficientPermissions`] so the caller can print a remedy.
pub fn create_probe_socket(
    target: IpAddr,
    preferred_protocol: Option<ProbeProtocol>,
    preferred_mode: Option<SocketMode>,
    verbose: u8,
) -> Result<Box<dyn ProbeSocket>, TraceError> {
    if target.is_ipv6() {
        return Err(TraceError::Ipv6NotSupported);
    }

    match preferred_protocol {
        None | Some(ProbeProtocol::Icmp) => {}
        Some(ProbeProtocol::Udp) => {
            return Err(TraceError::NotImplemented {
                feature: "UDP probing".to_string(),
            });
        }
    }

    let candidate_modes = match preferred_mode {
        Some(mode) => vec![mode],
        None => vec![SocketMode::Raw, SocketMode::Dgram],
    };
    let user_specified_mode = preferred_mode.is_some();

    let mut permission_denied = false;
    let mut last_error: Option<std::io::Error> = None;

    for socket_mode in candidate_modes {
        let mode = ProbeMode {
            ip_version: IpVersion::V4,
            protocol: ProbeProtocol::Icmp,
            socket_mode,
        };

        match try_create_socket(mode) {
            Ok(socket) => {
                if verbose > 0 {
                    eprintln!("using {} mode", mode.description());
                }
                let probe_socket: Box<dyn ProbeSocket> = match socket_mode {
                    SocketMode::Raw => Box::new(
                        RawIcmpV4Socket::new(socket)
                            .map_err(|e| TraceError::Socket(e.to_string()))?,
                    ),
                    SocketMode::Dgram => {
                        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
                        socket
                            .bind(&bind_addr.into())
                            .map_err(|e| TraceError::Socket(format!("failed to bind: {e}")))?;
                        Box::new(
                            DgramIcmpV4Socket::new(socket)
                                .map_err(|e| TraceError::Socket(e.to_string()))?,
                        )
                    }
                };
                return Ok(probe_socket);
            }
            Err(io_err) => {
                if is_permission_error(&io_err) {
                    permission_denied = true;
                    if verbose > 0 && !user_specified_mode {
                        eprintln!(
                            "{} ICMP not permitted, trying fallback",
                            socket_mode.description()
                        );
                    }
                } else if verbose > 0 {
                    eprintln!("failed to create {}: {io_err}", mode.description());
                }
                last_error = Some(io_err);
            }
        }
    }

    if permission_denied {
        Err(TraceError::InsufficientPermissions {
            required: "root, CAP_NET_RAW, or a configured ping group".to_string(),
            suggestion: format!(
                "run with sudo, or on Linux: sudo sysctl -w net.ipv4.ping_group_range=\"0 65535\"; \
                 invoked as: {}",
                std::env::args().collect::<Vec<_>>().join(" ")
            ),
        })
    } else {
        Err(TraceError::Socket(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no probe socket could be created".to_string()),
        ))
    }
}
