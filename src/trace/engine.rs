//! Probe engine: sends TTL-limited probes and streams per-hop results

use crate::socket::{ProbeInfo, ProbeResponse, ProbeSocket, ResponseType};
use crate::trace::{ProbeEvent, ProbeResult, TraceConfig, TraceError};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for one blocking read inside the receive loop; cancellation
/// and deadlines are honored within this interval.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Route discovery engine
///
/// Sends `probes_per_hop` probes at each TTL from 1 upward in deterministic
/// per-TTL rounds: every probe of a round is matched to a reply or times out
/// before the next TTL is probed. Results stream out as [`ProbeEvent`]s.
///
/// The engine keeps no state between runs; calling [`discover`] again starts
/// a fresh trace.
///
/// [`discover`]: DiscoveryEngine::discover
pub struct DiscoveryEngine {
    config: TraceConfig,
    target: IpAddr,
    socket: Arc<dyn ProbeSocket>,
    cancel: CancellationToken,
}

impl DiscoveryEngine {
    /// Create an engine for one target
    pub fn new(
        config: TraceConfig,
        target: IpAddr,
        socket: Box<dyn ProbeSocket>,
        cancel: CancellationToken,
    ) -> Result<Self, TraceError> {
        config.validate().map_err(TraceError::Config)?;
        Ok(Self {
            config,
            target,
            socket: Arc::from(socket),
            cancel,
        })
    }

    /// Start discovery, returning the event stream and the worker handle
    ///
    /// The channel yields events lazily as rounds complete and closes when
    /// discovery finishes, hits its deadline, or is cancelled. The handle
    /// resolves to `Err` only on fatal socket failures.
    pub fn discover(&self) -> (mpsc::Receiver<ProbeEvent>, JoinHandle<Result<(), TraceError>>) {
        let (tx, rx) = mpsc::channel(256);
        let socket = Arc::clone(&self.socket);
        let config = self.config.clone();
        let target = self.target;
        let cancel = self.cancel.clone();

        let handle =
            tokio::task::spawn_blocking(move || probe_loop(&*socket, &config, target, &cancel, &tx));
        (rx, handle)
    }
}

/// Classify a correlated reply relative to the trace target.
///
/// An Echo Reply from the target ends the trace; so does an unreachable
/// report sent by the target itself (it answered, there is nothing past it).
/// Unreachable reports from intermediate nodes flag the hop but do not stop
/// discovery.
fn classify(response: &ProbeResponse, target: IpAddr) -> ProbeResult {
    let from = response.from_addr;
    let rtt = response.rtt;
    match response.response_type {
        ResponseType::TimeExceeded => ProbeResult::Reply { from, rtt },
        ResponseType::EchoReply => {
            if from == target {
                ProbeResult::DestinationReached { from, rtt }
            } else {
                ProbeResult::Reply { from, rtt }
            }
        }
        ResponseType::DestinationUnreachable(code) => {
            if from == target {
                ProbeResult::DestinationReached { from, rtt }
            } else {
                ProbeResult::Unreachable { from, code, rtt }
            }
        }
    }
}

fn probe_loop(
    socket: &dyn ProbeSocket,
    config: &TraceConfig,
    target: IpAddr,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<ProbeEvent>,
) -> Result<(), TraceError> {
    let run_deadline = Instant::now() + config.run_deadline();
    let mut sequence: u16 = 1;

    for ttl in 1..=config.max_hops {
        if cancel.is_cancelled() || Instant::now() >= run_deadline {
            break;
        }

        socket
            .set_ttl(ttl)
            .map_err(|e| TraceError::Socket(format!("failed to set TTL {ttl}: {e}")))?;

        // Launch this round's probes.
        let mut outstanding: HashMap<u16, ProbeInfo> = HashMap::new();
        for query in 0..config.probes_per_hop {
            let probe = ProbeInfo {
                ttl,
                identifier: std::process::id() as u16,
                sequence,
                sent_at: Instant::now(),
            };
            socket
                .send_probe(target, probe.clone())
                .map_err(|e| TraceError::ProbeSend(e.to_string()))?;
            if config.verbose > 1 {
                eprintln!("sent probe ttl={ttl} seq={sequence}");
            }
            outstanding.insert(sequence, probe);
            sequence = sequence.wrapping_add(1);

            if query + 1 < config.probes_per_hop && !config.send_interval.is_zero() {
                std::thread::sleep(config.send_interval);
            }
        }

        // Drain the round: every probe is matched or timed out before the
        // next TTL is probed.
        let round_deadline = (Instant::now() + config.probe_timeout).min(run_deadline);
        let mut destination_seen = false;

        while !outstanding.is_empty() {
            let now = Instant::now();
            if now >= round_deadline || cancel.is_cancelled() {
                break;
            }
            let poll = round_deadline.duration_since(now).min(RECV_POLL_INTERVAL);

            match socket.recv_response(poll) {
                Ok(Some(response)) => {
                    // Replies to probes from an already-closed round arrive
                    // after their hop was recorded as a gap; drop them.
                    if outstanding.remove(&response.probe_info.sequence).is_none() {
                        continue;
                    }
                    let result = classify(&response, target);
                    if config.verbose > 1 {
                        eprintln!(
                            "reply ttl={} seq={} from={} rtt={:?}",
                            response.probe_info.ttl,
                            response.probe_info.sequence,
                            response.from_addr,
                            response.rtt
                        );
                    }
                    if matches!(result, ProbeResult::DestinationReached { .. }) {
                        destination_seen = true;
                    }
                    let event = ProbeEvent {
                        ttl: response.probe_info.ttl,
                        result,
                    };
                    if tx.blocking_send(event).is_err() {
                        // Receiver dropped; nothing left to report to.
                        return Ok(());
                    }
                }
                Ok(None) => continue,
                Err(e) => return Err(TraceError::Socket(e.to_string())),
            }
        }

        // Whatever is still outstanding has timed out.
        for probe in outstanding.into_values() {
            let event = ProbeEvent {
                ttl: probe.ttl,
                result: ProbeResult::Timeout,
            };
            if tx.blocking_send(event).is_err() {
                return Ok(());
            }
        }

        if destination_seen {
            break;
        }
    }

    Ok(())
}
