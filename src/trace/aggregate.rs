//! Hop aggregation: probe events to an ordered, gap-preserving hop list

use crate::trace::{ProbeEvent, ProbeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

/// One position along the discovered path
///
/// Hops are positional: the same responder appearing at two TTLs (a routing
/// loop) produces two hops. A hop with no responder is a gap — every probe at
/// that TTL timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// TTL this hop was discovered at
    pub ttl: u8,
    /// Responder address; `None` for a gap
    pub addr: Option<IpAddr>,
    /// Representative round-trip time: the minimum across this TTL's samples
    pub rtt: Option<Duration>,
    /// ICMP unreachable code, when a node reported the destination
    /// unreachable from here
    pub unreachable: Option<u8>,
    /// Whether this hop is the destination itself
    pub is_destination: bool,
}

impl Hop {
    fn gap(ttl: u8) -> Self {
        Hop {
            ttl,
            addr: None,
            rtt: None,
            unreachable: None,
            is_destination: false,
        }
    }

    /// Whether any probe at this TTL got an answer
    pub fn responded(&self) -> bool {
        self.addr.is_some()
    }

    /// Representative RTT in milliseconds
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt.map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// An aggregated trace: ordered hops plus completion status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Hops ordered by TTL, contiguous from 1
    pub hops: Vec<Hop>,
    /// Whether the destination answered
    pub destination_reached: bool,
}

/// Aggregate a probe event sequence into an ordered hop list.
///
/// Results are grouped by TTL. The first responder seen at a TTL provides the
/// hop's address; replies arriving later at the same TTL never replace it but
/// their RTTs still feed the minimum-RTT sample. The hop list stops at the
/// first TTL that reached the destination, or at the highest TTL probed when
/// the destination never answered (the trace is then incomplete). Gaps are
/// preserved so TTLs stay contiguous from 1.
pub fn aggregate<I>(events: I, max_hops: u8) -> Trace
where
    I: IntoIterator<Item = ProbeEvent>,
{
    let mut by_ttl: BTreeMap<u8, Hop> = BTreeMap::new();
    let mut highest_seen: u8 = 0;

    for event in events {
        if event.ttl == 0 || event.ttl > max_hops {
            continue;
        }
        highest_seen = highest_seen.max(event.ttl);
        let hop = by_ttl.entry(event.ttl).or_insert_with(|| Hop::gap(event.ttl));

        if let Some(rtt) = event.result.rtt() {
            hop.rtt = Some(hop.rtt.map_or(rtt, |r| r.min(rtt)));
        }
        if hop.addr.is_none() {
            hop.addr = event.result.responder();
            if let ProbeResult::Unreachable { code, .. } = event.result {
                hop.unreachable = Some(code);
            }
        }
        if matches!(event.result, ProbeResult::DestinationReached { .. }) {
            hop.is_destination = true;
        }
    }

    let destination_ttl = by_ttl
        .iter()
        .find(|(_, hop)| hop.is_destination)
        .map(|(ttl, _)| *ttl);

    let last_ttl = destination_ttl.unwrap_or(highest_seen);
    let hops = (1..=last_ttl)
        .map(|ttl| by_ttl.remove(&ttl).unwrap_or_else(|| Hop::gap(ttl)))
        .collect();

    Trace {
        hops,
        destination_reached: destination_ttl.is_some(),
    }
}
