//! Report assembly: hops plus enrichment into final ordered rows

use crate::enrich::EnrichmentRecord;
use crate::socket::ProbeMode;
use crate::trace::Hop;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// One row of the final report: a hop and its metadata, if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    /// The discovered hop
    pub hop: Hop,
    /// Metadata for the hop's responder; `None` for gaps or when enrichment
    /// was disabled
    pub enrichment: Option<EnrichmentRecord>,
}

impl ReportRow {
    /// Whether this row is the destination
    pub fn is_destination(&self) -> bool {
        self.hop.is_destination
    }
}

/// Final result of a trace run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    /// Target as given by the user
    pub target: String,
    /// Resolved target address
    pub target_ip: IpAddr,
    /// Report rows ordered by TTL
    pub rows: Vec<ReportRow>,
    /// Whether the destination answered
    pub destination_reached: bool,
    /// Probe mode that was actually used
    pub probe_mode: ProbeMode,
    /// Wall-clock duration of the whole run
    pub total_duration: Duration,
}

impl TraceReport {
    /// Number of rows in the report
    pub fn hop_count(&self) -> usize {
        self.rows.len()
    }

    /// The destination row, if the destination answered
    pub fn destination_row(&self) -> Option<&ReportRow> {
        self.rows.iter().find(|row| row.is_destination())
    }
}

/// Combine hops with their enrichment records into ordered report rows.
///
/// Pure function: hops stay in order, gaps keep `None` enrichment, and a
/// responder missing from the map simply yields a row without metadata
/// (defaults were already resolved upstream).
pub fn build_rows(
    hops: &[Hop],
    enrichment: &HashMap<IpAddr, EnrichmentRecord>,
) -> Vec<ReportRow> {
    hops.iter()
        .map(|hop| ReportRow {
            hop: hop.clone(),
            enrichment: hop.addr.and_then(|addr| enrichment.get(&addr).cloned()),
        })
        .collect()
}
