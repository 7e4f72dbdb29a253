//! Run-scoped enrichment cache with per-IP single-flight semantics

use super::client::EnrichmentRecord;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Cache of enrichment records for one trace run
///
/// Created by the orchestrating caller at run start and dropped at run end;
/// there is no process-wide instance. Each IP maps to a `OnceCell`, so
/// concurrent callers for the same uncached IP share a single in-flight
/// lookup while distinct IPs proceed without contention.
#[derive(Debug, Default)]
pub struct EnrichCache {
    entries: Mutex<HashMap<IpAddr, Arc<OnceCell<EnrichmentRecord>>>>,
}

impl EnrichCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cell for an IP, creating it on first sight
    pub(crate) fn cell(&self, ip: IpAddr) -> Arc<OnceCell<EnrichmentRecord>> {
        let mut entries = self.entries.lock().expect("mutex poisoned");
        Arc::clone(entries.entry(ip).or_default())
    }

    /// Look up an already-resolved record
    pub fn get(&self, ip: IpAddr) -> Option<EnrichmentRecord> {
        let entries = self.entries.lock().expect("mutex poisoned");
        entries.get(&ip).and_then(|cell| cell.get().cloned())
    }

    /// Number of IPs with a resolved record
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("mutex poisoned");
        entries.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Whether no record has been resolved yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
