//! High-level trace API: resolve, probe, aggregate, enrich, report

use crate::enrich::{EnrichCache, Enricher, IpinfoSource, MetadataSource};
use crate::report::{build_rows, TraceReport};
use crate::resolve::resolve_target;
use crate::socket::{factory::create_probe_socket, ProbeSocket};
use crate::trace::{aggregate, DiscoveryEngine, TraceConfig, TraceError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Trace a target with default configuration.
///
/// ```no_run
/// # async fn example() -> Result<(), hoptrace::TraceError> {
/// let report = hoptrace::trace("example.com").await?;
/// for row in &report.rows {
///     println!("{} {:?}", row.hop.ttl, row.hop.addr);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn trace(target: &str) -> Result<TraceReport, TraceError> {
    let config = TraceConfig::builder()
        .target(target)
        .build()
        .map_err(TraceError::Config)?;
    trace_with_config(config).await
}

/// Trace with an explicit configuration
pub async fn trace_with_config(config: TraceConfig) -> Result<TraceReport, TraceError> {
    trace_with_cancellation(config, CancellationToken::new()).await
}

/// Trace with an explicit configuration and cancellation token.
///
/// Cancelling the token abandons in-flight probes and enrichment lookups;
/// hops gathered up to that point still make it into the report, with the
/// trace marked incomplete.
pub async fn trace_with_cancellation(
    mut config: TraceConfig,
    cancel: CancellationToken,
) -> Result<TraceReport, TraceError> {
    config.validate().map_err(TraceError::Config)?;

    let target_ip = match config.target_ip {
        Some(ip) => ip,
        None => {
            let ip = resolve_target(&config.target).await?;
            config.target_ip = Some(ip);
            ip
        }
    };
    let socket = create_probe_socket(target_ip, config.protocol, config.socket_mode, config.verbose)?;
    trace_with_socket(config, socket, None, cancel).await
}

/// Trace over a caller-provided socket and, optionally, metadata source.
///
/// This is the full-control entry point: tests and embedders can substitute
/// both the probe transport and the enrichment backend. When `source` is
/// `None` the configured metadata service is used.
pub async fn trace_with_socket(
    mut config: TraceConfig,
    socket: Box<dyn ProbeSocket>,
    source: Option<Arc<dyn MetadataSource>>,
    cancel: CancellationToken,
) -> Result<TraceReport, TraceError> {
    config.validate().map_err(TraceError::Config)?;
    let start = Instant::now();

    let target_ip = match config.target_ip {
        Some(ip) => ip,
        None => {
            let ip = resolve_target(&config.target).await?;
            config.target_ip = Some(ip);
            ip
        }
    };
    if config.target.is_empty() {
        config.target = target_ip.to_string();
    }

    let probe_mode = socket.mode();
    let engine = DiscoveryEngine::new(config.clone(), target_ip, socket, cancel.clone())?;
    let (mut events_rx, worker) = engine.discover();

    let mut events = Vec::new();
    while let Some(event) = events_rx.recv().await {
        events.push(event);
    }
    match worker.await {
        Ok(result) => result?,
        Err(e) => return Err(TraceError::Socket(format!("probe worker failed: {e}"))),
    }

    let trace = aggregate(events, config.max_hops);

    let enrichment = if config.enable_enrichment && !cancel.is_cancelled() {
        let source = match source {
            Some(source) => Some(source),
            // A client that cannot even be constructed is treated like any
            // other enrichment failure: the report ships without metadata.
            None => IpinfoSource::new(config.metadata_url.as_str(), config.enrichment_timeout)
                .ok()
                .map(|s| Arc::new(s) as Arc<dyn MetadataSource>),
        };
        match source {
            Some(source) => {
                let cache = Arc::new(EnrichCache::new());
                let enricher = Enricher::new(source, cache, config.enrichment_concurrency);
                let ips = trace.hops.iter().filter_map(|hop| hop.addr);
                tokio::select! {
                    results = enricher.enrich_all(ips) => results,
                    () = cancel.cancelled() => HashMap::new(),
                }
            }
            None => HashMap::new(),
        }
    } else {
        HashMap::new()
    };

    let rows = build_rows(&trace.hops, &enrichment);

    Ok(TraceReport {
        target: config.target,
        target_ip,
        rows,
        destination_reached: trace.destination_reached,
        probe_mode,
        total_duration: start.elapsed(),
    })
}
