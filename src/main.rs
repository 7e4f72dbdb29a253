//! hoptrace - traceroute with AS, country, and provider annotation per hop
//!
//! Command-line interface for the hoptrace library.

use anyhow::Result;
use clap::Parser;
use hoptrace::{ProbeProtocol, ReportRow, SocketMode, TraceConfig, TraceError, TraceReport, UNKNOWN};
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Traceroute with AS, country, and provider annotation per hop",
    long_about = None
)]
struct Args {
    /// Target hostname or IP address
    host: String,

    /// Maximum number of hops
    #[clap(short = 'm', long, default_value_t = 30)]
    max_hops: u8,

    /// Number of probes per hop
    #[clap(short = 'q', long = "queries", default_value_t = 1)]
    probes_per_hop: u8,

    /// Timeout for individual probes in milliseconds
    #[clap(long, default_value_t = 1000)]
    probe_timeout_ms: u64,

    /// Hard deadline for the whole run in milliseconds (derived from the
    /// per-hop timeouts when not given)
    #[clap(short = 'W', long)]
    overall_timeout_ms: Option<u64>,

    /// Pause between successive probe sends in milliseconds
    #[clap(short = 'i', long, default_value_t = 5)]
    send_interval_ms: u64,

    /// Protocol to use for probing
    #[clap(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Socket mode to use
    #[clap(long, value_enum)]
    socket_mode: Option<SocketModeArg>,

    /// Disable AS/country/provider annotation
    #[clap(long)]
    no_enrich: bool,

    /// Base URL of the metadata service
    #[clap(long, default_value = "https://ipinfo.io")]
    lookup_url: String,

    /// Output the report as JSON
    #[clap(long)]
    json: bool,

    /// Increase diagnostic verbosity (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ProtocolArg {
    Icmp,
    Udp,
}

impl From<ProtocolArg> for ProbeProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Icmp => ProbeProtocol::Icmp,
            ProtocolArg::Udp => ProbeProtocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SocketModeArg {
    Raw,
    Dgram,
}

impl From<SocketModeArg> for SocketMode {
    fn from(arg: SocketModeArg) -> Self {
        match arg {
            SocketModeArg::Raw => SocketMode::Raw,
            SocketModeArg::Dgram => SocketMode::Dgram,
        }
    }
}

/// JSON output structure for a single hop
#[derive(Debug, serde::Serialize)]
struct JsonHop {
    ttl: u8,
    address: Option<String>,
    rtt_ms: Option<f64>,
    asn: Option<String>,
    country: Option<String>,
    provider: Option<String>,
    unreachable_code: Option<u8>,
    destination: bool,
}

/// JSON output structure for the entire report
#[derive(Debug, serde::Serialize)]
struct JsonOutput {
    version: String,
    target: String,
    target_ip: String,
    destination_reached: bool,
    probe_mode: String,
    total_duration_ms: u128,
    hops: Vec<JsonHop>,
}

fn main() {
    // Current-thread runtime keeps startup light; the probe loop runs on a
    // blocking worker anyway.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    if let Err(e) = runtime.block_on(run()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    if args.verbose > 0
        && !hoptrace::socket::utils::is_root()
        && !hoptrace::socket::utils::has_non_root_capability()
    {
        eprintln!("warning: this platform usually needs root to send probes");
    }

    let mut builder = TraceConfig::builder()
        .target(args.host.as_str())
        .max_hops(args.max_hops)
        .probes_per_hop(args.probes_per_hop)
        .probe_timeout(Duration::from_millis(args.probe_timeout_ms))
        .send_interval(Duration::from_millis(args.send_interval_ms))
        .enable_enrichment(!args.no_enrich)
        .metadata_url(args.lookup_url.as_str())
        .verbose(args.verbose);
    if let Some(ms) = args.overall_timeout_ms {
        builder = builder.overall_timeout(Duration::from_millis(ms));
    }
    if let Some(protocol) = args.protocol {
        builder = builder.protocol(protocol.into());
    }
    if let Some(mode) = args.socket_mode {
        builder = builder.socket_mode(mode.into());
    }
    let config = builder.build().map_err(TraceError::Config)?;

    let report = hoptrace::trace_with_config(config).await?;

    if args.json {
        print_json(&report)?;
    } else {
        print_table(&report);
    }

    Ok(())
}

fn print_json(report: &TraceReport) -> Result<()> {
    let output = JsonOutput {
        version: env!("CARGO_PKG_VERSION").to_string(),
        target: report.target.clone(),
        target_ip: report.target_ip.to_string(),
        destination_reached: report.destination_reached,
        probe_mode: report.probe_mode.description(),
        total_duration_ms: report.total_duration.as_millis(),
        hops: report.rows.iter().map(json_hop).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn json_hop(row: &ReportRow) -> JsonHop {
    JsonHop {
        ttl: row.hop.ttl,
        address: row.hop.addr.map(|a| a.to_string()),
        rtt_ms: row.hop.rtt_ms(),
        asn: row.enrichment.as_ref().map(|e| e.asn.clone()),
        country: row.enrichment.as_ref().map(|e| e.country.clone()),
        provider: row.enrichment.as_ref().map(|e| e.provider.clone()),
        unreachable_code: row.hop.unreachable,
        destination: row.is_destination(),
    }
}

fn print_table(report: &TraceReport) {
    println!(
        "Trace to {} ({}), {} hop{} [{}]",
        report.target,
        report.target_ip,
        report.hop_count(),
        if report.hop_count() == 1 { "" } else { "s" },
        report.probe_mode.description()
    );
    println!(
        "{:<5}{:<18}{:>9}   {:<10}{:<9}{}",
        "No", "Address", "RTT", "AS", "Country", "Provider"
    );
    println!("{}", "-".repeat(72));

    for row in &report.rows {
        let address = match row.hop.addr {
            Some(addr) => addr.to_string(),
            None => "*".to_string(),
        };
        let rtt = match row.hop.rtt_ms() {
            Some(ms) => format!("{ms:.1} ms"),
            None => "*".to_string(),
        };
        let (asn, country, provider) = match &row.enrichment {
            Some(e) => (e.asn.as_str(), e.country.as_str(), e.provider.as_str()),
            None if row.hop.addr.is_some() => (UNKNOWN, UNKNOWN, UNKNOWN),
            None => ("", "", ""),
        };
        let mut line = format!(
            "{:<5}{:<18}{:>9}   {:<10}{:<9}{}",
            row.hop.ttl, address, rtt, asn, country, provider
        );
        if let Some(code) = row.hop.unreachable {
            line.push_str(&format!("  [unreachable, code {code}]"));
        }
        if row.is_destination() {
            line.push_str("  <- destination");
        }
        println!("{}", line.trim_end());
    }

    if !report.destination_reached {
        println!("\nTrace incomplete: destination did not answer.");
    }
}
