//! Configuration for a trace run

use crate::socket::{ProbeProtocol, SocketMode};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Upper bound on the derived per-run deadline
const MAX_RUN_DEADLINE: Duration = Duration::from_secs(60);

/// Default metadata service queried for per-hop enrichment
pub const DEFAULT_METADATA_URL: &str = "https://ipinfo.io";

/// Configuration for one trace run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Target hostname or IP address as given
    pub target: String,
    /// Resolved target address, if already known
    pub target_ip: Option<IpAddr>,
    /// Maximum number of hops to probe (default: 30)
    pub max_hops: u8,
    /// Probes sent at each TTL (default: 1)
    pub probes_per_hop: u8,
    /// Timeout for an individual probe (default: 1000ms)
    pub probe_timeout: Duration,
    /// Pause between successive sends (default: 5ms)
    pub send_interval: Duration,
    /// Hard deadline for the whole run; derived from the per-hop timeouts
    /// when unset
    pub overall_timeout: Option<Duration>,
    /// Preferred probe protocol
    pub protocol: Option<ProbeProtocol>,
    /// Preferred socket mode
    pub socket_mode: Option<SocketMode>,
    /// Annotate hops with AS/country/provider metadata (default: true)
    pub enable_enrichment: bool,
    /// Base URL of the metadata service
    pub metadata_url: String,
    /// Concurrent enrichment lookups in flight (default: 8)
    pub enrichment_concurrency: usize,
    /// Timeout for one metadata lookup (default: 5s)
    pub enrichment_timeout: Duration,
    /// Diagnostic verbosity (0 = quiet)
    pub verbose: u8,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            target_ip: None,
            max_hops: 30,
            probes_per_hop: 1,
            probe_timeout: Duration::from_millis(1000),
            send_interval: Duration::from_millis(5),
            overall_timeout: None,
            protocol: None,
            socket_mode: None,
            enable_enrichment: true,
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            enrichment_concurrency: 8,
            enrichment_timeout: Duration::from_secs(5),
            verbose: 0,
        }
    }
}

impl TraceConfig {
    /// Create a new configuration builder
    pub fn builder() -> TraceConfigBuilder {
        TraceConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() && self.target_ip.is_none() {
            return Err("target must be specified".to_string());
        }
        if self.max_hops < 1 {
            return Err("max_hops must be at least 1".to_string());
        }
        if self.probes_per_hop < 1 {
            return Err("probes_per_hop must be at least 1".to_string());
        }
        if self.probe_timeout.is_zero() {
            return Err("probe_timeout must be greater than 0".to_string());
        }
        if self.enrichment_concurrency == 0 {
            return Err("enrichment_concurrency must be at least 1".to_string());
        }
        Ok(())
    }

    /// Hard deadline for the run: the configured overall timeout, or the sum
    /// of per-hop timeouts capped at sixty seconds.
    pub fn run_deadline(&self) -> Duration {
        self.overall_timeout.unwrap_or_else(|| {
            self.probe_timeout
                .saturating_mul(u32::from(self.max_hops))
                .min(MAX_RUN_DEADLINE)
        })
    }
}

/// Builder for [`TraceConfig`]
#[derive(Debug, Default)]
pub struct TraceConfigBuilder {
    config: TraceConfig,
}

impl TraceConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            config: TraceConfig::default(),
        }
    }

    /// Set the target hostname or IP address
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.target = target.into();
        self
    }

    /// Set the resolved target address
    pub fn target_ip(mut self, ip: IpAddr) -> Self {
        self.config.target_ip = Some(ip);
        self
    }

    /// Set the maximum number of hops
    pub fn max_hops(mut self, hops: u8) -> Self {
        self.config.max_hops = hops;
        self
    }

    /// Set the number of probes per hop
    pub fn probes_per_hop(mut self, probes: u8) -> Self {
        self.config.probes_per_hop = probes;
        self
    }

    /// Set the per-probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Set the pause between successive sends
    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.config.send_interval = interval;
        self
    }

    /// Set the hard deadline for the whole run
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.config.overall_timeout = Some(timeout);
        self
    }

    /// Set the preferred probe protocol
    pub fn protocol(mut self, protocol: ProbeProtocol) -> Self {
        self.config.protocol = Some(protocol);
        self
    }

    /// Set the preferred socket mode
    pub fn socket_mode(mut self, mode: SocketMode) -> Self {
        self.config.socket_mode = Some(mode);
        self
    }

    /// Enable or disable per-hop enrichment
    pub fn enable_enrichment(mut self, enable: bool) -> Self {
        self.config.enable_enrichment = enable;
        self
    }

    /// Set the metadata service base URL
    pub fn metadata_url(mut self, url: impl Into<String>) -> Self {
        self.config.metadata_url = url.into();
        self
    }

    /// Set the number of concurrent enrichment lookups
    pub fn enrichment_concurrency(mut self, limit: usize) -> Self {
        self.config.enrichment_concurrency = limit;
        self
    }

    /// Set the timeout for one metadata lookup
    pub fn enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.config.enrichment_timeout = timeout;
        self
    }

    /// Set diagnostic verbosity
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Build the configuration, validating it
    pub fn build(self) -> Result<TraceConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn default_config() {
        let config = TraceConfig::default();
        assert_eq!(config.max_hops, 30);
        assert_eq!(config.probes_per_hop, 1);
        assert_eq!(config.probe_timeout.as_millis(), 1000);
        assert!(config.enable_enrichment);
        assert_eq!(config.metadata_url, DEFAULT_METADATA_URL);
    }

    #[test]
    fn builder_round_trip() {
        let config = TraceConfig::builder()
            .target("example.com")
            .max_hops(12)
            .probes_per_hop(3)
            .probe_timeout(Duration::from_millis(250))
            .enable_enrichment(false)
            .build()
            .unwrap();

        assert_eq!(config.target, "example.com");
        assert_eq!(config.max_hops, 12);
        assert_eq!(config.probes_per_hop, 3);
        assert_eq!(config.probe_timeout.as_millis(), 250);
        assert!(!config.enable_enrichment);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(TraceConfig::builder().build().is_err());

        assert!(TraceConfig::builder()
            .target("example.com")
            .max_hops(0)
            .build()
            .is_err());

        assert!(TraceConfig::builder()
            .target("example.com")
            .probes_per_hop(0)
            .build()
            .is_err());

        assert!(TraceConfig::builder()
            .target("example.com")
            .probe_timeout(Duration::from_millis(0))
            .build()
            .is_err());
    }

    #[test]
    fn target_ip_alone_is_enough() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
        let config = TraceConfig::builder().target_ip(ip).build().unwrap();
        assert_eq!(config.target_ip, Some(ip));
    }

    #[test]
    fn run_deadline_is_derived_and_capped() {
        let config = TraceConfig::builder()
            .target("example.com")
            .max_hops(10)
            .probe_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        assert_eq!(config.run_deadline(), Duration::from_secs(5));

        let config = TraceConfig::builder()
            .target("example.com")
            .max_hops(200)
            .probe_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(config.run_deadline(), Duration::from_secs(60));

        let config = TraceConfig::builder()
            .target("example.com")
            .overall_timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(config.run_deadline(), Duration::from_secs(3));
    }
}
