//! Metadata lookup client with graceful degradation
//!
//! Failures never propagate out of [`Enricher::enrich`]: a hop whose lookup
//! fails gets a record with every field set to `"unknown"`, and the trace
//! report is produced regardless.

use super::cache::EnrichCache;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Sentinel value for fields the metadata service did not provide
pub const UNKNOWN: &str = "unknown";

/// AS number, country, and provider for one IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    /// The IP this record describes
    pub ip: IpAddr,
    /// AS number, e.g. `"AS15169"`, or `"unknown"`
    pub asn: String,
    /// Two-letter country code, or `"unknown"`
    pub country: String,
    /// Provider/organization name, or `"unknown"`
    pub provider: String,
}

impl EnrichmentRecord {
    /// The sentinel record used when a lookup fails or returns nothing usable
    pub fn unknown(ip: IpAddr) -> Self {
        EnrichmentRecord {
            ip,
            asn: UNKNOWN.to_string(),
            country: UNKNOWN.to_string(),
            provider: UNKNOWN.to_string(),
        }
    }
}

/// Error type for metadata lookups
///
/// Internal to the enrichment client; callers of [`Enricher::enrich`] never
/// see it.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    /// The HTTP request failed or timed out
    #[error("metadata request failed: {0}")]
    Http(String),

    /// The service answered with something that is not the expected JSON
    #[error("malformed metadata response: {0}")]
    Malformed(String),
}

/// Raw metadata service response
///
/// Both fields are optional on the wire; missing fields degrade to
/// `"unknown"` rather than failing the lookup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPayload {
    /// Combined organization string, e.g. `"AS15169 Google LLC"`
    pub org: Option<String>,
    /// Two-letter country code
    pub country: Option<String>,
}

/// Source of per-IP metadata
///
/// The production implementation is [`IpinfoSource`]; tests substitute an
/// in-memory source.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch the raw metadata for one IP
    async fn fetch(&self, ip: IpAddr) -> Result<MetadataPayload, EnrichmentError>;
}

/// HTTP metadata source speaking the ipinfo.io JSON dialect
///
/// Queries `GET {base}/{ip}/json` and reads the `org` and `country` fields.
pub struct IpinfoSource {
    client: reqwest::Client,
    base_url: String,
}

impl IpinfoSource {
    /// Create a source against the given base URL
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichmentError::Http(e.to_string()))?;
        Ok(IpinfoSource {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for IpinfoSource {
    async fn fetch(&self, ip: IpAddr) -> Result<MetadataPayload, EnrichmentError> {
        let url = format!("{}/{}/json", self.base_url, ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EnrichmentError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EnrichmentError::Http(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json::<MetadataPayload>()
            .await
            .map_err(|e| EnrichmentError::Malformed(e.to_string()))
    }
}

/// Split a combined organization string into AS number and provider name.
///
/// The AS number is the leading token and the provider is everything after
/// the first space; a string with no space yields `"unknown"` for both.
pub(crate) fn parse_org(org: &str) -> (String, String) {
    match org.split_once(' ') {
        Some((asn, provider)) if !asn.is_empty() && !provider.trim().is_empty() => {
            (asn.to_string(), provider.trim().to_string())
        }
        _ => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    }
}

fn record_from_payload(ip: IpAddr, payload: MetadataPayload) -> EnrichmentRecord {
    let (asn, provider) = match payload.org.as_deref() {
        Some(org) => parse_org(org),
        None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    };
    let country = match payload.country {
        Some(c) if !c.trim().is_empty() => c.trim().to_string(),
        _ => UNKNOWN.to_string(),
    };
    EnrichmentRecord {
        ip,
        asn,
        country,
        provider,
    }
}

/// Enrichment client for one trace run
///
/// Wraps a [`MetadataSource`] with the run-scoped cache: each IP is fetched
/// at most once per run, concurrent callers for one IP share the in-flight
/// lookup, and failures degrade to [`EnrichmentRecord::unknown`].
pub struct Enricher {
    source: Arc<dyn MetadataSource>,
    cache: Arc<EnrichCache>,
    concurrency: usize,
}

impl Enricher {
    /// Create an enricher over a source and a run-scoped cache
    pub fn new(source: Arc<dyn MetadataSource>, cache: Arc<EnrichCache>, concurrency: usize) -> Self {
        Enricher {
            source,
            cache,
            concurrency: concurrency.max(1),
        }
    }

    /// Look up one IP, consulting the cache first. Infallible.
    pub async fn enrich(&self, ip: IpAddr) -> EnrichmentRecord {
        let cell = self.cache.cell(ip);
        cell.get_or_init(|| async {
            match self.source.fetch(ip).await {
                Ok(payload) => record_from_payload(ip, payload),
                Err(_) => EnrichmentRecord::unknown(ip),
            }
        })
        .await
        .clone()
    }

    /// Look up a set of IPs concurrently, bounded by the configured limit
    pub async fn enrich_all<I>(&self, ips: I) -> HashMap<IpAddr, EnrichmentRecord>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let unique: HashSet<IpAddr> = ips.into_iter().collect();
        stream::iter(unique)
            .map(|ip| async move { (ip, self.enrich(ip).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    /// In-memory source counting outbound fetches
    struct FixedSource {
        payloads: HashMap<IpAddr, MetadataPayload>,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl FixedSource {
        fn new(payloads: HashMap<IpAddr, MetadataPayload>) -> Self {
            FixedSource {
                payloads,
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataSource for FixedSource {
        async fn fetch(&self, ip: IpAddr) -> Result<MetadataPayload, EnrichmentError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.payloads
                .get(&ip)
                .cloned()
                .ok_or_else(|| EnrichmentError::Http("no route to service".to_string()))
        }
    }

    fn payload(org: Option<&str>, country: Option<&str>) -> MetadataPayload {
        MetadataPayload {
            org: org.map(String::from),
            country: country.map(String::from),
        }
    }

    fn enricher_over(source: FixedSource) -> (Enricher, Arc<FixedSource>) {
        let source = Arc::new(source);
        let enricher = Enricher::new(
            Arc::clone(&source) as Arc<dyn MetadataSource>,
            Arc::new(EnrichCache::new()),
            4,
        );
        (enricher, source)
    }

    #[test]
    fn org_parsing_follows_the_leading_token_rule() {
        assert_eq!(
            parse_org("AS999 Acme Net"),
            ("AS999".to_string(), "Acme Net".to_string())
        );
        assert_eq!(
            parse_org("AS15169 Google LLC"),
            ("AS15169".to_string(), "Google LLC".to_string())
        );
        assert_eq!(parse_org("AS"), (UNKNOWN.to_string(), UNKNOWN.to_string()));
        assert_eq!(parse_org(""), (UNKNOWN.to_string(), UNKNOWN.to_string()));
        assert_eq!(
            parse_org("AS999 "),
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        );
    }

    #[test]
    fn missing_fields_default_to_unknown() {
        let record = record_from_payload(ip(1), payload(None, None));
        assert_eq!(record.asn, UNKNOWN);
        assert_eq!(record.provider, UNKNOWN);
        assert_eq!(record.country, UNKNOWN);

        let record = record_from_payload(ip(1), payload(Some("AS42 Example"), None));
        assert_eq!(record.asn, "AS42");
        assert_eq!(record.provider, "Example");
        assert_eq!(record.country, UNKNOWN);

        let record = record_from_payload(ip(1), payload(None, Some("DE")));
        assert_eq!(record.country, "DE");
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let payloads =
            HashMap::from([(ip(1), payload(Some("AS999 Acme Net"), Some("SE")))]);
        let (enricher, source) = enricher_over(FixedSource::new(payloads));

        let first = enricher.enrich(ip(1)).await;
        let second = enricher.enrich(ip(1)).await;

        assert_eq!(first, second);
        assert_eq!(first.asn, "AS999");
        assert_eq!(first.provider, "Acme Net");
        assert_eq!(first.country, "SE");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_for_one_ip_share_a_fetch() {
        let payloads =
            HashMap::from([(ip(1), payload(Some("AS1 One"), Some("US")))]);
        let mut source = FixedSource::new(payloads);
        source.delay = Duration::from_millis(20);
        let (enricher, source) = enricher_over(source);

        let (a, b, c) = tokio::join!(
            enricher.enrich(ip(1)),
            enricher.enrich(ip(1)),
            enricher.enrich(ip(1))
        );

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn failed_lookup_degrades_to_unknown() {
        let (enricher, source) = enricher_over(FixedSource::new(HashMap::new()));

        let record = enricher.enrich(ip(9)).await;
        assert_eq!(record, EnrichmentRecord::unknown(ip(9)));
        // The failure is cached for the run; the service is not re-asked.
        let again = enricher.enrich(ip(9)).await;
        assert_eq!(again, record);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn enrich_all_covers_every_unique_ip_once() {
        let payloads = HashMap::from([
            (ip(1), payload(Some("AS1 One"), Some("US"))),
            (ip(2), payload(Some("AS2 Two"), Some("DE"))),
            (ip(3), payload(Some("AS3 Three"), Some("JP"))),
        ]);
        let (enricher, source) = enricher_over(FixedSource::new(payloads));

        let results = enricher
            .enrich_all(vec![ip(1), ip(2), ip(3), ip(2), ip(1)])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[&ip(2)].asn, "AS2");
        assert_eq!(results[&ip(3)].country, "JP");
        assert_eq!(source.fetch_count(), 3);
    }
}
