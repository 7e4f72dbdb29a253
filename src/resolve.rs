//! Target resolution: host string to a concrete address

use crate::trace::TraceError;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::IpAddr;

/// Resolve a target string to an address.
///
/// A literal IP is returned unchanged with no DNS round-trip. For hostnames,
/// an A lookup is tried once, then an AAAA lookup once; there are no silent
/// retries beyond that.
pub async fn resolve_target(target: &str) -> Result<IpAddr, TraceError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let resolver = TokioResolver::builder_with_config(
        ResolverConfig::cloudflare(),
        TokioConnectionProvider::default(),
    )
    .build();

    if let Ok(lookup) = resolver.ipv4_lookup(target).await {
        if let Some(ipv4) = lookup.iter().next() {
            return Ok(IpAddr::V4(ipv4.0));
        }
    }

    if let Ok(lookup) = resolver.ipv6_lookup(target).await {
        if let Some(ipv6) = lookup.iter().next() {
            return Ok(IpAddr::V6(ipv6.0));
        }
    }

    Err(TraceError::Resolution(target.to_string()))
}
