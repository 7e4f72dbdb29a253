//! Per-hop metadata enrichment: AS number, country, and provider per IP

pub mod cache;
pub mod client;

pub use cache::EnrichCache;
pub use client::{
    Enricher, EnrichmentError, EnrichmentRecord, IpinfoSource, MetadataPayload, MetadataSource,
    UNKNOWN,
};
