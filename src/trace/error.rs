//! Error taxonomy for route discovery

/// Error type for trace operations
///
/// Every variant here is fatal to the run. Expected conditions — probe
/// timeouts, unreachable hops, failed enrichment lookups — are represented in
/// the data instead and never surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The target could not be turned into an address
    #[error("failed to resolve host: {0}")]
    Resolution(String),

    /// Socket creation failed for lack of privileges
    #[error("insufficient permissions: {required}")]
    InsufficientPermissions {
        /// What is needed (e.g. "root or CAP_NET_RAW")
        required: String,
        /// Suggested remedy
        suggestion: String,
    },

    /// Socket creation or receive capability failed for other reasons
    #[error("probe socket error: {0}")]
    Socket(String),

    /// A probe could not be sent
    #[error("failed to send probe: {0}")]
    ProbeSend(String),

    /// The provided configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested probe mode is not implemented
    #[error("{feature} is not implemented")]
    NotImplemented {
        /// Feature name (e.g. "UDP probing")
        feature: String,
    },

    /// IPv6 targets are not supported yet
    #[error("IPv6 targets are not supported")]
    Ipv6NotSupported,
}
