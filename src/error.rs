//! Error types for consul-dns.

use thiserror::Error;

/// Errors that can occur while watching Consul or serving DNS.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error talking to Consul
    #[error("Consul transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Consul returned an unexpected HTTP status
    #[error("Consul returned {status} for {path}")]
    ConsulStatus {
        /// HTTP status code.
        status: reqwest::StatusCode,
        /// Request path.
        path: String,
    },

    /// Malformed JSON payload (static entries, catalog responses)
    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// KV value was not valid base64
    #[error("Malformed KV value: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A watched KV key does not exist
    #[error("KV key not found: {0}")]
    KeyNotFound(String),

    /// An ACL rule string did not split into an action and networks
    #[error("could not parse acl rule <{0}>")]
    MalformedAclRule(String),

    /// An ACL rule referenced a network missing from the network table
    #[error("unknown network {0}")]
    UnknownNetwork(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// Upstream A lookup failure
    #[error("Failed to lookup target upstream: {0}")]
    Upstream(#[from] hickory_resolver::ResolveError),
}
