//! consul-dns - An authoritative DNS server over the Consul service catalog.
//!
//! This crate serves A records for private zones out of a dynamic service
//! registry: catalog services tagged for exposure, plus static entries kept
//! in the Consul KV store. Every source is long-polled with Consul blocking
//! queries and aggregated into one in-memory view; per-service ACLs gate
//! answers on the requester's source address.
//!
//! ## Features
//!
//! - Real-time updates via Consul blocking queries (catalog, KV key, KV prefix)
//! - Per-source-IP ACLs compiled from named CIDR networks
//! - Service-proxy indirection with requester-affinity address ordering
//! - Wildcard (`*.label`) and alias names
//! - Graceful shutdown support
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          consul-dns                            │
//! │                                                                │
//! │  ┌────────────────┐     ┌──────────────────┐                   │
//! │  │ Consul client  │────▶│     Catalog      │                   │
//! │  │ (long polls)   │     │   (in-memory)    │                   │
//! │  └────────────────┘     └────────┬─────────┘                   │
//! │        │ Watches:                │                             │
//! │        │ - KV static key         ▼                             │
//! │        │ - KV static prefix ┌──────────────────┐               │
//! │        │ - catalog services │  Hickory DNS     │◀── UDP/TCP    │
//! │        └───────────────────│  Server          │    :53         │
//! │                            └──────────────────┘                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! git.example.com
//!   → strip zone suffix, look up "git" across sources in order
//!   → check the service ACL against the requester's address
//!   → answer with the target's addresses, or resolve the target upstream
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use consul_dns::{Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!
//!     let shutdown = CancellationToken::new();
//!     let server = DnsServer::new(config);
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod watch;

// Re-export main types
pub use catalog::Catalog;
pub use config::{Config, ConsulConfig, DnsConfig, ServiceProxyConfig, SoaConfig, TelemetryConfig};
pub use error::Error;
pub use server::DnsServer;
pub use service::{Service, ServiceMap};
