//! Configuration types for consul-dns.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Consul endpoint and watcher configuration.
    pub consul: ConsulConfig,

    /// Named networks usable in ACL rules. A named network matches an IP
    /// when any of its ranges contains it.
    #[serde(default)]
    pub networks: HashMap<String, Vec<IpNet>>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Zone suffixes this server answers for (e.g. "example.com.").
    /// The suffix is stripped from query names before catalog lookup.
    pub zones: Vec<String>,

    /// TTL for answered A records, in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// SOA record configuration for the served zones.
    #[serde(default)]
    pub soa: SoaConfig,
}

/// Consul endpoint and catalog-projection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    /// Consul agent address as host:port.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Transport scheme, "http" or "https".
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Consul ACL token, sent as X-Consul-Token when non-empty.
    #[serde(default)]
    pub token: String,

    /// Tag a catalog service must carry to be exposed over DNS.
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Service metadata field holding the ACL rule string.
    #[serde(default = "default_acl_tag")]
    pub acl_metadata_tag: Option<String>,

    /// Service metadata field listing aliases, separated by ";".
    #[serde(default = "default_alias_tag")]
    pub alias_metadata_tag: Option<String>,

    /// KV key holding a JSON object of static entries.
    #[serde(default)]
    pub static_entries_path: Option<String>,

    /// KV prefix under which each key holds one JSON static entry.
    #[serde(default)]
    pub static_entries_prefix: Option<String>,

    /// Service proxy indirection, if any.
    #[serde(default)]
    pub service_proxy: Option<ServiceProxyConfig>,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            scheme: default_scheme(),
            token: String::new(),
            tag: default_tag(),
            acl_metadata_tag: default_acl_tag(),
            alias_metadata_tag: default_alias_tag(),
            static_entries_path: None,
            static_entries_prefix: None,
            service_proxy: None,
        }
    }
}

/// Service proxy configuration: services tagged with `tag` resolve to the
/// addresses of `service` instead of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceProxyConfig {
    /// Tag marking a catalog service as fronted by the proxy.
    pub tag: String,

    /// Name of the proxy service itself.
    pub service: String,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "debug", "consul_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

/// SOA (Start of Authority) record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoaConfig {
    /// Primary nameserver hostname (e.g. "ns1.example.com").
    pub mname: String,

    /// Admin email in DNS format (e.g. "admin.example.com" for admin@example.com).
    pub rname: String,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: "ns1.example.com".to_string(),
            rname: "admin.example.com".to_string(),
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

fn default_endpoint() -> String {
    "consul.service.consul:8500".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_tag() -> String {
    "coredns.enabled".to_string()
}

fn default_acl_tag() -> Option<String> {
    Some("coredns-acl".to_string())
}

fn default_alias_tag() -> Option<String> {
    Some("coredns-alias".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

// 5 minutes
fn default_ttl() -> u32 {
    300
}

fn default_refresh() -> u32 {
    3600
}

fn default_retry() -> u32 {
    600
}

fn default_expire() -> u32 {
    604800
}

fn default_minimum() -> u32 {
    60
}
