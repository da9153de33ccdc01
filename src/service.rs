//! Service model: targets, compiled ACLs, and the wildcard-aware name map.

use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Error;

/// Target value marking a service as resolved through the configured
/// service proxy.
pub const SERVICE_PROXY_TARGET: &str = "@service_proxy";

/// Named networks referenced by ACL rules. A named network matches an IP
/// when any of its ranges contains it.
pub type NetworkTable = HashMap<String, Vec<IpNet>>;

/// One compiled ACL rule: an action applied to a set of network ranges.
#[derive(Debug, Clone)]
pub struct AclRule {
    /// "allow" or "deny". Anything else is skipped at evaluation time.
    pub action: String,
    /// Ranges this rule applies to.
    pub networks: Vec<IpNet>,
}

/// A resolvable entity published by one of the watchers.
#[derive(Debug, Clone)]
pub struct Service {
    /// Bare service name. Wildcard entries keep their literal `*.` prefix.
    pub name: String,
    /// Lookup target: another service name, [`SERVICE_PROXY_TARGET`], or
    /// the service itself.
    pub target: String,
    /// Compiled ACL rules, evaluated in order. Empty means deny.
    pub acl: Vec<AclRule>,
    /// Addresses known directly; empty means the target is looked up
    /// upstream.
    pub addresses: Vec<Ipv4Addr>,
}

impl Service {
    /// Create a service with no ACL and no addresses.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            acl: Vec::new(),
            addresses: Vec::new(),
        }
    }

    /// Whether this service answers queries from `ip`.
    ///
    /// Rules are evaluated in declaration order; the first rule whose
    /// networks contain `ip` decides. Falling off the end denies, so a
    /// service with no rules answers nobody.
    pub fn responds_to(&self, ip: IpAddr) -> bool {
        debug!(service = %self.name, rules = self.acl.len(), "evaluating acl");
        for rule in &self.acl {
            for net in &rule.networks {
                if net.contains(&ip) {
                    match rule.action.as_str() {
                        "allow" => {
                            debug!(%ip, network = %net, "allowed");
                            return true;
                        }
                        "deny" => {
                            debug!(%ip, network = %net, "denied");
                            return false;
                        }
                        other => {
                            warn!(action = other, "unknown acl action, skipping rule");
                        }
                    }
                }
            }
        }

        false
    }
}

/// Name → service lookup with single-label wildcard fallback.
#[derive(Debug, Clone, Default)]
pub struct ServiceMap {
    inner: HashMap<String, Arc<Service>>,
}

impl ServiceMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service under its own name, returning any replaced entry.
    pub fn insert(&mut self, service: Arc<Service>) -> Option<Arc<Service>> {
        self.inner.insert(service.name.clone(), service)
    }

    /// Exact-name lookup.
    pub fn get(&self, name: &str) -> Option<&Arc<Service>> {
        self.inner.get(name)
    }

    /// Whether an exact entry exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Look up `query`, falling back to a wildcard entry.
    ///
    /// An exact match wins. Otherwise, for a dotted query `x.rest`, the
    /// literal key `*.rest` is tried, so wildcards cover exactly one label.
    pub fn find(&self, query: &str) -> Option<Arc<Service>> {
        if let Some(svc) = self.inner.get(query) {
            return Some(svc.clone());
        }

        if let Some((_, rest)) = query.split_once('.') {
            if let Some(svc) = self.inner.get(&format!("*.{rest}")) {
                return Some(svc.clone());
            }
        }

        None
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over (name, service) pairs in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Service>)> {
        self.inner.iter()
    }
}

/// Split a metadata ACL string into individual rule strings on `;`,
/// tolerating whitespace after the separator.
pub fn split_acl_string(acl: &str) -> Vec<String> {
    acl.split(';').map(|r| r.trim_start().to_string()).collect()
}

/// Compile rule strings of the form `<action> <net>{, <net>}` against the
/// network table.
///
/// Mirrors the metadata grammar: one compiled rule per referenced network,
/// keeping declaration order. Fails on a rule without an action/network
/// split or on a network name missing from the table; the caller discards
/// the containing service.
pub fn parse_acl(rules: &[String], networks: &NetworkTable) -> Result<Vec<AclRule>, Error> {
    let mut acl = Vec::new();

    for rule in rules {
        let (action, network_names) = rule
            .split_once(' ')
            .ok_or_else(|| Error::MalformedAclRule(rule.clone()))?;

        for name in network_names.split(',').map(|n| n.trim_start()) {
            let ranges = networks
                .get(name)
                .ok_or_else(|| Error::UnknownNetwork(name.to_string()))?;
            acl.push(AclRule {
                action: action.to_string(),
                networks: ranges.clone(),
            });
        }
    }

    Ok(acl)
}
