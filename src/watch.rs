//! Watchers over the Consul catalog and KV store, and the blocking-index
//! driver that publishes their snapshots.
//!
//! Each watcher variant pairs one long-poll fetch against the registry with
//! a processing step that turns the raw payload into a [`ServiceMap`]. The
//! [`Watch`] driver wraps a watcher with the blocking-index protocol and
//! atomically swaps in each new snapshot, so readers always observe either
//! the whole old map or the whole new one.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::client::{KvPair, QueryOptions, StaticEntry, WATCH_TIMEOUT};
use crate::error::Error;
use crate::metrics::{self, RefreshOutcome, Timer};
use crate::service::{parse_acl, split_acl_string, Service, ServiceMap, SERVICE_PROXY_TARGET};

/// One source of services: a fetch/process pair over the registry.
#[async_trait]
pub trait Watcher: Send {
    /// Source name for logs.
    fn name(&self) -> String;

    /// One long-poll round trip. Stores the raw payload internally and
    /// returns the registry's index for it.
    async fn fetch(&mut self, catalog: &Catalog, opts: &QueryOptions) -> Result<u64, Error>;

    /// Transform the last fetched payload into services, returning the map
    /// and the list of names it contributed.
    async fn process(&self, catalog: &Catalog) -> Result<(ServiceMap, Vec<String>), Error>;
}

#[derive(Default)]
struct WatchState {
    last_index: u64,
    services: ServiceMap,
    refreshed: Option<SystemTime>,
    ready: bool,
}

/// Drives one [`Watcher`] through the blocking-index protocol and caches
/// its last published snapshot.
pub struct Watch {
    name: String,
    watcher: Mutex<Box<dyn Watcher>>,
    state: RwLock<WatchState>,
}

impl Watch {
    /// Wrap a watcher. The snapshot starts empty and not ready.
    pub fn new(watcher: impl Watcher + 'static) -> Self {
        Self {
            name: watcher.name(),
            watcher: Mutex::new(Box::new(watcher)),
            state: RwLock::new(WatchState::default()),
        }
    }

    /// Run one fetch/process round against the registry.
    ///
    /// Returns `Ok(true)` when a new snapshot was published, `Ok(false)`
    /// when the long poll timed out without changes. On error the previous
    /// snapshot and index are preserved for the caller to retry.
    pub async fn resolve(&self, catalog: &Catalog) -> Result<bool, Error> {
        let timer = Timer::start();
        let last_index = self.state.read().last_index;
        let opts = QueryOptions {
            wait_index: last_index,
            wait_time: Some(WATCH_TIMEOUT),
        };

        let mut watcher = self.watcher.lock().await;
        let mut next_index = match watcher.fetch(catalog, &opts).await {
            Ok(index) => index,
            Err(err) => {
                metrics::record_watch_refresh(&self.name, RefreshOutcome::Error, timer.elapsed());
                return Err(err);
            }
        };

        if next_index == last_index {
            // watch timed out, safe to retry
            debug!(watch = %self.name, index = next_index, "no changes found");
            self.state.write().refreshed = Some(SystemTime::now());
            metrics::record_watch_refresh(&self.name, RefreshOutcome::Unchanged, timer.elapsed());
            return Ok(false);
        }

        // a backwards index means the registry was reset; force a full
        // re-read on the next round
        if next_index < last_index {
            debug!(watch = %self.name, "resetting watch index");
            next_index = 0;
        }

        let (services, found) = match watcher.process(catalog).await {
            Ok(processed) => processed,
            Err(err) => {
                metrics::record_watch_refresh(&self.name, RefreshOutcome::Error, timer.elapsed());
                return Err(err);
            }
        };
        drop(watcher);

        debug!(
            watch = %self.name,
            count = found.len(),
            services = %found.join(","),
            "publishing snapshot"
        );

        {
            let mut state = self.state.write();
            state.ready = true;
            state.services = services;
            state.last_index = next_index;
            state.refreshed = Some(SystemTime::now());
        }
        metrics::record_watch_refresh(&self.name, RefreshOutcome::Changed, timer.elapsed());
        Ok(true)
    }

    /// Source name for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a name in this source's snapshot, wildcard included.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.state.read().services.find(name)
    }

    /// The current snapshot.
    pub fn known(&self) -> ServiceMap {
        self.state.read().services.clone()
    }

    /// Whether this source has published at least one snapshot.
    pub fn ready(&self) -> bool {
        self.state.read().ready
    }

    /// The last registry index a snapshot was published for.
    pub fn last_index(&self) -> u64 {
        self.state.read().last_index
    }

    /// When this source last completed a round, successful or unchanged.
    pub fn refreshed(&self) -> Option<SystemTime> {
        self.state.read().refreshed
    }
}

/// A sibling service published under an alias name, sharing the aliased
/// service's target, ACL and addresses.
fn alias_for(name: &str, service: &Service) -> Service {
    let mut alias = Service::new(name, service.target.clone());
    alias.acl = service.acl.clone();
    alias.addresses = service.addresses.clone();
    alias
}

/// Build services out of decoded static entries, applying the proxy, ACL
/// and alias rules shared by both KV watchers.
fn static_entries_to_services(
    catalog: &Catalog,
    entries: HashMap<String, StaticEntry>,
) -> (ServiceMap, Vec<String>) {
    let mut services = ServiceMap::new();
    let mut found = Vec::new();

    for (name, entry) in entries {
        if entry.target == SERVICE_PROXY_TARGET && catalog.proxy_service().is_none() {
            warn!(
                service = %name,
                "ignoring service: requested service proxy but none is configured"
            );
            continue;
        }

        let mut service = Service::new(name.clone(), entry.target);
        service.addresses = entry.addresses;

        if catalog.acl_tag().is_some() {
            match parse_acl(&entry.acl, catalog.networks()) {
                Ok(acl) => service.acl = acl,
                Err(err) => {
                    warn!(service = %name, %err, "ignoring service: could not parse acl");
                    continue;
                }
            }
        }

        let service = Arc::new(service);

        if catalog.alias_tag().is_some() {
            for alias in &entry.aliases {
                services.insert(Arc::new(alias_for(alias, &service)));
                found.push(alias.clone());
            }
        }

        if let Some(previous) = services.get(&name) {
            warn!(
                service = %name,
                previous_target = %previous.target,
                "replacing duplicate service entry"
            );
        }
        services.insert(service);
        found.push(name);
    }

    (services, found)
}

/// Watches a single KV key holding a JSON object of static entries.
pub struct KvKeyWatcher {
    key: String,
    data: Option<KvPair>,
}

impl KvKeyWatcher {
    /// Watch the given KV key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: None,
        }
    }
}

#[async_trait]
impl Watcher for KvKeyWatcher {
    fn name(&self) -> String {
        format!("static services from key {}", self.key)
    }

    async fn fetch(&mut self, catalog: &Catalog, opts: &QueryOptions) -> Result<u64, Error> {
        let (pair, meta) = catalog.kv_client().get(&self.key, opts).await?;
        self.data = pair;
        Ok(meta.last_index)
    }

    async fn process(&self, catalog: &Catalog) -> Result<(ServiceMap, Vec<String>), Error> {
        let pair = self
            .data
            .as_ref()
            .ok_or_else(|| Error::KeyNotFound(self.key.clone()))?;
        let entries: HashMap<String, StaticEntry> = serde_json::from_slice(&pair.value)?;
        Ok(static_entries_to_services(catalog, entries))
    }
}

/// Watches a KV prefix where each key holds one JSON static entry; the
/// service name is the key's basename.
pub struct KvPrefixWatcher {
    prefix: String,
    entries: Vec<KvPair>,
}

impl KvPrefixWatcher {
    /// Watch the given KV prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Vec::new(),
        }
    }
}

#[async_trait]
impl Watcher for KvPrefixWatcher {
    fn name(&self) -> String {
        format!("static services at prefix {}", self.prefix)
    }

    async fn fetch(&mut self, catalog: &Catalog, opts: &QueryOptions) -> Result<u64, Error> {
        let (pairs, meta) = catalog.kv_client().list(&self.prefix, opts).await?;
        self.entries = pairs;
        Ok(meta.last_index)
    }

    async fn process(&self, catalog: &Catalog) -> Result<(ServiceMap, Vec<String>), Error> {
        let mut entries = HashMap::new();
        for pair in &self.entries {
            let entry: StaticEntry = serde_json::from_slice(&pair.value)?;
            let name = pair.key.rsplit('/').next().unwrap_or(&pair.key);
            entries.insert(name.to_string(), entry);
        }
        Ok(static_entries_to_services(catalog, entries))
    }
}

/// Watches the service catalog for registrations carrying the exposure tag.
pub struct CatalogServicesWatcher {
    tag: String,
    data: HashMap<String, Vec<String>>,
}

impl CatalogServicesWatcher {
    /// Watch catalog services tagged with `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            data: HashMap::new(),
        }
    }
}

#[async_trait]
impl Watcher for CatalogServicesWatcher {
    fn name(&self) -> String {
        format!("consul catalog services tagged {}", self.tag)
    }

    async fn fetch(&mut self, catalog: &Catalog, opts: &QueryOptions) -> Result<u64, Error> {
        let (services, meta) = catalog.catalog_client().services(opts).await?;
        self.data = services;
        Ok(meta.last_index)
    }

    async fn process(&self, catalog: &Catalog) -> Result<(ServiceMap, Vec<String>), Error> {
        let mut services = ServiceMap::new();
        let mut found = Vec::new();

        for (name, tags) in &self.data {
            let mut target = name.clone();
            let mut exposed = false;

            for tag in tags {
                if catalog.proxy_tag() == Some(tag.as_str()) {
                    target = SERVICE_PROXY_TARGET.to_string();
                } else if *tag == self.tag {
                    exposed = true;
                } else {
                    debug!(service = %name, tag = %tag, "ignoring unknown tag");
                }
            }

            // do not publish services without the tag
            if !exposed {
                continue;
            }

            let instances = match catalog.catalog_client().service(name).await {
                Ok(instances) => instances,
                Err(err) => {
                    debug!(service = %name, %err, "failed to fetch service info");
                    continue;
                }
            };

            let mut service = Service::new(name.clone(), target);

            if instances.is_empty() {
                warn!(
                    service = %name,
                    "no instances found, check the permissions for your token"
                );
                services.insert(Arc::new(service));
                found.push(name.clone());
                continue;
            }

            for instance in &instances {
                match instance.address.parse::<Ipv4Addr>() {
                    Ok(addr) => service.addresses.push(addr),
                    Err(_) => {
                        debug!(
                            service = %name,
                            address = %instance.address,
                            "skipping unparseable instance address"
                        );
                    }
                }
            }

            let metadata = &instances[0].service_meta;

            if let Some(acl_tag) = catalog.acl_tag() {
                let Some(acl) = metadata.get(acl_tag) else {
                    warn!(service = %name, "no acl found");
                    continue;
                };
                match parse_acl(&split_acl_string(acl), catalog.networks()) {
                    Ok(rules) => service.acl = rules,
                    Err(err) => {
                        warn!(service = %name, %err, "ignoring service");
                        continue;
                    }
                }
            }

            let service = Arc::new(service);

            if let Some(alias_tag) = catalog.alias_tag() {
                if let Some(aliases) = metadata.get(alias_tag) {
                    for alias in aliases.split(';').map(|a| a.trim_start()) {
                        services.insert(Arc::new(alias_for(alias, &service)));
                        found.push(alias.to_string());
                    }
                }
            }

            debug!(service = %name, target = %service.target, "serving");
            services.insert(service);
            found.push(name.clone());
        }

        Ok((services, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_shares_acl_target_and_addresses() {
        let mut svc = Service::new("alias", SERVICE_PROXY_TARGET);
        svc.addresses = vec!["192.168.100.2".parse().unwrap()];
        svc.acl = vec![crate::service::AclRule {
            action: "allow".into(),
            networks: vec!["192.168.100.0/24".parse().unwrap()],
        }];

        let alias = alias_for("*.alias", &svc);
        assert_eq!(alias.name, "*.alias");
        assert_eq!(alias.target, SERVICE_PROXY_TARGET);
        assert_eq!(alias.addresses, svc.addresses);
        assert_eq!(alias.acl.len(), 1);
    }

    #[test]
    fn test_watch_names() {
        assert_eq!(
            KvKeyWatcher::new("static/path").name(),
            "static services from key static/path"
        );
        assert_eq!(
            KvPrefixWatcher::new("static/prefix").name(),
            "static services at prefix static/prefix"
        );
        assert_eq!(
            CatalogServicesWatcher::new("coredns.enabled").name(),
            "consul catalog services tagged coredns.enabled"
        );
    }
}
