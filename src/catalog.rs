//! The aggregated service catalog and its watcher supervision.
//!
//! A [`Catalog`] owns the ordered watch list (static KV sources first, the
//! catalog services watcher always last), the compiled network table, and
//! the registry clients. Watcher tasks mutate per-watch snapshots while DNS
//! request handlers read them; aggregation applies declaration order, so the
//! first source to claim a name wins.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{CatalogClient, KvClient};
use crate::config::Config;
use crate::error::Error;
use crate::metrics;
use crate::service::{NetworkTable, Service, ServiceMap};
use crate::watch::{CatalogServicesWatcher, KvKeyWatcher, KvPrefixWatcher, Watch};

/// Holds published services from all configured sources.
pub struct Catalog {
    zones: Vec<String>,
    ttl: u32,
    proxy_tag: Option<String>,
    proxy_service: Option<String>,
    acl_tag: Option<String>,
    alias_tag: Option<String>,
    networks: NetworkTable,
    sources: Vec<Arc<Watch>>,
    client: Arc<dyn CatalogClient>,
    kv: Arc<dyn KvClient>,
    last_update: RwLock<Option<SystemTime>>,
}

impl Catalog {
    /// Assemble a catalog from configuration and registry clients.
    ///
    /// Watch order follows the configuration: the single-key source, then
    /// the prefix source, then the catalog services watcher last.
    pub fn new(config: &Config, client: Arc<dyn CatalogClient>, kv: Arc<dyn KvClient>) -> Self {
        let mut sources = Vec::new();

        if let Some(key) = &config.consul.static_entries_path {
            sources.push(Arc::new(Watch::new(KvKeyWatcher::new(key.clone()))));
        }
        if let Some(prefix) = &config.consul.static_entries_prefix {
            sources.push(Arc::new(Watch::new(KvPrefixWatcher::new(prefix.clone()))));
        }
        sources.push(Arc::new(Watch::new(CatalogServicesWatcher::new(
            config.consul.tag.clone(),
        ))));

        let (proxy_tag, proxy_service) = match &config.consul.service_proxy {
            Some(proxy) => (Some(proxy.tag.clone()), Some(proxy.service.clone())),
            None => (None, None),
        };

        Self {
            zones: config.dns.zones.iter().map(|z| normalize_zone(z)).collect(),
            ttl: config.dns.ttl,
            proxy_tag,
            proxy_service,
            acl_tag: config.consul.acl_metadata_tag.clone(),
            alias_tag: config.consul.alias_metadata_tag.clone(),
            networks: config.networks.clone(),
            sources,
            client,
            kv,
            last_update: RwLock::new(None),
        }
    }

    /// Zone suffixes served, normalized with a trailing dot.
    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// TTL for answered records, in seconds.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The named network table ACLs compile against.
    pub fn networks(&self) -> &NetworkTable {
        &self.networks
    }

    /// Tag marking a catalog service as fronted by the proxy.
    pub fn proxy_tag(&self) -> Option<&str> {
        self.proxy_tag.as_deref()
    }

    /// Name of the configured proxy service, if any.
    pub fn proxy_service(&self) -> Option<&str> {
        self.proxy_service.as_deref()
    }

    /// Metadata field holding ACL rule strings, if ACLs are enabled.
    pub fn acl_tag(&self) -> Option<&str> {
        self.acl_tag.as_deref()
    }

    /// Metadata field listing aliases, if aliases are enabled.
    pub fn alias_tag(&self) -> Option<&str> {
        self.alias_tag.as_deref()
    }

    /// The catalog side of the registry.
    pub fn catalog_client(&self) -> &dyn CatalogClient {
        self.client.as_ref()
    }

    /// The KV side of the registry.
    pub fn kv_client(&self) -> &dyn KvClient {
        self.kv.as_ref()
    }

    /// The configured sources in declaration order.
    pub fn sources(&self) -> &[Arc<Watch>] {
        &self.sources
    }

    /// True once every source has published its first snapshot.
    pub fn ready(&self) -> bool {
        self.sources.iter().all(|src| src.ready())
    }

    /// When any source last published a change.
    pub fn last_updated(&self) -> Option<SystemTime> {
        *self.last_update.read()
    }

    /// Flatten all sources into one map, first source winning on name
    /// conflicts.
    pub fn services(&self) -> ServiceMap {
        let mut map = ServiceMap::new();
        for src in &self.sources {
            let known = src.known();
            for (name, svc) in known.iter() {
                if map.contains(name) {
                    warn!(service = %name, source = %src.name(), "repeated service name");
                    continue;
                }
                map.insert(svc.clone());
            }
        }

        map
    }

    /// Look `name` up across sources in declaration order, wildcard
    /// fallback included.
    pub fn service_for(&self, name: &str) -> Option<Arc<Service>> {
        self.sources.iter().find_map(|src| src.get(name))
    }

    /// Resolve every source synchronously, advancing the update timestamp
    /// if anything changed.
    pub async fn reload_all(&self) -> Result<(), Error> {
        let mut did_update = false;
        for src in &self.sources {
            if src.resolve(self).await? {
                did_update = true;
            }
        }

        if did_update {
            *self.last_update.write() = Some(SystemTime::now());
        }

        Ok(())
    }

    /// Spawn one refresh task per source. Each loops forever, long-polling
    /// the registry and retrying failures with exponential backoff, until
    /// the shutdown token fires.
    pub fn spawn_watchers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.sources
            .iter()
            .map(|watch| {
                let catalog = Arc::clone(self);
                let watch = Arc::clone(watch);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    refresh_loop(catalog, watch, shutdown).await;
                })
            })
            .collect()
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Endless refresh loop for one watch. The long poll inside the fetch
/// provides the pacing; only failures sleep.
async fn refresh_loop(catalog: Arc<Catalog>, watch: Arc<Watch>, shutdown: CancellationToken) {
    info!(watch = %watch.name(), "starting watch");

    let mut cooldown = INITIAL_BACKOFF;
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(watch = %watch.name(), "watch shutting down");
                return;
            }

            result = watch.resolve(&catalog) => match result {
                Ok(_) => {
                    cooldown = INITIAL_BACKOFF;
                    *catalog.last_update.write() = Some(SystemTime::now());
                }
                Err(err) => {
                    error!(
                        watch = %watch.name(),
                        cooldown_secs = cooldown.as_secs(),
                        %err,
                        "could not refresh watch, retrying"
                    );
                    metrics::record_watch_retry(watch.name());

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            info!(watch = %watch.name(), "watch shutting down");
                            return;
                        }
                        _ = tokio::time::sleep(cooldown) => {}
                    }
                    cooldown = (cooldown * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

fn normalize_zone(zone: &str) -> String {
    let mut zone = zone.trim().to_ascii_lowercase();
    if !zone.ends_with('.') {
        zone.push('.');
    }
    zone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_zone() {
        assert_eq!(normalize_zone("example.com"), "example.com.");
        assert_eq!(normalize_zone("Example.COM."), "example.com.");
        assert_eq!(normalize_zone(" example.com. "), "example.com.");
    }
}
