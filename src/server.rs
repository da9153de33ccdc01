//! DNS server setup and lifecycle management.

use hickory_server::authority::{AuthorityObject, Catalog as AuthorityCatalog};
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::authority::CatalogAuthority;
use crate::catalog::Catalog;
use crate::client::HttpConsulClient;
use crate::config::Config;
use crate::error::Error;
use crate::metrics;

/// Interval for emitting catalog state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit catalog and per-source state metrics.
async fn metrics_loop(catalog: Arc<Catalog>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for src in catalog.sources() {
                    let refresh_age = src
                        .refreshed()
                        .and_then(|t| t.elapsed().ok())
                        .map(|d| d.as_secs_f64());
                    metrics::record_source_state(
                        src.name(),
                        src.known().len(),
                        src.ready(),
                        refresh_age,
                    );
                }
                let age = catalog
                    .last_updated()
                    .and_then(|t| t.elapsed().ok())
                    .map(|d| d.as_secs_f64());
                let services = catalog.services().len();
                metrics::record_catalog_state(services, catalog.ready(), age);
                debug!(services, ready = catalog.ready(), "emitted catalog metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// DNS server projecting the Consul catalog into resolvable records.
pub struct DnsServer {
    config: Config,
}

impl DnsServer {
    /// Create a new DNS server with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the DNS server until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        info!(
            listen_addr = %self.config.dns.listen_addr,
            zones = ?self.config.dns.zones,
            endpoint = %self.config.consul.endpoint,
            "Starting consul-dns server"
        );

        // One HTTP client serves both registry interfaces
        let client = Arc::new(HttpConsulClient::new(
            &self.config.consul.endpoint,
            &self.config.consul.scheme,
            &self.config.consul.token,
        )?);
        let catalog = Arc::new(Catalog::new(&self.config, client.clone(), client));

        info!(
            sources = catalog.sources().len(),
            endpoint = %self.config.consul.endpoint,
            "Starting catalog watches"
        );
        let watcher_handles = catalog.spawn_watchers(shutdown.clone());

        // Wait for every source's initial snapshot before answering
        info!("Waiting for initial catalog snapshots...");
        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested before catalog sync completed");
                for handle in watcher_handles {
                    let _ = handle.await;
                }
                return Ok(());
            }

            if catalog.ready() {
                info!(
                    services = catalog.services().len(),
                    "Initial catalog sync complete"
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // One authority per zone, all over the same catalog
        let mut authorities = AuthorityCatalog::new();
        for zone in catalog.zones() {
            let authority =
                CatalogAuthority::new(zone, Arc::clone(&catalog), self.config.dns.soa.clone())?;
            let origin = authority.origin().clone();
            let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
            authorities.upsert(origin, vec![authority]);
        }

        let mut server = ServerFuture::new(authorities);

        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, Duration::from_secs(30));

        info!(zones = ?catalog.zones(), "DNS server ready to serve queries");

        let metrics_catalog = Arc::clone(&catalog);
        let metrics_shutdown = shutdown.clone();
        let metrics_handle = tokio::spawn(async move {
            metrics_loop(metrics_catalog, metrics_shutdown).await;
        });

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        let _ = metrics_handle.await;

        info!("Waiting for catalog watches to stop...");
        for handle in watcher_handles {
            let _ = handle.await;
        }

        info!("DNS server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsulConfig, DnsConfig, SoaConfig, TelemetryConfig};
    use std::collections::HashMap;

    #[test]
    fn test_server_creation() {
        let config = Config {
            dns: DnsConfig {
                listen_addr: "127.0.0.1:1053".parse().unwrap(),
                zones: vec!["example.com.".to_string()],
                ttl: 300,
                soa: SoaConfig::default(),
            },
            consul: ConsulConfig::default(),
            networks: HashMap::new(),
            telemetry: TelemetryConfig::default(),
        };

        let server = DnsServer::new(config);
        assert_eq!(server.config.dns.ttl, 300);
    }
}
