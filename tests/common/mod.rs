//! Shared test infrastructure: in-memory Consul doubles and DNS request
//! helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use hickory_server::proto::xfer::Protocol;
use hickory_server::authority::{LookupControlFlow, LookupRecords, MessageRequest};
use hickory_server::server::Request;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use consul_dns::authority::{CatalogAuthority, UpstreamLookup};
use consul_dns::client::{
    CatalogClient, CatalogService, KvClient, KvPair, QueryMeta, QueryOptions,
};
use consul_dns::config::{
    Config, ConsulConfig, DnsConfig, ServiceProxyConfig, SoaConfig, TelemetryConfig,
};
use consul_dns::{Catalog, Error};

// --- Catalog fixture ---

/// One registered instance of a service.
#[derive(Debug, Clone)]
pub struct TestInstance {
    pub address: String,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

impl TestInstance {
    pub fn new(address: &str, tags: &[&str], acl: Option<&str>) -> Self {
        let mut meta = HashMap::new();
        if let Some(acl) = acl {
            meta.insert("coredns-acl".to_string(), acl.to_string());
        }
        Self {
            address: address.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            meta,
        }
    }
}

/// In-memory catalog double. `services()` reports the number of registered
/// services as the blocking index, so deleting a service moves the index
/// backwards the way a registry reset does.
pub struct MemoryCatalogClient {
    services: Mutex<HashMap<String, Vec<TestInstance>>>,
}

impl MemoryCatalogClient {
    pub fn with_fixture() -> Arc<Self> {
        let mut services = HashMap::new();
        services.insert(
            "nomad".to_string(),
            vec![TestInstance::new(
                "192.168.100.1",
                &["coredns.enabled", "traefik.enable=true"],
                Some("allow private"),
            )],
        );
        services.insert(
            "nomad-client".to_string(),
            vec![TestInstance::new("192.168.100.1", &[], None)],
        );
        services.insert(
            "traefik".to_string(),
            vec![TestInstance::new(
                "192.168.100.2",
                &["coredns.enabled", "traefik.enable=true"],
                Some("allow private, guest; deny public"),
            )],
        );
        services.insert(
            "git".to_string(),
            vec![
                TestInstance::new(
                    "192.168.100.3",
                    &["coredns.enabled"],
                    Some("deny guest; allow public"),
                ),
                TestInstance::new(
                    "192.168.100.4",
                    &["coredns.enabled"],
                    Some("deny guest; allow public"),
                ),
            ],
        );

        Arc::new(Self {
            services: Mutex::new(services),
        })
    }

    pub fn insert_service(&self, name: &str, instances: Vec<TestInstance>) {
        self.services
            .lock()
            .unwrap()
            .insert(name.to_string(), instances);
    }

    pub fn delete_service(&self, name: &str) {
        self.services.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalogClient {
    async fn services(
        &self,
        _opts: &QueryOptions,
    ) -> Result<(HashMap<String, Vec<String>>, QueryMeta), Error> {
        let services = self.services.lock().unwrap();
        let map = services
            .iter()
            .map(|(name, instances)| {
                let tags = instances.first().map(|i| i.tags.clone()).unwrap_or_default();
                (name.clone(), tags)
            })
            .collect();
        let meta = QueryMeta {
            last_index: services.len() as u64,
        };
        Ok((map, meta))
    }

    async fn service(&self, name: &str) -> Result<Vec<CatalogService>, Error> {
        let services = self.services.lock().unwrap();
        let instances = services
            .get(name)
            .ok_or_else(|| Error::Config(format!("service {name} not found")))?;

        Ok(instances
            .iter()
            .map(|i| CatalogService {
                address: i.address.clone(),
                service_meta: i.meta.clone(),
                service_tags: i.tags.clone(),
            })
            .collect())
    }
}

// --- KV fixture ---

/// In-memory KV double. Every read bumps the index so each resolve sees a
/// change, mirroring how the tests drive refreshes.
pub struct MemoryKvClient {
    keys: Mutex<HashMap<String, Vec<u8>>>,
    keys_index: AtomicU64,
    prefixes: Mutex<HashMap<String, Vec<KvPair>>>,
    prefix_index: AtomicU64,
}

impl MemoryKvClient {
    pub fn with_fixture() -> Arc<Self> {
        let mut keys = HashMap::new();
        keys.insert(
            "static/path".to_string(),
            br#"{"static-consul": {"target": "traefik", "acl": ["allow private"]}}"#.to_vec(),
        );

        let mut prefixes = HashMap::new();
        prefixes.insert(
            "static/prefix".to_string(),
            vec![KvPair {
                key: "static/prefix/prefixed-static".to_string(),
                value: br#"{"target": "traefik", "acl": ["allow private"]}"#.to_vec(),
            }],
        );

        Arc::new(Self {
            keys: Mutex::new(keys),
            keys_index: AtomicU64::new(0),
            prefixes: Mutex::new(prefixes),
            prefix_index: AtomicU64::new(0),
        })
    }

    pub fn set_key(&self, key: &str, value: &[u8]) {
        self.keys
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    async fn get(
        &self,
        key: &str,
        _opts: &QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta), Error> {
        let last_index = self.keys_index.fetch_add(1, Ordering::SeqCst) + 1;
        let pair = self.keys.lock().unwrap().get(key).map(|value| KvPair {
            key: key.to_string(),
            value: value.clone(),
        });
        Ok((pair, QueryMeta { last_index }))
    }

    async fn list(
        &self,
        prefix: &str,
        _opts: &QueryOptions,
    ) -> Result<(Vec<KvPair>, QueryMeta), Error> {
        let last_index = self.prefix_index.fetch_add(1, Ordering::SeqCst) + 1;
        let pairs = self
            .prefixes
            .lock()
            .unwrap()
            .get(prefix)
            .cloned()
            .unwrap_or_default();
        Ok((pairs, QueryMeta { last_index }))
    }
}

// --- Config and catalog builders ---

pub struct TestConfigBuilder {
    static_entries_path: Option<String>,
    static_entries_prefix: Option<String>,
    service_proxy: Option<ServiceProxyConfig>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            static_entries_path: None,
            static_entries_prefix: None,
            service_proxy: Some(ServiceProxyConfig {
                tag: "traefik.enable=true".to_string(),
                service: "traefik".to_string(),
            }),
        }
    }

    pub fn static_path(mut self, key: &str) -> Self {
        self.static_entries_path = Some(key.to_string());
        self
    }

    pub fn static_prefix(mut self, prefix: &str) -> Self {
        self.static_entries_prefix = Some(prefix.to_string());
        self
    }

    pub fn without_proxy(mut self) -> Self {
        self.service_proxy = None;
        self
    }

    pub fn build(self) -> Config {
        let mut networks = HashMap::new();
        networks.insert(
            "private".to_string(),
            vec!["192.168.100.0/24".parse().unwrap()],
        );
        networks.insert("guest".to_string(), vec!["192.168.1.0/24".parse().unwrap()]);
        networks.insert("public".to_string(), vec!["0.0.0.0/0".parse().unwrap()]);

        Config {
            dns: DnsConfig {
                listen_addr: "127.0.0.1:1053".parse().unwrap(),
                zones: vec!["example.com.".to_string()],
                ttl: 300,
                soa: SoaConfig::default(),
            },
            consul: ConsulConfig {
                static_entries_path: self.static_entries_path,
                static_entries_prefix: self.static_entries_prefix,
                service_proxy: self.service_proxy,
                ..ConsulConfig::default()
            },
            networks,
            telemetry: TelemetryConfig::default(),
        }
    }
}

pub struct TestCatalog {
    pub catalog: Arc<Catalog>,
    pub client: Arc<MemoryCatalogClient>,
    pub kv: Arc<MemoryKvClient>,
}

/// Build a catalog over the fixture doubles, optionally priming every
/// source with one resolve round.
pub async fn new_test_catalog(fetch: bool, config: Config) -> TestCatalog {
    let client = MemoryCatalogClient::with_fixture();
    let kv = MemoryKvClient::with_fixture();
    let catalog = Arc::new(Catalog::new(&config, client.clone(), kv.clone()));

    if fetch {
        catalog.reload_all().await.expect("initial reload");
    }

    TestCatalog {
        catalog,
        client,
        kv,
    }
}

// --- Upstream lookup fixture ---

/// Upstream lookup answering from a fixed host map; anything else errors.
pub fn fixture_upstream(hosts: &[(&str, &[&str])]) -> UpstreamLookup {
    let hosts: HashMap<String, Vec<Ipv4Addr>> = hosts
        .iter()
        .map(|(name, addrs)| {
            let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
            (name.to_string(), addrs)
        })
        .collect();

    Arc::new(move |target: String| {
        let result = hosts.get(&target).cloned();
        Box::pin(async move {
            result.ok_or_else(|| Error::Config(format!("no upstream fixture for {target}")))
        })
    })
}

/// Build an authority over the catalog for `example.com.` with the given
/// upstream fixture.
pub fn test_authority(catalog: Arc<Catalog>, upstream: UpstreamLookup) -> CatalogAuthority {
    CatalogAuthority::with_upstream("example.com.", catalog, SoaConfig::default(), upstream)
        .expect("failed to create authority")
}

// --- Query construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` with a crafted source address.
pub fn build_request(name: &str, record_type: RecordType, src: SocketAddr, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    Request::new(msg, src, Protocol::Udp)
}

/// Run one query through the authority's search path.
pub async fn search(
    authority: &CatalogAuthority,
    name: &str,
    record_type: RecordType,
    src: &str,
) -> LookupControlFlow<LookupRecords> {
    use hickory_server::authority::Authority;

    let src: SocketAddr = format!("{src}:53531").parse().unwrap();
    let request = build_request(name, record_type, src, 42);
    let info = request.request_info().expect("request info");
    authority.search(info, Default::default()).await
}

// --- Assertions ---

/// Extract A record addresses in answer order.
pub fn a_records(lookup: &LookupRecords) -> Vec<Ipv4Addr> {
    lookup
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect()
}

/// Assert the query was answered with exactly these addresses, in order.
pub fn assert_answers(flow: LookupControlFlow<LookupRecords>, expected: &[&str]) {
    match flow {
        LookupControlFlow::Break(Ok(lookup)) => {
            let actual = a_records(&lookup);
            let expected: Vec<Ipv4Addr> = expected.iter().map(|a| a.parse().unwrap()).collect();
            assert_eq!(actual, expected, "unexpected answer addresses");
        }
        LookupControlFlow::Break(Err(err)) => panic!("expected answers, got error: {err}"),
        LookupControlFlow::Skip => panic!("expected answers, query was deferred"),
        _ => panic!("expected answers, query continued down the chain"),
    }
}

/// Assert the query was deferred to the next handler.
pub fn assert_deferred(flow: LookupControlFlow<LookupRecords>) {
    assert!(
        matches!(flow, LookupControlFlow::Skip),
        "expected the query to be deferred"
    );
}
