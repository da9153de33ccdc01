//! Consul API boundary: client traits, query options, and the HTTP
//! implementation.
//!
//! The watchers only ever speak to Consul through [`CatalogClient`] and
//! [`KvClient`], so tests can drive indexes and payloads deterministically
//! with in-memory doubles.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::Error;

/// How long a blocking query may wait on the Consul side before returning
/// an unchanged index.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Options for a blocking (long-poll) query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Index of the last observed change; zero forces a full response.
    pub wait_index: u64,
    /// Maximum time the registry may hold the request open.
    pub wait_time: Option<Duration>,
}

/// Metadata returned alongside every registry response.
#[derive(Debug, Clone, Copy)]
pub struct QueryMeta {
    /// The registry's current index for the watched resource.
    pub last_index: u64,
}

/// One instance of a catalog service on a node.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogService {
    /// Node address the instance is reachable at.
    #[serde(rename = "Address")]
    pub address: String,
    /// Service metadata key/value pairs.
    #[serde(rename = "ServiceMeta", default)]
    pub service_meta: HashMap<String, String>,
    /// Tags on the service registration.
    #[serde(rename = "ServiceTags", default)]
    pub service_tags: Vec<String>,
}

/// A key/value pair from the Consul KV store, value already decoded.
#[derive(Debug, Clone)]
pub struct KvPair {
    /// Full key path.
    pub key: String,
    /// Decoded value bytes.
    pub value: Vec<u8>,
}

/// A static service definition stored as JSON in the KV store.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticEntry {
    /// Lookup target: a service name or `@service_proxy`.
    pub target: String,
    /// Literal addresses, if known.
    #[serde(default)]
    pub addresses: Vec<Ipv4Addr>,
    /// ACL rule strings, compiled against the network table.
    #[serde(default)]
    pub acl: Vec<String>,
    /// Additional names to publish this entry under.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Catalog side of the registry: service enumeration and per-service
/// detail.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Enumerate registered services with their tags.
    async fn services(
        &self,
        opts: &QueryOptions,
    ) -> Result<(HashMap<String, Vec<String>>, QueryMeta), Error>;

    /// Fetch per-node detail for one service.
    async fn service(&self, name: &str) -> Result<Vec<CatalogService>, Error>;
}

/// KV side of the registry.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Fetch a single key, or `None` if it does not exist.
    async fn get(&self, key: &str, opts: &QueryOptions)
        -> Result<(Option<KvPair>, QueryMeta), Error>;

    /// List all pairs under a prefix.
    async fn list(&self, prefix: &str, opts: &QueryOptions)
        -> Result<(Vec<KvPair>, QueryMeta), Error>;
}

/// Raw KV pair as returned by the HTTP API, value still base64-encoded.
#[derive(Debug, Deserialize)]
struct RawKvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

impl RawKvPair {
    fn decode(self) -> Result<KvPair, Error> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded)?,
            None => Vec::new(),
        };
        Ok(KvPair {
            key: self.key,
            value,
        })
    }
}

/// Consul HTTP API client implementing both registry traits.
pub struct HttpConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpConsulClient {
    /// Create a client for `endpoint` (host:port) over `scheme`.
    pub fn new(endpoint: &str, scheme: &str, token: &str) -> Result<Self, Error> {
        if scheme != "http" && scheme != "https" {
            return Err(Error::Config(format!("unsupported scheme {scheme}")));
        }

        // blocking queries hold the connection open for the full wait
        let http = reqwest::Client::builder()
            .timeout(WATCH_TIMEOUT + Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url: format!("{scheme}://{endpoint}"),
            token: if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            },
        })
    }

    fn request(&self, path: &str, opts: Option<&QueryOptions>) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        if let Some(opts) = opts {
            req = req.query(&[("index", opts.wait_index.to_string())]);
            if let Some(wait) = opts.wait_time {
                req = req.query(&[("wait", format!("{}s", wait.as_secs()))]);
            }
        }
        req
    }

    fn meta(response: &reqwest::Response, fallback: u64) -> QueryMeta {
        let last_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback);
        QueryMeta { last_index }
    }

    fn status_error(path: &str, response: &reqwest::Response) -> Error {
        Error::ConsulStatus {
            status: response.status(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpConsulClient {
    async fn services(
        &self,
        opts: &QueryOptions,
    ) -> Result<(HashMap<String, Vec<String>>, QueryMeta), Error> {
        let path = "/v1/catalog/services";
        let response = self.request(path, Some(opts)).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(path, &response));
        }

        let meta = Self::meta(&response, opts.wait_index);
        let services = response.json().await?;
        Ok((services, meta))
    }

    async fn service(&self, name: &str) -> Result<Vec<CatalogService>, Error> {
        let path = format!("/v1/catalog/service/{name}");
        let response = self.request(&path, None).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(&path, &response));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl KvClient for HttpConsulClient {
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta), Error> {
        let path = format!("/v1/kv/{key}");
        let response = self.request(&path, Some(opts)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let meta = Self::meta(&response, opts.wait_index);
            return Ok((None, meta));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(&path, &response));
        }

        let meta = Self::meta(&response, opts.wait_index);
        let pairs: Vec<RawKvPair> = response.json().await?;
        let pair = pairs.into_iter().next().map(RawKvPair::decode).transpose()?;
        Ok((pair, meta))
    }

    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<KvPair>, QueryMeta), Error> {
        let path = format!("/v1/kv/{prefix}");
        let response = self
            .request(&path, Some(opts))
            .query(&[("recurse", "true")])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let meta = Self::meta(&response, opts.wait_index);
            return Ok((Vec::new(), meta));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(&path, &response));
        }

        let meta = Self::meta(&response, opts.wait_index);
        let raw: Vec<RawKvPair> = response.json().await?;
        let pairs = raw
            .into_iter()
            .map(RawKvPair::decode)
            .collect::<Result<_, _>>()?;
        Ok((pairs, meta))
    }
}
