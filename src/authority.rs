//! The hickory Authority that answers queries from the aggregated catalog.
//!
//! One authority is registered per configured zone. A query is answered by
//! stripping the zone suffixes off the query name, looking the bare name up
//! across the catalog sources, gating on the service ACL, and emitting the
//! target's addresses, ordered by proximity to the requester when the
//! service is fronted by the configured proxy. Names this catalog does not
//! know, and sources the ACL rejects, are skipped so the next authority in
//! the chain can answer.

use async_trait::async_trait;
use futures::future::BoxFuture;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, SOA};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType};
use hickory_resolver::TokioResolver;
use hickory_server::authority::{
    Authority, LookupControlFlow, LookupError, LookupOptions, LookupRecords, MessageRequest,
    UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::SoaConfig;
use crate::error::Error;
use crate::metrics::{self, AnswerSource};
use crate::service::{Service, SERVICE_PROXY_TARGET};

/// Injected upstream A lookup, replaceable in tests.
pub type UpstreamLookup =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<Ipv4Addr>, Error>> + Send + Sync>;

/// Order the proxy's addresses by affinity to the requester.
///
/// Addresses equal to the source come first, then addresses the queried
/// service is known to run on, then the proxy's remaining addresses, each
/// bucket keeping its stored order. The result is always a permutation of
/// the proxy's addresses.
pub fn proxied_addresses_by_proximity(
    source: IpAddr,
    service: &Service,
    proxy: &Service,
) -> Vec<Ipv4Addr> {
    let mut weights: HashMap<Ipv4Addr, u8> = HashMap::new();
    for addr in &service.addresses {
        if IpAddr::V4(*addr) == source {
            weights.insert(*addr, 2);
        } else {
            weights.entry(*addr).or_insert(1);
        }
    }

    let mut head = Vec::new();
    let mut middle = Vec::new();
    let mut tail = Vec::new();
    for addr in &proxy.addresses {
        match weights.get(addr) {
            Some(2) => head.push(*addr),
            Some(_) => middle.push(*addr),
            None => tail.push(*addr),
        }
    }

    head.extend(middle);
    head.extend(tail);
    head
}

/// Strip every configured zone suffix from a fully-qualified query name.
fn strip_zones(qname: &str, zones: &[String]) -> String {
    let mut name = qname.to_ascii_lowercase();
    for zone in zones {
        if let Some(stripped) = name.strip_suffix(&format!(".{zone}")) {
            name = stripped.to_string();
        }
    }
    name
}

/// Authority over one zone, backed by the shared catalog.
pub struct CatalogAuthority {
    origin: LowerName,
    catalog: Arc<Catalog>,
    soa: SoaConfig,
    upstream: UpstreamLookup,
}

impl CatalogAuthority {
    /// Create an authority for `zone` resolving upstream misses through the
    /// system resolver.
    pub fn new(zone: &str, catalog: Arc<Catalog>, soa: SoaConfig) -> Result<Self, Error> {
        let resolver = Arc::new(TokioResolver::builder_tokio()?.build());
        let upstream: UpstreamLookup = Arc::new(move |target: String| {
            let resolver = Arc::clone(&resolver);
            Box::pin(async move {
                let lookup = resolver.ipv4_lookup(target).await?;
                Ok(lookup.iter().map(|a| a.0).collect())
            })
        });

        Self::with_upstream(zone, catalog, soa, upstream)
    }

    /// Create an authority with a custom upstream lookup.
    pub fn with_upstream(
        zone: &str,
        catalog: Arc<Catalog>,
        soa: SoaConfig,
        upstream: UpstreamLookup,
    ) -> Result<Self, Error> {
        let origin = Name::from_ascii(zone)?.into();

        Ok(Self {
            origin,
            catalog,
            soa,
            upstream,
        })
    }

    fn build_a_records(&self, name: Name, addrs: &[Ipv4Addr]) -> RecordSet {
        let mut record_set = RecordSet::new(name.clone(), RecordType::A, 0);

        for addr in addrs {
            let mut record =
                Record::from_rdata(name.clone(), self.catalog.ttl(), RData::A(A(*addr)));
            record.set_dns_class(DNSClass::IN);
            record_set.insert(record, 0);
        }

        record_set
    }

    /// Synthesize the zone SOA. The serial tracks the catalog's last
    /// update time.
    fn build_soa_record(&self) -> RecordSet {
        let serial = self
            .catalog
            .last_updated()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let soa = SOA::new(
            Name::from_ascii(&self.soa.mname).unwrap_or_else(|_| Name::root()),
            Name::from_ascii(&self.soa.rname).unwrap_or_else(|_| Name::root()),
            serial,
            self.soa.refresh as i32,
            self.soa.retry as i32,
            self.soa.expire as i32,
            self.soa.minimum,
        );

        let name = Name::from(self.origin.clone());
        let mut record_set = RecordSet::new(name.clone(), RecordType::SOA, 0);
        let mut record = Record::from_rdata(name, self.catalog.ttl(), RData::SOA(soa));
        record.set_dns_class(DNSClass::IN);
        record_set.insert(record, 0);

        record_set
    }
}

#[async_trait]
impl Authority for CatalogAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::Primary
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // only the zone SOA is served outside the request path; everything
        // else needs the request's source address and goes through search
        if rtype == RecordType::SOA && name == &self.origin {
            let record_set = Arc::new(self.build_soa_record());
            return LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, record_set)));
        }

        LookupControlFlow::Skip
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        let source_ip = request_info.src.ip();
        let qname = request_info.query.name();
        let qtype = request_info.query.query_type();
        let name = strip_zones(&qname.to_string(), self.catalog.zones());

        let Some(svc) = self.catalog.service_for(&name) else {
            debug!(name = %name, "service not found, deferring");
            return LookupControlFlow::Skip;
        };

        if !self.catalog.networks().is_empty() && !svc.responds_to(source_ip) {
            warn!(service = %name, ip = %source_ip, "blocked resolution");
            metrics::record_denied();
            return LookupControlFlow::Skip;
        }

        if qtype != RecordType::A {
            // NODATA: the name exists but carries no records of this type
            debug!(service = %name, qtype = ?qtype, "no answers for query type");
            metrics::record_dropped();
            return LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)));
        }

        let lookup_name = if svc.target == SERVICE_PROXY_TARGET {
            match self.catalog.proxy_service() {
                Some(proxy) => proxy.to_string(),
                None => {
                    warn!(service = %name, "proxy target without a configured proxy, deferring");
                    return LookupControlFlow::Skip;
                }
            }
        } else {
            svc.target.clone()
        };

        debug!(target = %lookup_name, "looking up target");

        let record_name = Name::from(qname.clone());
        let target = self
            .catalog
            .service_for(&lookup_name)
            .filter(|target| !target.addresses.is_empty());

        let record_set = match target {
            Some(target) => {
                let addrs = if svc.target == SERVICE_PROXY_TARGET {
                    proxied_addresses_by_proximity(source_ip, &svc, &target)
                } else {
                    target.addresses.clone()
                };
                debug!(target = %lookup_name, count = addrs.len(), "answering from catalog");
                metrics::record_served(AnswerSource::Api);
                self.build_a_records(record_name, &addrs)
            }
            None => {
                let upstream_target = format!("{lookup_name}.service.consul.");
                debug!(target = %upstream_target, "looking up target upstream");
                match (self.upstream)(upstream_target).await {
                    Ok(addrs) => {
                        debug!(target = %lookup_name, count = addrs.len(), "answering from upstream");
                        metrics::record_served(AnswerSource::Dns);
                        self.build_a_records(record_name, &addrs)
                    }
                    Err(err) => {
                        warn!(target = %lookup_name, %err, "upstream lookup failed");
                        return LookupControlFlow::Break(Err(LookupError::from(io::Error::new(
                            io::ErrorKind::Other,
                            format!("failed to lookup target upstream: {err}"),
                        ))));
                    }
                }
            }
        };

        LookupControlFlow::Break(Ok(LookupRecords::new(lookup_options, Arc::new(record_set))))
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        // DNSSEC not supported
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        // dynamic updates not supported
        Err(ResponseCode::NotImp)
    }
}
