//! Hop enrichment — registry, DNS and ROA metadata per hop IP.
//!
//! `hop_info` fronts a TTL cache; misses run the composed lookup under a
//! bounded worker semaphore so a burst of fresh hops cannot flood the
//! external services. Records without a meaningful ASN are returned but
//! never cached, so unresolved hops are retried on the next cycle.
//!
//! The registry lookup splits the way classic RDAP clients do it
//! internally: network data (name, country) from RDAP over HTTP, the
//! ASN/prefix fields from the origin-ASN DNS zone.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Instant;

use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use pathvis_common::models::Hop;
use pathvis_common::protocol::HopInfo;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::rpki::RoaChecker;
use crate::util::utc_now;

/// How long a resolved hop stays cached, seconds.
pub const HOP_CACHE_TTL_SECS: u64 = 3600;
/// Concurrent enrichment lookups across all subscribers.
const MAX_WORKERS: usize = 5;
/// Where RDAP queries for arbitrary IPs get answered (redirects to the
/// owning RIR).
pub const RDAP_BASE_URL: &str = "https://rdap.org";

// ── TTL cache ───────────────────────────────────────────────────────

/// Hop-IP → enrichment record, with an expiry index so the sweep never
/// scans the whole map. Every cached key has exactly one index entry.
#[derive(Default)]
pub struct HopCache {
    entries: HashMap<String, HopInfo>,
    expiry: BTreeMap<u64, Vec<String>>,
}

impl HopCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry whose expiry time is strictly before `now_ms`.
    pub fn sweep(&mut self, now_ms: u64) {
        let keep = self.expiry.split_off(&now_ms);
        let expired = std::mem::replace(&mut self.expiry, keep);
        for ips in expired.values() {
            for ip in ips {
                self.entries.remove(ip);
            }
        }
    }

    pub fn get(&self, ip: &str) -> Option<&HopInfo> {
        self.entries.get(ip)
    }

    pub fn insert(&mut self, ip: String, info: HopInfo, expires_ms: u64) {
        self.expiry.entry(expires_ms).or_default().push(ip.clone());
        self.entries.insert(ip, info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Registry lookup ─────────────────────────────────────────────────

/// The ASN-level fields of an enrichment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnInfo {
    pub asn: String,
    pub cidr: String,
    pub country: String,
    pub description: String,
}

impl AsnInfo {
    /// The default record when the registry gave us nothing.
    pub fn unknown() -> Self {
        Self {
            asn: "*".into(),
            cidr: "*".into(),
            country: "*".into(),
            description: "*".into(),
        }
    }

    /// Synthetic record for RFC1918 / RFC4193 space, which never goes
    /// out to the registries.
    pub fn private() -> Self {
        Self {
            asn: "private_ip".into(),
            description: "RFC1918/RFC4193".into(),
            ..Self::unknown()
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("rdap request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rdap rate limited (429)")]
    RateLimited,
    #[error("origin asn lookup failed: {0}")]
    Lookup(#[from] ResolveError),
    #[error("origin asn answer malformed")]
    Malformed,
}

pub struct RegistryClient {
    http: reqwest::Client,
    resolver: TokioAsyncResolver,
    rdap_base: String,
}

/// One parsed origin-ASN TXT answer:
/// `15169 | 8.8.8.0/24 | US | arin | 2023-12-28`.
#[derive(Debug, PartialEq, Eq)]
struct OriginRecord {
    asn: String,
    prefix: String,
    country: String,
}

impl RegistryClient {
    pub fn new(http: reqwest::Client, resolver: TokioAsyncResolver, rdap_base: String) -> Self {
        Self {
            http,
            resolver,
            rdap_base,
        }
    }

    /// Registry lookup for one address. Any recognized failure maps to
    /// the `*` record at the caller.
    pub async fn lookup(&self, ip: IpAddr) -> Result<AsnInfo, RegistryError> {
        let network = self.rdap_network(ip).await?;
        let origin = self.origin_asn(ip).await?;
        let description = match self.as_description(&origin.asn).await {
            Some(d) => d,
            None => network.name.unwrap_or_else(|| "*".into()),
        };
        let country = if origin.country.is_empty() {
            network.country.unwrap_or_else(|| "*".into())
        } else {
            origin.country
        };
        Ok(AsnInfo {
            asn: origin.asn,
            cidr: origin.prefix,
            country,
            description,
        })
    }

    async fn rdap_network(&self, ip: IpAddr) -> Result<RdapNetwork, RegistryError> {
        let url = format!("{}/ip/{}", self.rdap_base, ip);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RegistryError::RateLimited);
        }
        let body: serde_json::Value = response.error_for_status()?.json().await?;
        Ok(RdapNetwork {
            name: body.get("name").and_then(|v| v.as_str()).map(str::to_string),
            country: body
                .get("country")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn origin_asn(&self, ip: IpAddr) -> Result<OriginRecord, RegistryError> {
        let answer = self.resolver.txt_lookup(origin_query_name(&ip)).await?;
        let record = answer
            .iter()
            .filter_map(|txt| parse_origin_record(&join_txt(txt.txt_data())))
            .next()
            .ok_or(RegistryError::Malformed)?;
        Ok(record)
    }

    /// Human description for an AS number; best effort.
    async fn as_description(&self, asn: &str) -> Option<String> {
        let name = format!("AS{asn}.asn.cymru.com.");
        let answer = self.resolver.txt_lookup(name).await.ok()?;
        answer
            .iter()
            .filter_map(|txt| parse_as_description(&join_txt(txt.txt_data())))
            .next()
    }
}

struct RdapNetwork {
    name: Option<String>,
    country: Option<String>,
}

fn join_txt(strings: &[Box<[u8]>]) -> String {
    strings
        .iter()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_origin_record(record: &str) -> Option<OriginRecord> {
    let fields: Vec<&str> = record.split('|').map(str::trim).collect();
    if fields.len() < 3 {
        return None;
    }
    // An address can originate from several ASes; keep the first.
    let asn = fields[0].split_whitespace().next()?.to_string();
    Some(OriginRecord {
        asn,
        prefix: fields[1].to_string(),
        country: fields[2].to_string(),
    })
}

fn parse_as_description(record: &str) -> Option<String> {
    let description = record.rsplit('|').next()?.trim();
    if description.is_empty() {
        None
    } else {
        Some(description.to_string())
    }
}

/// The origin-ASN zone name for an address.
fn origin_query_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.origin.asn.cymru.com.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = reversed_nibbles(v6);
            name.push_str(".origin6.asn.cymru.com.");
            name
        }
    }
}

/// The PTR zone name for an address.
pub fn reverse_dns_name(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = reversed_nibbles(v6);
            name.push_str(".ip6.arpa.");
            name
        }
    }
}

fn reversed_nibbles(v6: &std::net::Ipv6Addr) -> String {
    let mut nibbles = Vec::with_capacity(32);
    for octet in v6.octets().iter().rev() {
        nibbles.push(format!("{:x}", octet & 0x0f));
        nibbles.push(format!("{:x}", octet >> 4));
    }
    nibbles.join(".")
}

/// RFC1918 v4 (plus loopback and link-local) and ULA / link-local /
/// loopback v6 — these never go out to the registries.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || (seg0 & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (seg0 & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

// ── DIS TXT records ─────────────────────────────────────────────────

/// `v=DIS1 ip=192.0.2.1 ...` — the operator convention for advertising
/// a per-hop information endpoint in reverse DNS. The last matching
/// record wins.
fn parse_dis_records(records: &[String]) -> Option<String> {
    let record = records.iter().rev().find(|r| r.starts_with("v=DIS1"))?;
    let mut pairs = HashMap::new();
    for kvpair in record.split_whitespace() {
        if let Some((k, v)) = kvpair.split_once('=') {
            pairs.insert(k, v);
        }
    }
    pairs.get("ip").map(|v| v.to_string())
}

// ── Enricher ────────────────────────────────────────────────────────

pub struct Enricher {
    cache: Mutex<HopCache>,
    registry: RegistryClient,
    resolver: TokioAsyncResolver,
    roa: RoaChecker,
    workers: Semaphore,
}

impl Enricher {
    pub fn new(
        resolver: TokioAsyncResolver,
        http: reqwest::Client,
        roa: RoaChecker,
        rdap_base: String,
    ) -> Self {
        Self {
            cache: Mutex::new(HopCache::new()),
            registry: RegistryClient::new(http, resolver.clone(), rdap_base),
            resolver,
            roa,
            workers: Semaphore::new(MAX_WORKERS),
        }
    }

    /// Enrichment record for a hop, TTL-cached. Missing hops get the
    /// unresolved record without touching cache or network.
    pub async fn hop_info(&self, hop: &Hop) -> HopInfo {
        self.hop_info_ttl(hop, HOP_CACHE_TTL_SECS).await
    }

    pub async fn hop_info_ttl(&self, hop: &Hop, cache_ttl: u64) -> HopInfo {
        let ip = match hop {
            Some(ip) => ip.as_str(),
            None => return HopInfo::unresolved(None),
        };

        let now_ms = (utc_now() * 1000.0) as u64;
        {
            let mut cache = self.cache.lock().await;
            cache.sweep(now_ms);
            tracing::debug!(
                target: "path_traceroute.node_info",
                cached_hops = cache.len(),
                "hop cache swept"
            );
            if let Some(hit) = cache.get(ip) {
                tracing::debug!(target: "path_traceroute.node_info", ip, "hop_info served from cache");
                return hit.clone();
            }
        }

        let permit = self.workers.acquire().await.ok();
        let started = Instant::now();
        let info = self.get_info(ip).await;
        drop(permit);
        tracing::info!(
            target: "path_traceroute.node_info",
            ip,
            elapsed_s = format_args!("{:.2}", started.elapsed().as_secs_f64()),
            "hop information gathered"
        );

        let meaningful = info
            .asn
            .as_deref()
            .map(|asn| asn != "*" && asn != "NA")
            .unwrap_or(false);
        if meaningful {
            let mut cache = self.cache.lock().await;
            cache.insert(ip.to_string(), info.clone(), now_ms + cache_ttl * 1000);
        }
        info
    }

    /// The composed lookup for one hop address.
    async fn get_info(&self, ip_str: &str) -> HopInfo {
        let ip: IpAddr = match ip_str.parse() {
            Ok(ip) => ip,
            Err(_) => return HopInfo::unresolved(Some(ip_str.to_string())),
        };

        let asn_info = if is_private_address(&ip) {
            AsnInfo::private()
        } else {
            match self.registry.lookup(ip).await {
                Ok(info) => info,
                Err(RegistryError::RateLimited) => {
                    tracing::error!(target: "path_traceroute.node_info", ip = ip_str, "registry rate limited");
                    AsnInfo::unknown()
                }
                Err(e) => {
                    tracing::debug!(
                        target: "path_traceroute.node_info",
                        ip = ip_str,
                        error = %e,
                        "registry lookup failed"
                    );
                    AsnInfo::unknown()
                }
            }
        };

        let hostname = self.get_hostname(&ip, ip_str).await;
        let dis = self.get_dis(&ip).await;
        assemble_record(ip_str, asn_info, hostname, dis, &self.roa)
    }

    /// PTR name for the address, or the address itself when unnamed.
    async fn get_hostname(&self, ip: &IpAddr, ip_str: &str) -> String {
        match self.resolver.reverse_lookup(*ip).await {
            Ok(answer) => answer
                .iter()
                .next()
                .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
                .unwrap_or_else(|| ip_str.to_string()),
            Err(_) => ip_str.to_string(),
        }
    }

    /// The DIS endpoint advertised in the hop's reverse-DNS TXT, if any.
    async fn get_dis(&self, ip: &IpAddr) -> Option<String> {
        let answer = self.resolver.txt_lookup(reverse_dns_name(ip)).await.ok()?;
        // A TXT record may consist of multiple character-strings; join
        // them before inspection.
        let records: Vec<String> = answer.iter().map(|txt| join_txt(txt.txt_data())).collect();
        parse_dis_records(&records)
    }
}

/// Final record assembly; pure so the shape is testable offline.
fn assemble_record(
    ip: &str,
    asn_info: AsnInfo,
    hostname: String,
    dis: Option<String>,
    roa: &RoaChecker,
) -> HopInfo {
    let domain = derive_domain(ip, &hostname);
    let roa_state = if roa.roa_valid(&asn_info.asn, &asn_info.cidr) {
        "valid"
    } else {
        "invalid"
    };
    HopInfo {
        asn: Some(asn_info.asn),
        cidr: Some(asn_info.cidr),
        country: Some(asn_info.country),
        description: Some(asn_info.description),
        dis,
        domain: Some(domain),
        hostname: Some(hostname),
        ip: Some(ip.to_string()),
        roa: Some(roa_state.to_string()),
    }
}

/// domain.tld for a hop: the last two labels of its reverse name, or
/// the address itself when it has no name.
fn derive_domain(ip: &str, hostname: &str) -> String {
    if hostname == ip {
        return ip.to_string();
    }
    let labels: Vec<&str> = hostname.split('.').collect();
    if labels.len() <= 2 {
        hostname.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}
