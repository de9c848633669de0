//! Connection sampler — which remote hosts are we talking to right now?
//!
//! The preferred path reads the kernel socket table (`/proc/net/tcp` and
//! `/proc/net/tcp6`) and keeps ESTABLISHED rows. When that is not
//! available (non-Linux, or procfs unreadable) it falls back to spawning
//! the platform `netstat` binary and parsing its foreign-address column.
//!
//! Either way the result is a [`DestinationSnapshot`]: remote IP → set of
//! remote ports, with loopback, link-local and v4-mapped-v6 endpoints
//! filtered out.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use pathvis_common::models::DestinationSnapshot;
use thiserror::Error;

use crate::util::{valid_ip, IpVersion};

const IGNORE_HOSTS: [&str; 2] = ["127.0.0.1", "::1"];
const IGNORE_PREFIXES: [&str; 2] = ["fe80:", "::ffff"];

/// TCP state code for ESTABLISHED in the procfs socket table.
const PROC_TCP_ESTABLISHED: &str = "01";

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("netstat fallback failed: {0}")]
    Netstat(#[from] std::io::Error),
    #[error("netstat exited with {0}")]
    NetstatStatus(std::process::ExitStatus),
    #[error("remote hosts contain non-ip key {key:?}")]
    InvalidKey { key: String },
}

/// Where the supervisor gets its destination snapshots from.
pub enum DestinationSource {
    /// The live socket table of this machine.
    Native,
    /// A scripted, cycling list of host lists (`-M`).
    Mock(Mutex<MockSource>),
}

impl DestinationSource {
    pub fn sample(&self, ipv4_only: bool) -> Result<DestinationSnapshot, SamplerError> {
        match self {
            DestinationSource::Native => active_remote_hosts(ipv4_only),
            DestinationSource::Mock(mock) => {
                let mut mock = mock.lock().unwrap_or_else(|e| e.into_inner());
                mock.sample(ipv4_only)
            }
        }
    }
}

/// Sample the machine's ESTABLISHED connections and return the filtered,
/// validated snapshot.
pub fn active_remote_hosts(ipv4_only: bool) -> Result<DestinationSnapshot, SamplerError> {
    let raw = match native_connections(ipv4_only) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::debug!(
                target: "path_traceroute.netstat",
                error = %e,
                "socket table unavailable, falling back to netstat"
            );
            netstat_connections(ipv4_only)?
        }
    };
    let snapshot = filter_snapshot(raw);

    let version = if ipv4_only { Some(IpVersion::V4) } else { None };
    if let Some(key) = snapshot.keys().find(|k| !valid_ip(k, version)) {
        tracing::error!(
            target: "path_traceroute.netstat",
            hosts = ?snapshot,
            "remote hosts contain non-ip values"
        );
        return Err(SamplerError::InvalidKey { key: key.clone() });
    }
    Ok(snapshot)
}

/// Drop loopback, link-local scopes and v4-mapped-v6 endpoints.
fn filter_snapshot(snapshot: DestinationSnapshot) -> DestinationSnapshot {
    snapshot
        .into_iter()
        .filter(|(host, _)| {
            !IGNORE_HOSTS.contains(&host.as_str())
                && !IGNORE_PREFIXES.iter().any(|p| host.starts_with(p))
        })
        .collect()
}

// ── Native path: procfs socket table ────────────────────────────────

fn native_connections(ipv4_only: bool) -> std::io::Result<DestinationSnapshot> {
    let mut snapshot = DestinationSnapshot::new();
    let tcp = std::fs::read_to_string("/proc/net/tcp")?;
    collect_proc_established(&tcp, &mut snapshot);
    if !ipv4_only {
        let tcp6 = std::fs::read_to_string("/proc/net/tcp6")?;
        collect_proc_established(&tcp6, &mut snapshot);
    }
    Ok(snapshot)
}

/// Pick ESTABLISHED remote endpoints out of one procfs socket table.
fn collect_proc_established(table: &str, snapshot: &mut DestinationSnapshot) {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (remote, state) = match (fields.get(2), fields.get(3)) {
            (Some(remote), Some(state)) => (*remote, *state),
            _ => continue,
        };
        if state != PROC_TCP_ESTABLISHED {
            continue;
        }
        if let Some((ip, port)) = parse_proc_endpoint(remote) {
            snapshot
                .entry(ip.to_string())
                .or_insert_with(BTreeSet::new)
                .insert(port.to_string());
        }
    }
}

/// Decode a procfs `ADDR:PORT` endpoint. Addresses are hex-encoded
/// little-endian u32 groups, ports big-endian hex.
fn parse_proc_endpoint(endpoint: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = endpoint.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => {
            let raw = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(raw.to_le_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let group = u32::from_str_radix(&addr[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&group.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some((ip, port))
}

// ── Fallback path: the platform netstat binary ──────────────────────

fn netstat_connections(ipv4_only: bool) -> Result<DestinationSnapshot, SamplerError> {
    let output = std::process::Command::new("netstat").arg("-nalW").output()?;
    if !output.status.success() {
        return Err(SamplerError::NetstatStatus(output.status));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let port_delim = if cfg!(target_os = "linux") { ':' } else { '.' };
    Ok(parse_netstat_output(&text, port_delim, ipv4_only))
}

/// Parse netstat output: keep ESTABLISHED rows, split the 5th column on
/// `port_delim`, strip a `%iface` scope suffix from v6 addresses.
fn parse_netstat_output(text: &str, port_delim: char, ipv4_only: bool) -> DestinationSnapshot {
    let mut snapshot = DestinationSnapshot::new();
    for line in text.lines() {
        if !line.contains("ESTABLISHED") {
            continue;
        }
        let foreign = match line.split_whitespace().nth(4) {
            Some(f) => f,
            None => continue,
        };
        let (destination, port) = match foreign.rsplit_once(port_delim) {
            Some(parts) => parts,
            None => continue,
        };
        let destination = destination.split('%').next().unwrap_or(destination);
        snapshot
            .entry(destination.to_string())
            .or_insert_with(BTreeSet::new)
            .insert(port.to_string());
    }
    if ipv4_only {
        snapshot.retain(|host, _| !host.contains(':'));
    }
    snapshot
}

// ── Mock source ─────────────────────────────────────────────────────

/// Cycles through scripted host lists at a fixed interval. Entries are
/// `addr` or `addr_port`; a bare address gets port `"0"`.
pub struct MockSource {
    lists: Vec<Vec<String>>,
    interval: Duration,
    current: usize,
    switched: Instant,
}

impl MockSource {
    pub fn new(lists: Vec<Vec<String>>, interval: Duration) -> Self {
        Self {
            lists,
            interval,
            current: 0,
            switched: Instant::now(),
        }
    }

    pub fn sample(&mut self, ipv4_only: bool) -> Result<DestinationSnapshot, SamplerError> {
        if self.switched.elapsed() >= self.interval {
            self.switched = Instant::now();
            self.current = (self.current + 1) % self.lists.len().max(1);
        }
        let mut snapshot = DestinationSnapshot::new();
        for entry in self.lists.get(self.current).into_iter().flatten() {
            let (addr, port) = match entry.split_once('_') {
                Some((addr, port)) => (addr, port),
                None => (entry.as_str(), "0"),
            };
            snapshot
                .entry(addr.to_string())
                .or_insert_with(BTreeSet::new)
                .insert(port.to_string());
        }
        if ipv4_only {
            snapshot.retain(|host, _| valid_ip(host, Some(IpVersion::V4)));
        }
        let version = if ipv4_only { Some(IpVersion::V4) } else { None };
        if let Some(key) = snapshot.keys().find(|k| !valid_ip(k, version)) {
            return Err(SamplerError::InvalidKey { key: key.clone() });
        }
        Ok(snapshot)
    }
}
