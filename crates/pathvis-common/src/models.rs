//! Data models for path tracing.
//!
//! These types flow between the connection sampler, the per-destination
//! tracers and the publisher. A `Trace` is immutable once a tracer has
//! accepted it into its history.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// ── Destinations ────────────────────────────────────────────────────

/// One sampled view of the machine's active remote endpoints:
/// remote IP → set of remote ports (ports kept as strings).
pub type DestinationSnapshot = BTreeMap<String, BTreeSet<String>>;

/// Set of destination ports observed for a single remote host.
pub type PortSet = BTreeSet<String>;

// ── Hops & traces ───────────────────────────────────────────────────

/// One position on the path: the responding router address, or `None`
/// when the probe at that TTL got no answer.
pub type Hop = Option<String>;

/// One complete trace attempt to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// UTC seconds at probe start.
    pub start: f64,
    pub destination: String,
    /// Whether this trace differs (in hops or port set) from the
    /// previously accepted trace to the same destination.
    pub change: bool,
    /// Probe wall time in seconds.
    pub duration: f64,
    /// Ordered hops, position 1..N.
    pub hops: Vec<Hop>,
    /// Reverse-trace slot, unused for now but kept on the record so a
    /// future reverse-probe feature doesn't change the shape.
    pub traceback: Vec<String>,
    /// Destination ports at the time of the trace.
    pub dports: PortSet,
    /// CNAME chain learned for the destination from forward lookups.
    pub cnames: Vec<String>,
}

impl Trace {
    /// The sentinel appended when a tracer shuts down, so subscribers
    /// get a closing event for the destination.
    pub fn sentinel(destination: &str, start: f64, cnames: Vec<String>) -> Self {
        Self {
            start,
            destination: destination.to_string(),
            change: true,
            duration: 0.0,
            hops: Vec::new(),
            traceback: Vec::new(),
            dports: PortSet::new(),
            cnames,
        }
    }

    /// True when every hop in the trace is missing.
    pub fn is_empty_path(&self) -> bool {
        self.hops.iter().all(|h| h.is_none())
    }
}
