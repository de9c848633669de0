//! Wire protocol for the websocket push channel.
//!
//! Subscribers receive a stream of text frames. The first frame after
//! connect is the literal `clear_cache`; every frame after that is one
//! JSON-encoded [`TraceFrame`], serialized with sorted keys and 2-space
//! indentation (field order below is alphabetical on purpose — serde
//! emits struct fields in declaration order).

use serde::{Deserialize, Serialize};

use crate::models::Trace;

/// Control frame telling a fresh subscriber to drop any prior state.
pub const CLEAR_CACHE: &str = "clear_cache";

/// Per-hop enrichment record. Every field is a string or null; `asn`
/// carries `*` when the registry lookup failed and `private_ip` for
/// RFC1918/RFC4193 space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopInfo {
    pub asn: Option<String>,
    pub cidr: Option<String>,
    pub country: Option<String>,
    pub description: Option<String>,
    pub dis: Option<String>,
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub roa: Option<String>,
}

impl HopInfo {
    /// The record produced when no registry data could be obtained —
    /// also used verbatim for non-responding hops.
    pub fn unresolved(ip: Option<String>) -> Self {
        Self {
            asn: Some("*".into()),
            cidr: Some("*".into()),
            country: Some("*".into()),
            description: Some("*".into()),
            dis: None,
            domain: None,
            hostname: None,
            ip,
            roa: Some("invalid".into()),
        }
    }
}

/// One published trace, hops replaced by `(position, enrichment)` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFrame {
    pub change: bool,
    pub cnames: Vec<String>,
    pub destination: String,
    pub dports: Vec<String>,
    pub duration: f64,
    /// `true` for a newly published trace, `false` for the closing
    /// frame of a removed destination.
    pub new: bool,
    pub start: f64,
    pub trace: Vec<(usize, HopInfo)>,
}

impl TraceFrame {
    /// Assemble a frame from an accepted trace and its enriched hops.
    pub fn assemble(trace: &Trace, enriched: Vec<HopInfo>, new: bool) -> Self {
        Self {
            change: trace.change,
            cnames: trace.cnames.clone(),
            destination: trace.destination.clone(),
            dports: trace.dports.iter().cloned().collect(),
            duration: trace.duration,
            new,
            start: trace.start,
            trace: enriched.into_iter().enumerate().collect(),
        }
    }

    /// Serialize for the wire: sorted keys, 2-space indent.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PortSet;

    fn sample_trace() -> Trace {
        let mut dports = PortSet::new();
        dports.insert("443".into());
        Trace {
            start: 1700000000.0,
            destination: "8.8.8.8".into(),
            change: true,
            duration: 1.5,
            hops: vec![Some("10.0.0.1".into()), Some("8.8.8.8".into())],
            traceback: Vec::new(),
            dports,
            cnames: vec!["dns.google".into()],
        }
    }

    #[test]
    fn frame_keys_are_sorted() {
        let trace = sample_trace();
        let enriched = vec![
            HopInfo::unresolved(Some("10.0.0.1".into())),
            HopInfo::unresolved(Some("8.8.8.8".into())),
        ];
        let json = TraceFrame::assemble(&trace, enriched, true).to_json().unwrap();
        let keys: Vec<usize> = [
            "\"change\"",
            "\"cnames\"",
            "\"destination\"",
            "\"dports\"",
            "\"duration\"",
            "\"new\"",
            "\"start\"",
            "\"trace\"",
        ]
        .iter()
        .map(|k| json.find(k).unwrap())
        .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted, "top-level keys must appear in sorted order");
        assert!(json.starts_with("{\n  \""), "2-space indentation expected");
    }

    #[test]
    fn trace_entries_serialize_as_index_pairs() {
        let trace = sample_trace();
        let enriched = vec![HopInfo::unresolved(None), HopInfo::unresolved(None)];
        let frame = TraceFrame::assemble(&trace, enriched, false);
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        let entries = value["trace"].as_array().unwrap();
        assert_eq!(entries[0][0], 0);
        assert_eq!(entries[1][0], 1);
        assert!(entries[1][1]["asn"] == "*");
        assert!(entries[1][1]["hostname"].is_null());
        assert_eq!(value["new"], false);
    }

    #[test]
    fn hop_info_keys_are_sorted() {
        let json = serde_json::to_string_pretty(&HopInfo::unresolved(Some("1.1.1.1".into()))).unwrap();
        let keys: Vec<usize> = [
            "\"asn\"",
            "\"cidr\"",
            "\"country\"",
            "\"description\"",
            "\"dis\"",
            "\"domain\"",
            "\"hostname\"",
            "\"ip\"",
            "\"roa\"",
        ]
        .iter()
        .map(|k| json.find(k).unwrap())
        .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }
}
