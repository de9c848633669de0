//! Reverse-name store — destination IP → CNAME chain.
//!
//! Fed by the dnsmasq log tailer (an OS thread), read by the supervisor
//! when it creates tracers. Bounded LRU: re-recording an IP moves it to
//! the MRU end, inserting past capacity evicts the LRU entry.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

const MAX_ITEMS: usize = 5000;

/// Shared handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct ReverseNameStore {
    inner: Arc<Mutex<LruCache<String, Vec<String>>>>,
}

impl ReverseNameStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ITEMS)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }

    /// Record the CNAME chain observed for `ip`, promoting it to MRU.
    pub fn record(&self, ip: &str, chain: Vec<String>) {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(ip.to_string(), chain);
    }

    /// The chain for `ip`, or empty. Reads do not affect recency.
    pub fn lookup(&self, ip: &str) -> Vec<String> {
        let cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        cache.peek(ip).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ReverseNameStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_are_empty() {
        let store = ReverseNameStore::new();
        assert!(store.lookup("8.8.8.8").is_empty());
    }

    #[test]
    fn record_then_lookup() {
        let store = ReverseNameStore::new();
        store.record("8.8.8.8", vec!["dns.google".into()]);
        assert_eq!(store.lookup("8.8.8.8"), vec!["dns.google".to_string()]);
    }

    #[test]
    fn rerecord_promotes_to_mru() {
        let store = ReverseNameStore::with_capacity(2);
        store.record("1.1.1.1", vec!["one.one.one.one".into()]);
        store.record("8.8.8.8", vec!["dns.google".into()]);
        // Promote the older entry, then overflow: the other one goes.
        store.record("1.1.1.1", vec!["one.one.one.one".into()]);
        store.record("9.9.9.9", vec!["dns.quad9.net".into()]);
        assert!(store.lookup("8.8.8.8").is_empty(), "LRU entry evicted");
        assert_eq!(store.lookup("1.1.1.1"), vec!["one.one.one.one".to_string()]);
        assert_eq!(store.lookup("9.9.9.9"), vec!["dns.quad9.net".to_string()]);
    }

    #[test]
    fn capacity_evicts_lru() {
        let store = ReverseNameStore::with_capacity(2);
        store.record("1.1.1.1", vec![]);
        store.record("2.2.2.2", vec![]);
        store.record("3.3.3.3", vec![]);
        assert_eq!(store.len(), 2);
        assert!(store.lookup("1.1.1.1").is_empty());
    }
}
