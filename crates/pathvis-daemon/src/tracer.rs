//! Per-destination tracer task.
//!
//! Each active destination gets one `Tracer` running a periodic probe
//! loop: pick a protocol from the rotation, run one traceroute, filter
//! and merge the result, detect path changes, and append accepted traces
//! to the history the publisher reads. Destinations that stop showing up
//! in trace results back off exponentially-ish (interval × failcount).
//!
//! On loop exit — stop or shutdown — a sentinel trace with empty hops and
//! `change=true` closes the history so subscribers get a final event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pathvis_common::models::{Hop, PortSet, Trace};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::traceroute::{Protocol, Traceroute};
use crate::util::utc_now;

pub const TRACE_INTERVAL_SECS: u64 = 5;
const MAX_TTL: usize = 64;
const PROBE_TIMEOUT_SECS: u64 = 3;
const GIVEUP: usize = 5;
/// Protocol preference when cycling through a capability set.
const PREFERRED: [Protocol; 3] = [Protocol::Icmp, Protocol::Udp, Protocol::Tcp];

#[derive(Debug, Error)]
#[error("got empty destination")]
pub struct EmptyDestination;

// ── Protocol rotation ───────────────────────────────────────────────

/// Ring over a destination's capability set: the preferred protocols
/// first, then the remaining capabilities; each selection rotates.
pub struct ProtocolCycle {
    ring: VecDeque<Protocol>,
}

impl ProtocolCycle {
    pub fn new(capabilities: &std::collections::BTreeSet<Protocol>, preferred: &[Protocol]) -> Self {
        let mut ring: VecDeque<Protocol> = preferred
            .iter()
            .filter(|p| capabilities.contains(p))
            .copied()
            .collect();
        ring.extend(capabilities.iter().filter(|p| !preferred.contains(p)).copied());
        Self { ring }
    }

    pub fn next_proto(&mut self) -> Option<Protocol> {
        let proto = self.ring.pop_front()?;
        self.ring.push_back(proto);
        Some(proto)
    }
}

// ── Failure back-off ────────────────────────────────────────────────

/// Bookkeeping for destinations the trace no longer reaches.
#[derive(Debug, Default)]
pub struct FailureBackoff {
    failcount: u32,
    backoff_until: Option<f64>,
}

impl FailureBackoff {
    pub fn in_backoff(&self, now: f64) -> bool {
        matches!(self.backoff_until, Some(until) if now < until)
    }

    /// Account one trace result: `reached` is whether the destination
    /// appeared in it.
    pub fn record(&mut self, reached: bool, now: f64, trace_interval: f64) {
        if reached {
            self.failcount = 0;
            self.backoff_until = None;
        } else {
            self.failcount += 1;
            if self.failcount > 1 {
                self.backoff_until = Some(now + trace_interval * f64::from(self.failcount));
            }
        }
    }

    pub fn failcount(&self) -> u32 {
        self.failcount
    }

    pub fn backoff_until(&self) -> Option<f64> {
        self.backoff_until
    }
}

// ── Trace acceptance ────────────────────────────────────────────────

/// Pointwise merge: keep the old hop wherever the new one is missing,
/// so single-probe packet loss doesn't mask a stable path.
pub fn merge_hops(prev: &[Hop], new: &[Hop]) -> Vec<Hop> {
    prev.iter()
        .zip(new)
        .map(|(old, new)| new.clone().or_else(|| old.clone()))
        .collect()
}

/// The filter/merge/change pipeline for one destination, fed raw probe
/// results in order.
pub struct TraceSession {
    destination: String,
    max_hops: usize,
    only_changes: bool,
    last: Option<Vec<Hop>>,
    dports_last: Option<PortSet>,
}

impl TraceSession {
    pub fn new(destination: &str, max_hops: usize, only_changes: bool) -> Self {
        Self {
            destination: destination.to_string(),
            max_hops,
            only_changes,
            last: None,
            dports_last: None,
        }
    }

    /// Run one raw result through the acceptance rules. Returns the
    /// trace to append to history, or `None` when filtered or unchanged
    /// under `only_changes`.
    pub fn process(
        &mut self,
        hops: Vec<Hop>,
        dports: &PortSet,
        cnames: &[String],
        start: f64,
        duration: f64,
    ) -> Option<Trace> {
        if hops.iter().all(Option::is_none) {
            return None;
        }
        if hops.len() == self.max_hops - 1 {
            // Runaway result, almost certainly crap in the output.
            return None;
        }
        if hops.last().map(Option::is_none).unwrap_or(true) {
            // Didn't reach the destination.
            return None;
        }

        let merged = match &self.last {
            Some(last) if last.len() == hops.len() => merge_hops(last, &hops),
            _ => hops,
        };

        let change = match (&self.last, &self.dports_last) {
            (Some(last), Some(dports_last)) => !(merged == *last && dports_last == dports),
            _ => true,
        };
        if change {
            tracing::warn!(
                target: "path_traceroute.tracer",
                destination = %self.destination,
                old = ?self.last,
                new = ?merged,
                dports = ?dports,
                "path change"
            );
        }
        self.last = Some(merged.clone());
        self.dports_last = Some(dports.clone());

        if !self.only_changes || change {
            Some(Trace {
                start,
                destination: self.destination.clone(),
                change,
                duration,
                hops: merged,
                traceback: Vec::new(),
                dports: dports.clone(),
                cnames: cnames.to_vec(),
            })
        } else {
            None
        }
    }
}

// ── Tracer task ─────────────────────────────────────────────────────

/// Tracks (and performs) periodic traces to one destination.
pub struct Tracer {
    destination: String,
    only_changes: bool,
    proto_override: Option<Protocol>,
    trace_interval: Duration,
    cnames: Vec<String>,
    dports: Mutex<PortSet>,
    history: Mutex<Vec<Trace>>,
    running: AtomicBool,
    stop_notify: Notify,
    probe: Traceroute,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Tracer {
    pub fn new(
        destination: &str,
        only_changes: bool,
        proto: Option<Protocol>,
        cnames: Vec<String>,
        dports: PortSet,
    ) -> Result<Self, EmptyDestination> {
        if destination.is_empty() {
            return Err(EmptyDestination);
        }
        Ok(Self {
            destination: destination.to_string(),
            only_changes,
            proto_override: proto,
            trace_interval: Duration::from_secs(TRACE_INTERVAL_SECS),
            cnames,
            dports: Mutex::new(dports),
            history: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            probe: Traceroute::new(PROBE_TIMEOUT_SECS, MAX_TTL, GIVEUP),
            task: Mutex::new(None),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn cnames(&self) -> &[String] {
        &self.cnames
    }

    /// Current destination ports; replaced in-place by the supervisor.
    pub fn set_dports(&self, dports: PortSet) {
        *self.dports.lock().unwrap_or_else(|e| e.into_inner()) = dports;
    }

    pub fn dports(&self) -> PortSet {
        self.dports.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Snapshot of the accepted traces so far.
    pub fn history(&self) -> Vec<Trace> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Launch the periodic loop. One task per tracer.
    pub fn start(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let me = Arc::clone(&self);
        let handle = tokio::spawn(async move { me.run_loop().await });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the loop: kill any in-flight probe and await the task.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.probe.kill();
        self.stop_notify.notify_one();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(
                    target: "path_traceroute.tracer",
                    destination = %self.destination,
                    error = %e,
                    "tracer task ended abnormally"
                );
            }
        }
    }

    async fn run_loop(&self) {
        tracing::info!(target: "path_traceroute.tracer", destination = %self.destination, "start tracing");
        let mut session = TraceSession::new(&self.destination, MAX_TTL, self.only_changes);
        let mut cycle: Option<ProtocolCycle> = None;
        let mut backoff = FailureBackoff::default();

        while self.running.load(Ordering::SeqCst) {
            let start = utc_now();
            let hops = self.one_trace(&mut cycle, &mut backoff).await;
            let duration = utc_now() - start;
            let dports = self.dports();
            if let Some(trace) = session.process(hops, &dports, &self.cnames, start, duration) {
                self.history
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(trace);
            }
            if self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(self.trace_interval) => {}
                    _ = self.stop_notify.notified() => {}
                }
            }
        }

        tracing::info!(target: "path_traceroute.tracer", destination = %self.destination, "stopped tracing");
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Trace::sentinel(&self.destination, utc_now(), self.cnames.clone()));
    }

    /// One probe attempt, honoring back-off and cycling the protocol.
    async fn one_trace(
        &self,
        cycle: &mut Option<ProtocolCycle>,
        backoff: &mut FailureBackoff,
    ) -> Vec<Hop> {
        let now = utc_now();
        if backoff.in_backoff(now) {
            if let Some(until) = backoff.backoff_until() {
                tracing::info!(
                    target: "path_traceroute.tracer",
                    destination = %self.destination,
                    failcount = backoff.failcount(),
                    next_attempt_s = format_args!("{:.0}", until - now),
                    "trace backing off"
                );
            }
            return Vec::new();
        }

        let proto = match self.proto_override {
            Some(proto) => proto,
            None => {
                let cycle = cycle.get_or_insert_with(|| {
                    ProtocolCycle::new(&self.probe.capabilities_for_host(&self.destination), &PREFERRED)
                });
                let proto = cycle.next_proto().unwrap_or(Protocol::Udp);
                tracing::info!(
                    target: "path_traceroute.tracer",
                    destination = %self.destination,
                    proto = %proto,
                    "cycling protocol"
                );
                proto
            }
        };

        let started = Instant::now();
        let result = match self.probe.trace(&self.destination, proto).await {
            Ok(hops) => {
                tracing::info!(
                    target: "path_traceroute.tracer",
                    destination = %self.destination,
                    proto = %proto,
                    elapsed_s = format_args!("{:.2}", started.elapsed().as_secs_f64()),
                    "traceroute finished"
                );
                hops
            }
            Err(e) => {
                tracing::error!(
                    target: "path_traceroute.tracer",
                    destination = %self.destination,
                    error = %e,
                    "traceroute failed"
                );
                Vec::new()
            }
        };

        let reached = result.iter().flatten().any(|hop| hop == &self.destination);
        backoff.record(reached, utc_now(), self.trace_interval.as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn hops(pattern: &[&str]) -> Vec<Hop> {
        pattern
            .iter()
            .map(|h| if *h == "-" { None } else { Some(h.to_string()) })
            .collect()
    }

    fn ports(list: &[&str]) -> PortSet {
        list.iter().map(|p| p.to_string()).collect()
    }

    // ── Protocol cycle ──────────────────────────────────────────────

    #[test]
    fn cycle_prefers_then_rotates() {
        let caps: BTreeSet<Protocol> =
            [Protocol::Icmp, Protocol::Udp, Protocol::Tcp, Protocol::Gre].into();
        let mut cycle = ProtocolCycle::new(&caps, &PREFERRED);
        let picks: Vec<Protocol> = (0..5).filter_map(|_| cycle.next_proto()).collect();
        assert_eq!(
            picks,
            [Protocol::Icmp, Protocol::Udp, Protocol::Tcp, Protocol::Gre, Protocol::Icmp]
        );
    }

    #[test]
    fn cycle_over_restricted_capabilities() {
        let caps: BTreeSet<Protocol> = [Protocol::Udp].into();
        let mut cycle = ProtocolCycle::new(&caps, &PREFERRED);
        assert_eq!(cycle.next_proto(), Some(Protocol::Udp));
        assert_eq!(cycle.next_proto(), Some(Protocol::Udp));
    }

    // ── Merge law ───────────────────────────────────────────────────

    #[test]
    fn merge_keeps_old_hop_where_new_is_missing() {
        let prev = hops(&["a", "b", "c", "8.8.8.8"]);
        let new = hops(&["a", "-", "c", "8.8.8.8"]);
        assert_eq!(merge_hops(&prev, &new), hops(&["a", "b", "c", "8.8.8.8"]));
        let new = hops(&["a", "x", "c", "8.8.8.8"]);
        assert_eq!(merge_hops(&prev, &new), hops(&["a", "x", "c", "8.8.8.8"]));
    }

    // ── Filter rules ────────────────────────────────────────────────

    #[test]
    fn all_missing_is_filtered() {
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        assert!(session.process(hops(&["-", "-", "-"]), &ports(&["443"]), &[], 1.0, 0.5).is_none());
        assert!(session.process(Vec::new(), &ports(&["443"]), &[], 2.0, 0.0).is_none());
    }

    #[test]
    fn runaway_length_is_filtered() {
        let mut session = TraceSession::new("8.8.8.8", 4, true);
        // length == max_hops - 1
        assert!(session
            .process(hops(&["a", "b", "8.8.8.8"]), &ports(&["443"]), &[], 1.0, 0.5)
            .is_none());
    }

    #[test]
    fn unterminated_trace_is_filtered() {
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        assert!(session
            .process(hops(&["a", "b", "-"]), &ports(&["443"]), &[], 1.0, 0.5)
            .is_none());
    }

    // ── Change detection scenarios ──────────────────────────────────

    #[test]
    fn steady_path_emits_once() {
        // S1: first trace changes, identical repeats don't.
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        let path = ["10.0.0.1", "10.0.0.2", "8.8.8.8"];
        let dports = ports(&["443"]);
        let first = session.process(hops(&path), &dports, &[], 1.0, 0.5).unwrap();
        assert!(first.change);
        assert!(session.process(hops(&path), &dports, &[], 2.0, 0.5).is_none());
        assert!(session.process(hops(&path), &dports, &[], 3.0, 0.5).is_none());
    }

    #[test]
    fn hop_change_is_detected() {
        // S2: one differing hop produces change=true.
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        let dports = ports(&["443"]);
        session
            .process(hops(&["10.0.0.1", "10.0.0.2", "8.8.8.8"]), &dports, &[], 1.0, 0.5)
            .unwrap();
        let second = session
            .process(hops(&["10.0.0.1", "10.0.0.9", "8.8.8.8"]), &dports, &[], 2.0, 0.5)
            .unwrap();
        assert!(second.change);
    }

    #[test]
    fn packet_loss_merge_suppresses_change() {
        // S3: a missing middle hop merges from the previous trace.
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        let dports = ports(&["443"]);
        session
            .process(hops(&["a", "b", "c", "8.8.8.8"]), &dports, &[], 1.0, 0.5)
            .unwrap();
        assert!(session
            .process(hops(&["a", "-", "c", "8.8.8.8"]), &dports, &[], 2.0, 0.5)
            .is_none());
    }

    #[test]
    fn dport_change_alone_is_a_change() {
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        let path = ["10.0.0.1", "8.8.8.8"];
        session.process(hops(&path), &ports(&["443"]), &[], 1.0, 0.5).unwrap();
        let second = session
            .process(hops(&path), &ports(&["443", "853"]), &[], 2.0, 0.5)
            .unwrap();
        assert!(second.change);
        assert_eq!(second.dports, ports(&["443", "853"]));
    }

    #[test]
    fn unchanged_traces_are_kept_without_only_changes() {
        let mut session = TraceSession::new("8.8.8.8", 64, false);
        let path = ["10.0.0.1", "8.8.8.8"];
        let dports = ports(&["443"]);
        assert!(session.process(hops(&path), &dports, &[], 1.0, 0.5).unwrap().change);
        let second = session.process(hops(&path), &dports, &[], 2.0, 0.5).unwrap();
        assert!(!second.change);
    }

    #[test]
    fn trace_carries_current_cnames() {
        let mut session = TraceSession::new("8.8.8.8", 64, true);
        let cnames = vec!["dns.google".to_string()];
        let trace = session
            .process(hops(&["10.0.0.1", "8.8.8.8"]), &ports(&["443"]), &cnames, 1.0, 0.5)
            .unwrap();
        assert_eq!(trace.cnames, cnames);
    }

    // ── Back-off (S5) ───────────────────────────────────────────────

    #[test]
    fn backoff_after_second_failure() {
        let mut backoff = FailureBackoff::default();
        let interval = 5.0;
        backoff.record(false, 100.0, interval);
        assert_eq!(backoff.failcount(), 1);
        assert!(!backoff.in_backoff(100.0));
        backoff.record(false, 105.0, interval);
        assert_eq!(backoff.failcount(), 2);
        assert_eq!(backoff.backoff_until(), Some(105.0 + 10.0));
        assert!(backoff.in_backoff(106.0));
        assert!(!backoff.in_backoff(115.0));
    }

    #[test]
    fn success_clears_backoff() {
        let mut backoff = FailureBackoff::default();
        backoff.record(false, 0.0, 5.0);
        backoff.record(false, 5.0, 5.0);
        assert!(backoff.in_backoff(6.0));
        backoff.record(true, 20.0, 5.0);
        assert_eq!(backoff.failcount(), 0);
        assert_eq!(backoff.backoff_until(), None);
    }

    // ── Tracer construction ─────────────────────────────────────────

    #[test]
    fn empty_destination_is_rejected() {
        assert!(Tracer::new("", true, None, Vec::new(), PortSet::new()).is_err());
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let tracer =
            Tracer::new("8.8.8.8", true, None, Vec::new(), PortSet::new()).unwrap();
        tracer.stop().await;
        assert!(tracer.history().is_empty());
    }

    #[tokio::test]
    async fn sentinel_appended_on_stop() {
        let tracer = Arc::new(
            Tracer::new("192.0.2.55", true, Some(Protocol::Udp), vec!["x.example".into()], PortSet::new())
                .unwrap(),
        );
        Arc::clone(&tracer).start();
        // Give the loop a moment to enter its first probe, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracer.stop().await;
        let history = tracer.history();
        let last = history.last().expect("sentinel trace");
        assert!(last.change);
        assert!(last.hops.is_empty());
        assert_eq!(last.duration, 0.0);
        assert_eq!(last.cnames, vec!["x.example".to_string()]);
    }
}
