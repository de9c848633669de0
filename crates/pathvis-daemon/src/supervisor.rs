//! Supervisor — keeps the tracer fleet in step with the active
//! destinations.
//!
//! Each tick: take a fresh destination snapshot, stop tracers whose
//! destination vanished, start tracers for new destinations (staggered
//! slightly so a big snapshot doesn't fire every probe at once), refresh
//! the port sets of survivors, and hand (active, removed) to the
//! publisher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::reverse_names::ReverseNameStore;
use crate::sampler::DestinationSource;
use crate::tracer::Tracer;
use crate::traceroute::Protocol;
use crate::util::local_egress_ip;
use crate::ws_server::FleetState;

pub const UPDATE_INTERVAL_SECS: u64 = 10;
/// Pause between tracer starts within one tick.
const START_STAGGER: Duration = Duration::from_millis(50);

pub struct Supervisor {
    pub source: Arc<DestinationSource>,
    pub fleet: Arc<FleetState>,
    pub reverse_names: ReverseNameStore,
    pub update_interval: Duration,
    pub ipv4_only: bool,
    pub proto: Option<Protocol>,
    pub shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Run until the shutdown signal flips; then stop every tracer
    /// concurrently.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut active: Vec<Arc<Tracer>> = Vec::new();

        loop {
            let source = Arc::clone(&self.source);
            let ipv4_only = self.ipv4_only;
            // netstat fallback spawns a subprocess; keep it off the loop.
            let mut snapshot =
                tokio::task::spawn_blocking(move || source.sample(ipv4_only)).await??;
            if let Some(local) = local_egress_ip() {
                snapshot.remove(&local.to_string());
            }
            tracing::info!(
                target: "path_traceroute",
                active_remote_hosts = ?snapshot.keys().collect::<Vec<_>>(),
                "destination snapshot"
            );

            // Stop tracers whose destination is gone.
            let (keep, gone): (Vec<_>, Vec<_>) = active
                .into_iter()
                .partition(|t| snapshot.contains_key(t.destination()));
            for tracer in &gone {
                tracer.stop().await;
            }

            // Start tracers for new destinations, refresh the rest.
            let mut fleet = keep;
            for (addr, dports) in &snapshot {
                if let Some(tracer) = fleet.iter().find(|t| t.destination() == addr) {
                    tracer.set_dports(dports.clone());
                    continue;
                }
                let cnames = self.reverse_names.lookup(addr);
                let tracer = match Tracer::new(addr, true, self.proto, cnames, dports.clone()) {
                    Ok(tracer) => Arc::new(tracer),
                    Err(e) => {
                        tracing::warn!(target: "path_traceroute", addr = %addr, error = %e, "skipping destination");
                        continue;
                    }
                };
                tracing::debug!(
                    target: "path_traceroute",
                    addr = %addr,
                    cnames = ?tracer.cnames(),
                    "starting tracer"
                );
                Arc::clone(&tracer).start();
                fleet.push(tracer);
                tokio::time::sleep(START_STAGGER).await;
            }
            active = fleet;

            self.fleet.update(active.clone(), gone);

            tokio::select! {
                _ = tokio::time::sleep(self.update_interval) => {}
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Shutdown: stop everything in parallel; one slow or failing
        // stop must not hold up the rest.
        let started = Instant::now();
        futures::future::join_all(active.iter().map(|t| t.stop())).await;
        tracing::info!(
            target: "path_traceroute",
            elapsed_s = started.elapsed().as_secs(),
            "stopping tracers done"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::MockSource;
    use std::sync::Mutex;

    fn start_supervisor(
        lists: Vec<Vec<String>>,
        mock_interval: Duration,
        store: ReverseNameStore,
    ) -> (
        Arc<FleetState>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let source = Arc::new(DestinationSource::Mock(Mutex::new(MockSource::new(
            lists,
            mock_interval,
        ))));
        let fleet = Arc::new(FleetState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor {
            source,
            fleet: Arc::clone(&fleet),
            reverse_names: store,
            update_interval: Duration::from_millis(50),
            ipv4_only: false,
            proto: Some(Protocol::Udp),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(supervisor.run());
        (fleet, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_idempotent() {
        let store = ReverseNameStore::new();
        store.record("192.0.2.10", vec!["svc.example.nl".into()]);
        let (fleet, shutdown_tx, handle) = start_supervisor(
            vec![vec!["192.0.2.10_443".into()]],
            Duration::from_secs(3600),
            store,
        );

        // Several ticks pass; the fleet must not grow or churn.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (active, _) = fleet.snapshot();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].destination(), "192.0.2.10");
        assert_eq!(active[0].cnames(), ["svc.example.nl".to_string()]);
        assert!(active[0].dports().contains("443"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn vanished_destination_is_stopped() {
        let (fleet, shutdown_tx, handle) = start_supervisor(
            vec![vec!["192.0.2.20_443".into()], vec![]],
            Duration::from_millis(150),
            ReverseNameStore::new(),
        );

        // Wait for the tracer to appear, keep a handle to it.
        let mut tracer = None;
        for _ in 0..100 {
            let (active, _) = fleet.snapshot();
            if let Some(t) = active.first() {
                tracer = Some(Arc::clone(t));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let tracer = tracer.expect("tracer created for mocked destination");

        // The mock cycles to an empty list; the tracer must be stopped
        // and its history closed with the sentinel.
        let mut closed = false;
        for _ in 0..300 {
            let history = tracer.history();
            if let Some(last) = history.last() {
                if last.change && last.hops.is_empty() && last.duration == 0.0 {
                    closed = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed, "removed tracer history ends with a sentinel trace");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
