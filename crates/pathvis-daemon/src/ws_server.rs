//! Websocket publisher — streams enriched path updates to subscribers.
//!
//! Every subscriber connection gets its own handler task and its own
//! publication bookkeeping, so a slow or dying client never affects the
//! others. The first frame after connect is `clear_cache`; after that
//! the handler ticks once a second, publishing traces it has not sent
//! yet (`new=true`) and one closing frame per removed destination
//! (`new=false`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pathvis_common::models::Trace;
use pathvis_common::protocol::{TraceFrame, CLEAR_CACHE};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::enrich::Enricher;
use crate::tracer::Tracer;

const WS_PUBLISH_INTERVAL_SECS: u64 = 1;

// ── Fleet handoff ───────────────────────────────────────────────────

#[derive(Default)]
struct Fleet {
    active: Vec<Arc<Tracer>>,
    removed: Vec<Arc<Tracer>>,
}

/// The supervisor posts its tracer fleet here each tick; subscriber
/// handlers read it. Removed tracers are replaced wholesale, so a
/// closing frame is observable for one update interval.
#[derive(Default)]
pub struct FleetState {
    inner: Mutex<Fleet>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, active: Vec<Arc<Tracer>>, removed: Vec<Arc<Tracer>>) {
        let mut fleet = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        fleet.active = active;
        fleet.removed = removed;
    }

    pub fn snapshot(&self) -> (Vec<Arc<Tracer>>, Vec<Arc<Tracer>>) {
        let fleet = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (fleet.active.clone(), fleet.removed.clone())
    }
}

// ── Per-subscriber bookkeeping ──────────────────────────────────────

/// Identity of one published trace.
#[derive(Debug, Clone, PartialEq)]
struct TraceKey {
    start: f64,
    destination: String,
}

/// Which traces this subscriber has already received, per destination.
#[derive(Default)]
pub struct PublicationState {
    processed: HashMap<String, Vec<TraceKey>>,
}

impl PublicationState {
    /// One dedupe pass: unsent traces from the active histories first
    /// (fleet order, chronological within a tracer), then one closing
    /// frame per removed destination this subscriber knows about.
    pub fn drain(
        &mut self,
        histories: &[Vec<Trace>],
        removed: &[(String, Option<Trace>)],
    ) -> Vec<(Trace, bool)> {
        let mut out = Vec::new();
        for history in histories {
            for trace in history {
                let key = TraceKey {
                    start: trace.start,
                    destination: trace.destination.clone(),
                };
                let sent = self.processed.entry(trace.destination.clone()).or_default();
                if sent.contains(&key) {
                    continue;
                }
                sent.push(key);
                out.push((trace.clone(), true));
            }
        }
        for (destination, last) in removed {
            if self.processed.remove(destination).is_some() {
                if let Some(trace) = last {
                    out.push((trace.clone(), false));
                }
            }
        }
        out
    }

    pub fn destinations(&self) -> usize {
        self.processed.len()
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Accept loop for the push channel.
pub async fn run(
    listen: &str,
    fleet: Arc<FleetState>,
    enricher: Arc<Enricher>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    tracing::info!(target: "path_traceroute.websocket_server", listen, "websocket server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let fleet = Arc::clone(&fleet);
        let enricher = Arc::clone(&enricher);
        tokio::spawn(async move {
            handle_subscriber(fleet, enricher, stream, peer).await;
        });
    }
}

async fn handle_subscriber(
    fleet: Arc<FleetState>,
    enricher: Arc<Enricher>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(target: "path_traceroute.websocket_server", %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    tracing::debug!(target: "path_traceroute.websocket_server", %peer, "subscriber connected, sending clear_cache");
    if ws_tx
        .send(Message::Text(CLEAR_CACHE.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut state = PublicationState::default();
    let mut tick = tokio::time::interval(Duration::from_secs(WS_PUBLISH_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let (active, removed) = fleet.snapshot();
                let histories: Vec<Vec<Trace>> = active.iter().map(|t| t.history()).collect();
                let closings: Vec<(String, Option<Trace>)> = removed
                    .iter()
                    .map(|t| (t.destination().to_string(), t.history().last().cloned()))
                    .collect();
                for (trace, new) in state.drain(&histories, &closings) {
                    tracing::info!(
                        target: "path_traceroute.websocket_server",
                        destination = %trace.destination,
                        started = trace.start,
                        new,
                        "publish trace"
                    );
                    let frame = enrich_frame(&enricher, &trace, new).await;
                    let json = match frame.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(target: "path_traceroute.websocket_server", error = %e, "frame serialization failed");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        tracing::debug!(target: "path_traceroute.websocket_server", %peer, "send failed, dropping subscriber");
                        return;
                    }
                }
                tracing::debug!(
                    target: "path_traceroute.websocket_server",
                    destinations = state.destinations(),
                    "publish tick done"
                );
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // Ping/Pong handled by tungstenite
                }
            }
        }
    }

    tracing::debug!(target: "path_traceroute.websocket_server", %peer, "subscriber disconnected");
}

/// Look up every hop concurrently and assemble the wire frame.
async fn enrich_frame(enricher: &Enricher, trace: &Trace, new: bool) -> TraceFrame {
    let enriched =
        futures::future::join_all(trace.hops.iter().map(|hop| enricher.hop_info(hop))).await;
    TraceFrame::assemble(trace, enriched, new)
}
