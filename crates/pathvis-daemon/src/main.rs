//! pathvis daemon
//!
//! Watches which remote hosts this machine is actively talking to, runs
//! a periodic traceroute to each of them, enriches every hop with
//! registry and routing metadata, and streams path updates to websocket
//! subscribers on `localhost:8765`.
//!
//! - Destination snapshots come from the kernel socket table (netstat
//!   fallback), or from a scripted mock source in `--mock` mode
//! - One tracer task per destination, supervised every update interval
//! - Hop enrichment (rDNS, registry, DIS TXT, ROA) behind a TTL cache

mod dnsmasq;
mod enrich;
mod reverse_names;
mod rpki;
mod sampler;
mod supervisor;
mod tracer;
mod traceroute;
mod util;
mod ws_server;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hickory_resolver::config::{
    NameServerConfig, Protocol as DnsProtocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::enrich::{Enricher, RDAP_BASE_URL};
use crate::reverse_names::ReverseNameStore;
use crate::rpki::{RoaChecker, VRPS_FILENAME, VRPS_URL};
use crate::sampler::{DestinationSource, MockSource};
use crate::supervisor::{Supervisor, UPDATE_INTERVAL_SECS};
use crate::traceroute::Protocol;
use crate::ws_server::FleetState;

/// Scripted destinations served in `--mock` mode, cycling every 15 s.
const MOCK_HOSTS: [&[&str]; 3] = [
    &["8.8.8.8", "35.190.27.69", "2a04:b900::1:0:0:10", "185.55.136.59", "145.18.11.145"],
    &[],
    &["8.8.8.8"],
];
const MOCK_INTERVAL_SECS: u64 = 15;

/// pathvis daemon.
#[derive(Parser, Debug)]
#[command(name = "pathvis-daemon", about = "Traces paths to active remote hosts")]
struct Cli {
    /// Restrict sampling and tracing to IPv4.
    #[arg(short = '4', long = "ipv4_only")]
    ipv4_only: bool,

    /// Use scripted, cycling destinations instead of the socket table.
    #[arg(short = 'M', long)]
    mock: bool,

    /// Use our own Unbound instance for DNS (which serves some DIS TXT
    /// records).
    #[arg(short = 'R', long = "our_resolver")]
    our_resolver: bool,

    /// dnsmasq logfile containing replies to forward lookups.
    #[arg(short = 'Q', long = "query_log")]
    query_log: Option<PathBuf>,

    /// Use a specific protocol for every traceroute, e.g. icmp.
    #[arg(short = 't', long)]
    traceproto: Option<Protocol>,

    /// Push channel listen address.
    #[arg(long, default_value = "localhost:8765")]
    listen: String,

    /// On-disk cache for the VRPs dataset.
    #[arg(long, default_value = VRPS_FILENAME)]
    vrps_file: PathBuf,

    /// Where to download the VRPs dataset from.
    #[arg(long, default_value = VRPS_URL)]
    vrps_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    // A usable resolver is a hard startup requirement.
    let resolver = build_resolver(cli.our_resolver)?;
    resolver
        .lookup_ip("example.nl.")
        .await
        .context("no usable dns resolver")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building http client")?;

    // Fatal when there is no dataset at all; a failing refresh serves
    // the stale file instead.
    let roa = RoaChecker::load(&cli.vrps_file, &cli.vrps_url, &http)
        .await
        .context("loading VRPs dataset")?;
    tracing::info!(target: "path_traceroute.rpki", vrps = roa.len(), "VRPs dataset ready");

    let reverse_names = ReverseNameStore::new();
    if let Some(query_log) = &cli.query_log {
        tracing::warn!(
            target: "path_traceroute",
            logfile = %query_log.display(),
            "tailing dnsmasq log for dns queries"
        );
        dnsmasq::spawn_reader(query_log.clone(), reverse_names.clone());
    }

    let source = if cli.mock {
        tracing::warn!(target: "path_traceroute", "using mocked hosts");
        let lists = MOCK_HOSTS
            .iter()
            .map(|list| list.iter().map(|s| s.to_string()).collect())
            .collect();
        Arc::new(DestinationSource::Mock(Mutex::new(MockSource::new(
            lists,
            Duration::from_secs(MOCK_INTERVAL_SECS),
        ))))
    } else {
        Arc::new(DestinationSource::Native)
    };

    let enricher = Arc::new(Enricher::new(
        resolver,
        http,
        roa,
        RDAP_BASE_URL.to_string(),
    ));
    let fleet = Arc::new(FleetState::new());

    tracing::info!(
        target: "path_traceroute",
        ipv4_only = cli.ipv4_only,
        mock = cli.mock,
        traceproto = ?cli.traceproto,
        "pathvis starting"
    );

    // ── Task 1: supervisor loop ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = Supervisor {
        source,
        fleet: Arc::clone(&fleet),
        reverse_names,
        update_interval: Duration::from_secs(UPDATE_INTERVAL_SECS),
        ipv4_only: cli.ipv4_only,
        proto: cli.traceproto,
        shutdown: shutdown_rx,
    };
    let mut supervisor_handle = tokio::spawn(supervisor.run());

    // ── Task 2: websocket publisher ─────────────────────────────
    let listen = cli.listen.clone();
    let server_fleet = Arc::clone(&fleet);
    let server_enricher = Arc::clone(&enricher);
    let mut server_handle =
        tokio::spawn(async move { ws_server::run(&listen, server_fleet, server_enricher).await });

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "path_traceroute", "received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            match (&mut supervisor_handle).await {
                Ok(Ok(())) => tracing::info!(target: "path_traceroute", "main loop stopped"),
                Ok(Err(e)) => tracing::error!(target: "path_traceroute", error = %e, "main loop failed during shutdown"),
                Err(e) => tracing::error!(target: "path_traceroute", error = %e, "main loop task panicked"),
            }
            server_handle.abort();
        }
        result = &mut supervisor_handle => {
            result.context("supervisor task died")??;
        }
        result = &mut server_handle => {
            result.context("websocket server task died")??;
        }
    }

    tracing::info!(target: "path_traceroute", "pathvis stopped");
    Ok(())
}

/// Env-filter logging; a `logging.config` file in the working directory
/// overrides the filter directives.
fn init_logging() {
    let filter = match std::fs::read_to_string("logging.config") {
        Ok(directives) => EnvFilter::new(directives.trim()),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_resolver(our_resolver: bool) -> anyhow::Result<TokioAsyncResolver> {
    if our_resolver {
        tracing::warn!(target: "path_traceroute", "using our own Unbound instance for DNS");
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53535),
            DnsProtocol::Udp,
        ));
        Ok(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
    } else {
        TokioAsyncResolver::tokio_from_system_conf().context("reading system resolver config")
    }
}
