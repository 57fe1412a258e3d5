//! Bridge daemon: accepts obfuscated client sessions and relays them to
//! exits, announcing itself to the directory once a minute.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use regex::Regex;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use veilwire::binder::BinderClient;
use veilwire::bridge::{self, BridgeConfig, SpeedLimiter};
use veilwire::relay::WorkerPool;
use veilwire::Cookie;

/// TCP port exits accept plain relayed sessions on.
const EXIT_RELAY_PORT: u16 = 2389;
/// UDP port exits accept tunnel datagrams on.
const EXIT_E2E_PORT: u16 = 2399;

#[derive(Debug, Parser)]
#[command(name = "veilwire-bridge", about = "obfuscated relay bridge daemon")]
struct Opts {
    /// Directory domain-fronting URL.
    #[arg(long = "binderFront", default_value = "https://binder.veilwire.net/v2")]
    binder_front: String,

    /// Real hostname of the directory.
    #[arg(long = "binderReal", default_value = "binder.veilwire.net")]
    binder_real: String,

    /// Domain pattern for acceptable exit nodes.
    #[arg(long = "exitRegex", default_value = r"\.exits\.veilwire\.net$")]
    exit_regex: String,

    /// StatsD collector address. Accepted for fleet compatibility; this
    /// build reports its counters through the log instead.
    #[arg(long = "statsdAddr", default_value = "")]
    statsd_addr: String,

    /// Directory API key used when announcing.
    #[arg(long = "binderKey", default_value = "")]
    binder_key: String,

    /// Allocation group tag shared by bridges on this infrastructure.
    #[arg(long = "allocGroup", required = true)]
    alloc_group: String,

    /// Listen address; ":" picks a random port on all interfaces.
    #[arg(long = "listenAddr", default_value = ":")]
    listen_addr: String,

    /// Address announced to the directory; defaults to the listen address.
    #[arg(long = "advertiseAddr")]
    advertise_addr: Option<String>,

    /// Refuse ephemeral tunnel-listener requests.
    #[arg(long = "noLegacyUDP")]
    no_legacy_udp: bool,

    /// Warpfront HTTP camouflage listen address (not supported).
    #[arg(long = "wfAddr", default_value = "")]
    wf_addr: String,

    /// Speed limit in KB/s; -1 disables.
    #[arg(long = "speedLimit", default_value_t = -1)]
    speed_limit: i64,
}

/// Translate the fleet's listen-address convention: an empty host means
/// all interfaces, an empty or missing port means a random one.
fn normalize_listen_addr(addr: &str) -> String {
    match addr {
        ":" | "" => "0.0.0.0:0".to_string(),
        a if a.starts_with(':') => format!("0.0.0.0{}", a),
        a => a.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let opts = Opts::parse();
    if opts.alloc_group.is_empty() {
        bail!("must specify an allocation group");
    }
    if !opts.wf_addr.is_empty() {
        bail!("warpfront mode is not supported by this bridge build");
    }
    if !opts.statsd_addr.is_empty() {
        info!("statsd export disabled; counters are logged instead");
    }
    let exit_regex =
        Regex::new(&opts.exit_regex).context("invalid --exitRegex pattern")?;

    // A fresh cookie per start: bridges have no long-term identity beyond
    // what the directory re-learns from the next announce.
    let cookie = Cookie::from_entropy();

    let listener = TcpListener::bind(normalize_listen_addr(&opts.listen_addr))
        .await
        .context("cannot bind listen address")?;
    let local_addr = listener.local_addr()?;

    let advertise = opts
        .advertise_addr
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    if opts.binder_key.is_empty() {
        warn!("no --binderKey given; not announcing to the directory");
    } else {
        let client = BinderClient::new(&opts.binder_front, &opts.binder_real);
        let key = opts.binder_key.clone();
        let alloc_group = opts.alloc_group.clone();
        let announce_cookie = cookie.clone();
        tokio::spawn(async move {
            loop {
                match client
                    .add_bridge(&key, &announce_cookie, &advertise, &alloc_group)
                    .await
                {
                    Ok(()) => info!(host = %advertise, "announced to directory"),
                    Err(e) => warn!(error = %e, "error adding bridge"),
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let pool = Arc::new(WorkerPool::new(workers));
    let limiter = Arc::new(SpeedLimiter::new(opts.speed_limit));
    let cfg = Arc::new(BridgeConfig {
        cookie,
        exit_regex,
        no_legacy_udp: opts.no_legacy_udp,
        exit_relay_port: EXIT_RELAY_PORT,
        exit_e2e_port: EXIT_E2E_PORT,
    });

    bridge::run(listener, cfg, pool, limiter)
        .await
        .context("relay listener failed")?;
    Ok(())
}
