//! vswitchd daemon entry point.
//!
//! Drives the bridge engine from a poll loop: a periodic tick calls
//! `run()`, SIGHUP reloads the configuration, and a unix-socket control
//! channel serves the administrative commands. The engine here runs over
//! the in-memory simulation collaborators; production deployments plug
//! kernel datapath / netdev / OpenFlow adapters into the same trait
//! seams.

mod appctl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use bridge_engine::config::NetworkConfig;
use bridge_engine::sim::Sim;
use bridge_engine::BridgeEngine;

/// Software-defined virtual Ethernet switch daemon.
#[derive(Debug, Parser)]
#[command(name = "vswitchd", version, about)]
struct Args {
    /// Path to the JSON network configuration.
    #[arg(long)]
    config: PathBuf,

    /// Path of the administrative control socket.
    #[arg(long, default_value = "/run/vswitchd.sock")]
    socket: PathBuf,

    /// Poll-loop tick ceiling in milliseconds.
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Stable host identity mixed into datapath IDs of internal bridges.
    #[arg(long)]
    host_uuid: Option<String>,
}

/// Monotonic milliseconds since daemon start.
#[derive(Clone)]
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    fn new() -> Self {
        Clock {
            start: Instant::now(),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

fn load_config(path: &PathBuf) -> anyhow::Result<NetworkConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let mut cfg = load_config(&args.config)?;

    let sim = Sim::new();
    let (dp, net, of) = sim.providers();
    let mut engine = BridgeEngine::new(dp, net, of);
    if let Some(uuid) = &args.host_uuid {
        engine = engine.with_host_uuid(uuid.clone());
    }

    let clock = Clock::new();
    engine.init(&cfg, clock.now_ms());
    info!(
        bridges = cfg.bridges.len(),
        interfaces = engine.get_interfaces().len(),
        "initial configuration applied"
    );

    let engine = Arc::new(Mutex::new(engine));
    tokio::spawn(appctl::serve(
        args.socket.clone(),
        engine.clone(),
        clock.clone(),
    ));

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(args.tick_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = clock.now_ms();
                let mut engine = engine.lock().expect("engine lock");
                if let Err(e) = engine.run(now) {
                    warn!(error = %e, "datapath trouble, reconfiguring");
                    engine.reconfigure(&cfg, now);
                }
                // With real adapters the OpenFlow switch drives this hook;
                // the simulated one leaves it to the poll loop.
                for name in engine.bridge_names() {
                    if let Some(br) = engine.bridge_mut(&name) {
                        br.on_checkpoint(now);
                    }
                }
            }
            _ = sighup.recv() => {
                match load_config(&args.config) {
                    Ok(new_cfg) => {
                        info!("reloading configuration");
                        cfg = new_cfg;
                        let now = clock.now_ms();
                        engine.lock().expect("engine lock").reconfigure(&cfg, now);
                    }
                    Err(e) => error!(error = %e, "configuration reload failed, keeping old"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    info!("--- starting vswitchd ---");

    let args = Args::parse();
    match run_daemon(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "vswitchd failed");
            ExitCode::FAILURE
        }
    }
}
