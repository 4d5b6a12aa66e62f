use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use port_drop_common::{MAP_DROP_COUNTER, MAP_PORT_CONFIG, XDP_PROGRAM};

mod attach;
mod collection;
mod control;
mod ebpf_loader;
mod error;
mod iface;
mod shutdown;
mod table;
#[cfg(test)]
mod testing;

use attach::{AttachmentManager, XdpMode};
use control::{ControlLoop, ControlOptions, LogReporter, RandomIncrement, Session, StatsPolicy};
use error::ControlError;
use shutdown::ShutdownSignal;

#[derive(Debug, Parser)]
#[command(name = "port-drop")]
#[command(about = "Drop TCP traffic to a port with an XDP program", long_about = None)]
struct Cli {
    /// TCP destination port to drop; the config map is left untouched when omitted
    #[arg(value_name = "PORT")]
    port: Option<u16>,
    /// Network interface to attach the XDP program to
    #[arg(short, long, env = "PORT_DROP_IFACE", default_value = control::DEFAULT_IFACE)]
    iface: String,
    /// Compiled eBPF object holding the program and its maps
    #[arg(long, env = "PORT_DROP_OBJECT", value_name = "PATH", default_value = control::DEFAULT_OBJECT)]
    object: PathBuf,
    /// XDP program to attach
    #[arg(long, default_value = XDP_PROGRAM)]
    program: String,
    /// Array map holding the port to drop
    #[arg(long, value_name = "MAP", default_value = MAP_PORT_CONFIG)]
    config_map: String,
    /// Array map holding the drop counter
    #[arg(long, value_name = "MAP", default_value = MAP_DROP_COUNTER)]
    stats_map: String,
    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,
    /// Seconds between statistics reports
    #[arg(long, value_name = "SECS", default_value_t = control::DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,
    /// What to do with the drop counter on every report
    #[arg(long, value_enum, default_value_t = StatsPolicy::Simulate)]
    stats: StatsPolicy,
}

impl Cli {
    fn into_options(self) -> ControlOptions {
        ControlOptions {
            object: self.object,
            iface: self.iface,
            program: self.program,
            config_map: self.config_map,
            stats_map: self.stats_map,
            port: self.port,
            xdp_mode: self.xdp_mode,
            interval: Duration::from_secs(self.interval_secs.max(1)),
            stats: self.stats,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("port-drop error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let opts = Cli::parse().into_options();
    let shutdown = ShutdownSignal::install().context("failed to install signal handlers")?;

    let mut collection = ebpf_loader::load(&opts.object)?;
    if let Err(err) = aya_log::EbpfLogger::init(collection.ebpf_mut()) {
        debug!("eBPF logger not initialized: {err}");
    }

    let manager = AttachmentManager::default();
    let mut session = Session::start(collection, &manager, &opts)?;
    info!(
        "{} attached to {}. Press Ctrl+C to detach.",
        opts.program,
        session.attachment().iface()
    );

    let mut control = ControlLoop::new(
        opts.interval,
        opts.stats,
        LogReporter,
        RandomIncrement::new(),
    );
    let outcome = control.run(&mut session, shutdown.wait()).await;
    debug!("control loop {:?}", control.state());

    let closed = session.close();
    settle(outcome, closed)?;
    info!("detached, exiting");
    Ok(())
}

/// Merge the loop outcome with the teardown result. A loop failure wins, but
/// a failed detach alongside it is logged and kept in the error chain.
fn settle(outcome: Result<(), ControlError>, closed: Result<(), ControlError>) -> Result<()> {
    match (outcome, closed) {
        (Ok(()), closed) => Ok(closed?),
        (Err(err), Ok(())) => Err(err.into()),
        (Err(err), Err(detach)) => {
            warn!("{detach}");
            Err(anyhow::Error::new(err).context(format!("control loop stopped; {detach}")))
        }
    }
}
