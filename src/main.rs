use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::info;

use daemonkit::cm::ConfigManager;
use daemonkit::evm::Context as EventContext;
use daemonkit::store::Store;
use daemonkit::trace::{TraceConfig, TraceContext, TraceEvent};

#[derive(Parser, Debug)]
#[command(name = "daemonkitd")]
#[command(about = "Event dispatch, trie store, and traceroute primitives daemon")]
struct Args {
    /// Path to a `[section]`-style config file read into the "daemon" set.
    #[arg(long, value_name = "PATH", env = "DAEMONKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Event manager worker thread count (0 is normalized to 1).
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Run a traceroute against this host and print hops as they arrive.
    #[arg(long, value_name = "HOST")]
    trace: Option<String>,

    /// Max hop distance for --trace (0 uses the configured default).
    #[arg(long, default_value_t = 0)]
    max_distance: u8,
}

fn load_config(args: &Args) -> anyhow::Result<TraceConfig> {
    let manager = ConfigManager::singleton();
    let set = manager.default_set(
        "daemon",
        &[
            ("trace", "hops limit", "10"),
            ("trace", "request timeout", "1000"),
        ],
    );
    if let Some(path) = &args.config {
        set.load_file(path, '=')
            .with_context(|| format!("loading config file {}", path.display()))?;
    }
    Ok(TraceConfig::from_config_set(&set))
}

fn run_trace(cfg: TraceConfig, host: &str, max_distance: u8) -> anyhow::Result<()> {
    let ctx = TraceContext::init(cfg).context("starting trace engine")?;
    let (tx, rx) = mpsc::channel();
    let host_owned = host.to_string();
    ctx.start(
        host,
        max_distance,
        Arc::new(move |event, _user| match event {
            TraceEvent::Hop { distance, addr } => {
                println!("{distance:>3}  {addr}");
            }
            TraceEvent::Done => {
                let _ = tx.send(());
            }
        }),
        Arc::new(()),
    );

    rx.recv_timeout(Duration::from_secs(30))
        .with_context(|| format!("trace to {host_owned} did not complete in time"))?;
    ctx.release();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let trace_cfg = load_config(&args)?;

    let evm = EventContext::initialize(args.workers, Duration::from_secs(60));
    let store = Store::init(4, 8, Duration::from_secs(300));
    info!("daemonkitd started with {} workers", args.workers.max(1));

    if let Some(host) = &args.trace {
        run_trace(trace_cfg, host, args.max_distance)?;
    }

    store.terminate();
    evm.shutdown();
    Ok(())
}
