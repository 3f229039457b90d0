use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tether_api::{Manager, ManagerConfig};
use tether_core::Backend;
use tether_store::MemoryStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod controller;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Tether controller runtime")]
struct Cli {
    /// YAML config file; TETHER_* variables override it
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Restrict caches to one namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the example deployment-meta controller
    Run {
        /// Use a seeded in-memory store instead of the cluster
        #[arg(long = "memory", action = ArgAction::SetTrue)]
        memory: bool,
        /// Log the trigger registry this often (seconds, 0 = never)
        #[arg(long = "debug-every", default_value_t = 0)]
        debug_every: u64,
    },
    /// Print the effective configuration
    Config {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut cfg = match &cli.config {
        Some(path) => ManagerConfig::from_file(path)?.with_env()?,
        None => ManagerConfig::from_env()?,
    };
    if let Some(ns) = &cli.namespace {
        cfg.namespace = Some(ns.clone());
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn backend(memory: bool) -> Result<Arc<dyn Backend>> {
    if !memory {
        let kube = tether_kubehub::KubeBackend::try_default().await.context("connecting to the cluster")?;
        return Ok(Arc::new(kube));
    }
    let store = MemoryStore::new();
    for obj in controller::demo_objects() {
        store.create(&obj).await.context("seeding in-memory store")?;
    }
    Ok(Arc::new(store))
}

async fn run(cfg: ManagerConfig, memory: bool, debug_every: u64) -> Result<()> {
    let manager = Arc::new(Manager::new(backend(memory).await?, cfg)?);
    controller::register(&manager)?;

    if debug_every > 0 {
        let m = manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(debug_every));
            loop {
                ticker.tick().await;
                let entries = m.debug_triggers();
                match serde_json::to_string(&entries) {
                    Ok(s) => info!(keys = entries.len(), triggers = %s, "trigger registry"),
                    Err(e) => warn!(error = %e, "encoding trigger registry"),
                }
            }
        });
    }

    // Single instance; leadership is held for the life of the process.
    let (_leader_tx, leader_rx) = watch::channel(true);
    let mut runner = {
        let m = manager.clone();
        tokio::spawn(async move { m.run(leader_rx).await })
    };
    tokio::select! {
        r = signal::ctrl_c() => {
            if let Err(e) = r {
                error!(error = %e, "waiting for ctrl-c");
            }
            info!("interrupt received; shutting down");
            manager.shutdown().await;
            runner.await.context("manager task")??;
        }
        r = &mut runner => r.context("manager task")??,
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command {
        Commands::Run { memory, debug_every } => {
            info!(memory, ns = ?cfg.namespace, workers = cfg.workers, threadiness = cfg.threadiness, "starting");
            run(cfg, memory, debug_every).await?;
        }
        Commands::Config { output } => match output {
            Output::Yaml => print!("{}", serde_yaml::to_string(&cfg)?),
            Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
        },
    }
    Ok(())
}
