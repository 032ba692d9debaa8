use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skimmer::broker::RestBroker;
use skimmer::{AppConfig, Engine};

#[derive(Parser)]
#[command(name = "skimmer", about = "Order lifecycle engine", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "SKIMMER_CONFIG_DIR")]
    config_dir: String,

    /// Force dry-run mode regardless of configuration
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine: scan, manage, and reconcile until interrupted
    Run,
    /// Evaluate the entry gates once and print the signals
    Scan,
    /// Run a single reconciliation pass and print the report
    Reconcile,
    /// Print a status snapshot (positions, intents, quotes, pnl)
    Status,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("skimmer={level}")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match AppConfig::load_from(&cli.config_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&cfg.logging.level, cfg.logging.json);

    if let Err(errors) = cfg.validate() {
        for err in &errors {
            error!("config: {err}");
        }
        std::process::exit(1);
    }

    let dry_run = cli.dry_run || cfg.dry_run.enabled;
    if dry_run {
        info!("dry-run mode: no orders will reach the broker");
    }

    let broker = match RestBroker::new(&cfg.broker, dry_run) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!("failed to build broker client: {e}");
            std::process::exit(1);
        }
    };

    let engine = match Engine::new(cfg, broker.clone(), broker) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to build engine: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match cli.command {
        Command::Run => run(engine).await,
        Command::Scan => scan(engine).await,
        Command::Reconcile => reconcile(engine).await,
        Command::Status => status(engine).await,
    };
    std::process::exit(exit_code);
}

async fn run(engine: Arc<Engine>) -> i32 {
    engine.refresh_assets().await;

    // Heal orphans before the first scan can place anything.
    if let Err(e) = engine.reconcile_once().await {
        warn!("initial reconciliation failed, continuing: {e}");
    }

    let handles = engine.start();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => error!("failed to listen for shutdown signal: {e}"),
    }
    engine.shutdown();
    for handle in handles {
        handle.abort();
    }
    0
}

async fn scan(engine: Arc<Engine>) -> i32 {
    engine.refresh_assets().await;
    for symbol in engine.watchlist() {
        let sig = engine.evaluate_symbol(&symbol).await;
        match serde_json::to_string_pretty(&sig) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(symbol = %symbol, "failed to render signal: {e}"),
        }
    }
    0
}

async fn reconcile(engine: Arc<Engine>) -> i32 {
    match engine.reconcile_once().await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("failed to render report: {e}"),
            }
            0
        }
        Err(e) => {
            error!("reconciliation failed: {e}");
            1
        }
    }
}

async fn status(engine: Arc<Engine>) -> i32 {
    // Populate tracked state from the broker before reporting.
    if let Err(e) = engine.reconcile_once().await {
        warn!("reconciliation failed, reporting local state only: {e}");
    }
    match serde_json::to_string_pretty(&engine.status()) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            error!("failed to render status: {e}");
            1
        }
    }
}
