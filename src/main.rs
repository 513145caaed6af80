//! Resilience runtime daemon.
//!
//! Loads a policy file, serves the policy engine with hot reload and health
//! aggregation, and logs every policy event until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use resilience_runtime::config::loader::load_config;
use resilience_runtime::config::watcher::ConfigWatcher;
use resilience_runtime::lifecycle::signals::wait_for_shutdown_signal;
use resilience_runtime::observability::{logging, metrics};
use resilience_runtime::policy::codec;
use resilience_runtime::{PolicyEngine, Shutdown};

#[derive(Parser)]
#[command(name = "resilience-runtime")]
#[command(about = "Policy-driven fault tolerance for downstream calls", long_about = None)]
struct Args {
    /// Policy/configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/runtime.toml")]
    config: PathBuf,

    /// Validate the file, print every policy, and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    if args.validate {
        for policy in &config.policies {
            println!("{}", codec::to_pretty(policy)?);
        }
        println!("# {} valid policies in {}", config.policies.len(), args.config.display());
        return Ok(());
    }

    logging::init_logging(&config.observability);
    tracing::info!(config = %args.config.display(), "resilience-runtime v0.1.0 starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let engine = Arc::new(PolicyEngine::from_config(&config)?);
    tracing::info!(policies = config.policies.len(), "Policy engine ready");

    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    let mut events = engine.subscribe_events();
    let event_shutdown = shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => tracing::info!(
                        kind = %event.kind,
                        subject = %event.subject,
                        previous = ?event.previous,
                        current = ?event.current,
                        "Policy event"
                    ),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event logger lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = event_shutdown.cancelled() => break,
            }
        }
    }));

    let health = Arc::new(engine.health(config.health.clone()));
    tasks.push(tokio::spawn(health.run(shutdown.subscribe())));

    // The watcher stops when this handle is dropped.
    let _watcher = if config.reload.enabled {
        let (watcher, updates) = ConfigWatcher::new(&args.config, config.reload.clone());
        tasks.push(engine.spawn_reloader(updates, shutdown.subscribe()));
        Some(watcher.run()?)
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    shutdown.trigger();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
