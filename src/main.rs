use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use schema_change_notifier::cli::Cli;
use schema_change_notifier::health::{self, HealthState};
use schema_change_notifier::service::SchemaChangeNotifier;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match cli.build_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let notifier = match SchemaChangeNotifier::new(config.clone()) {
        Ok(notifier) => notifier,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    info!("Configuration loaded: {config:?}");

    if config.health_port > 0 {
        let state = HealthState::new(notifier.running_flag(), notifier.counters());
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = health::serve(health::router(state), port).await {
                warn!("Failed to start health server on port {port}: {e}");
            }
        });
    }

    let running = notifier.running_flag();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        running.store(false, Ordering::SeqCst);
    });

    match notifier.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = tokio::signal::ctrl_c() => {},
    }
}
