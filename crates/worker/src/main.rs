use std::sync::Arc;

use roomscribe_config::WorkerConfig;
use roomscribe_conference::SignalingBackend;
use roomscribe_store::PgStore;
use roomscribe_worker::WorkerManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match WorkerConfig::from_env(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(config).await {
        Ok(()) => {
            info!("Graceful shutdown complete");
        }
        Err(e) => {
            error!(error = %e, "Fatal worker error");
            std::process::exit(1);
        }
    }
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let store = Arc::new(PgStore::connect(&config.store_url).await?);
    let shutdown = CancellationToken::new();

    spawn_signal_handler(shutdown.clone());

    if let Some(port) = config.health_port {
        tokio::spawn(roomscribe_worker::health::serve(
            port,
            config.worker_id,
            config.mode,
            shutdown.clone(),
        ));
    }

    let mut manager = WorkerManager::new(
        config,
        store,
        Arc::new(SignalingBackend),
        shutdown.clone(),
    );
    manager.run().await
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "Cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl-C received, shutting down");
        }

        shutdown.cancel();
    });
}
