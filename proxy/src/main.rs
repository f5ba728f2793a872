use auth_proxy::{AuthGate, KeyMaterial, Orchestrator, ProxyConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auth_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Key material is loaded once; every listener verifies against it.
    let key = match KeyMaterial::load(&config.key_path) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!("Failed to load JWT key: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Loaded JWT key from {} ({})",
        config.key_path.display(),
        key.kind()
    );

    let gate = AuthGate::from_config(&config, key);
    let running = match Orchestrator::new(&config, gate).start().await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!("Failed to start listeners: {e}");
            std::process::exit(1);
        }
    };

    wait_for_termination().await;

    let report = running.shutdown(config.shutdown_timeout).await;
    for failure in &report.failures {
        tracing::error!("Server shutdown error: {failure}");
    }
    tracing::info!("All servers stopped");
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
