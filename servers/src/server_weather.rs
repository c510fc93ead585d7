use anyhow::{Context, Result};
use lib_common::core::ConnectionManager;
use std::sync::Arc;
use tokio::signal;

mod weather_logic;
use weather_logic::{config, downstream, logger};

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config();
    logger::setup_logging("server_weather", &settings.log_dir, &settings.log_level)?;

    let manager = ConnectionManager::new(settings.upstream.clone()).context("Invalid upstream configuration")?;
    if settings.tokens.is_empty() {
        manager.report_configuration_error(config::MISSING_TOKENS_MESSAGE);
    } else {
        let added = manager.register_tokens(&settings.tokens);
        log::info!("Registered {} upstream token(s)", added);
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.clone(),
        Arc::clone(&manager),
        shutdown_tx.subscribe(),
    ));

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut downstream_handle => {
            // Bind or TLS failure; nothing to serve.
            manager.shutdown().await;
            result??;
            anyhow::bail!("Downstream server stopped unexpectedly");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    manager.shutdown().await;
    downstream_handle.await??;

    log::info!("Shutdown complete.");
    Ok(())
}
