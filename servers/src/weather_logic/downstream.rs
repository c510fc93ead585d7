use crate::weather_logic::config::Settings;
use axum::{
    extract::State,
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::StreamExt;
use lib_common::core::{Attachment, ConnectionManager};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/api/stations", get(stations_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(
    settings: Settings,
    manager: Arc<ConnectionManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(AppState { manager });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some((cert_path, key_path)) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load TLS configuration from {}: {}", cert_path.display(), e))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        log::info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        log::info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

async fn events_handler(State(state): State<AppState>) -> impl IntoResponse {
    let attachment = Attachment::attach(&state.manager);
    log::info!("Subscriber {} connected", attachment.id());

    let stream = attachment
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(Event::default().event(frame.event).data(frame.data)));
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("keep-alive"));

    ([(header::CONNECTION, "keep-alive")], sse)
}

async fn stations_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.snapshot())
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::core::UpstreamConfig;
    use lib_common::weather::model::{ConnectionStatus, StatusEvent};

    async fn serve(manager: Arc<ConnectionManager>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(AppState { manager })).await;
        });
        format!("http://{}", addr)
    }

    fn idle_manager() -> Arc<ConnectionManager> {
        ConnectionManager::new(UpstreamConfig {
            ws_url: "ws://127.0.0.1:9/".into(),
            rest_url: "http://127.0.0.1:9/".into(),
            ..UpstreamConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn health_and_station_snapshot() {
        let manager = idle_manager();
        manager.report_configuration_error("WEATHER_TOKENS environment variable not configured");
        let base = serve(manager).await;

        let health = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let stations: Vec<StatusEvent> = reqwest::get(format!("{}/api/stations", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn events_stream_replays_the_snapshot_first() {
        let manager = idle_manager();
        manager.report_configuration_error("WEATHER_TOKENS environment variable not configured");
        let base = serve(Arc::clone(&manager)).await;

        let response = reqwest::get(format!("{}/events", base)).await.unwrap();
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[reqwest::header::CACHE_CONTROL], "no-cache");

        let mut body = response.bytes_stream();
        let mut text = String::new();
        while !text.contains("\n\n") {
            let chunk = body.next().await.unwrap().unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        assert!(text.contains("event: status"));
        assert!(text.contains("not configured"));
        assert_eq!(manager.bus().listener_count(), 3);
    }
}
