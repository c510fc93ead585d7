//! # Client Session
//!
//! Drives a [`HealthMonitor`] against a live push stream: attaches, decodes
//! frames, runs the sweep and grace timers, and re-attaches when the stream
//! breaks or the monitor asks for it.
//!
//! - Stream error or end: wait `reconnect_delay`, then re-attach. Cancelling
//!   during the wait stops the session.
//! - Monitor reconnect: re-attach immediately.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::health::{HealthAction, HealthConfig, HealthMonitor};
use crate::client::sse::SseDecoder;

enum StreamOutcome {
    Cancelled,
    Stale,
    Failed(String),
}

/// A reconnecting subscriber to one push-stream URL.
pub struct ClientSession {
    url: String,
    http: reqwest::Client,
    monitor: HealthMonitor,
    decoder: SseDecoder,
    cancel: CancellationToken,
    attaches: u64,
}

impl ClientSession {
    /// Builds a session for `url`.
    ///
    /// # Errors
    /// Fails on an invalid error pattern in `config` or if the HTTP client
    /// cannot be built.
    pub fn new(url: impl Into<String>, config: HealthConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            http,
            monitor: HealthMonitor::new(config)?,
            decoder: SseDecoder::new(),
            cancel: CancellationToken::new(),
            attaches: 0,
        })
    }

    /// Token that stops [`ClientSession::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The monitor, for inspection after `run` returns.
    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Number of successful attaches so far.
    pub fn attaches(&self) -> u64 {
        self.attaches
    }

    /// Runs until cancelled.
    pub async fn run(&mut self) {
        loop {
            match self.stream_once().await {
                StreamOutcome::Cancelled => break,
                StreamOutcome::Stale => log::info!("Re-attaching to {}", self.url),
                StreamOutcome::Failed(reason) => {
                    let delay = self.monitor.config().reconnect_delay;
                    log::warn!("Push stream failed: {}. Reconnecting in {:?}", reason, delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        log::info!("Client session for {} stopped", self.url);
    }

    async fn stream_once(&mut self) -> StreamOutcome {
        let request = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
            response = request => response,
        };
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => return StreamOutcome::Failed(format!("HTTP {}", r.status())),
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        };

        self.attaches += 1;
        let attached_at = Instant::now();
        self.monitor.on_attach(attached_at);
        self.decoder.reset();
        log::info!("Attached to {} (attach #{})", self.url, self.attaches);

        let config = self.monitor.config().clone();
        let mut body = response.bytes_stream();
        let mut sweep = interval_at(attached_at + config.sweep_interval, config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let grace = sleep(config.grace_period);
        tokio::pin!(grace);
        let mut grace_checked = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let now = Instant::now();
                        for frame in self.decoder.push(&bytes) {
                            self.monitor.on_frame(&frame, now);
                        }
                    }
                    Some(Err(e)) => return StreamOutcome::Failed(e.to_string()),
                    None => return StreamOutcome::Failed("stream ended".to_string()),
                },
                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.log_reports(now);
                    if let Some(HealthAction::Reconnect) = self.monitor.sweep(now) {
                        return StreamOutcome::Stale;
                    }
                }
                _ = &mut grace, if !grace_checked => {
                    grace_checked = true;
                    if self.monitor.check_grace(Instant::now()) {
                        log::warn!("No stations reported within {:?}", config.grace_period);
                    }
                }
            }
        }
    }

    fn log_reports(&self, now: Instant) {
        if let Some(error) = self.monitor.error_message() {
            log::error!("{}", error);
        }
        for report in self.monitor.reports(now) {
            let age = report
                .seconds_since_update
                .map_or_else(|| "never".to_string(), |s| format!("{}s ago", s));
            log::info!(
                "{} [{}] {:?}, updated {}, temp {:?}°C, humidity {:?}%, pressure {:?} mb ({:?})",
                report.label,
                report.device_id,
                report.status,
                age,
                report.weather.temperature_c,
                report.weather.humidity_pct,
                report.weather.pressure_mb,
                report.weather.barometric_trend,
            );
        }
    }
}
