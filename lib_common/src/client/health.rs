//! # Client Health Monitor
//!
//! One per subscriber session. Watches data freshness from the subscriber's
//! side of the push stream and decides when that session should tear down and
//! re-attach its own stream. It never touches the upstream socket; the server
//! keeps its own transport watchdog and the two overlap on purpose, since the
//! upstream can go silent while every socket still looks healthy.
//!
//! The monitor is a plain state machine driven with explicit `now` instants,
//! so the timing rules can be tested without a runtime. `ClientSession` owns
//! the timers.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::client::sse::SseFrame;
use crate::weather::model::{
    ConnectionStatus, DeviceId, Observation, StatusEvent, WeatherEvent, FRAME_DATA, FRAME_EVENT, FRAME_STATUS,
};

/// Error texts that point at configuration rather than a transient fault.
pub const DEFAULT_CONFIG_ERROR_PATTERN: &str =
    "environment variable|not configured|Missing|Failed to create WebSocket connection";

/// Hint shown when nothing appears within the grace period.
pub const NO_STATIONS_MESSAGE: &str = "no stations configured";

/// Timings and limits for one monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often the staleness sweep runs.
    pub sweep_interval: Duration,
    /// Age after which a station's last update counts as stale.
    pub stale_after: Duration,
    /// How long after attach an empty station list is tolerated.
    pub grace_period: Duration,
    /// Delay before re-attaching after a stream error.
    pub reconnect_delay: Duration,
    /// Number of recent weather events kept.
    pub event_buffer: usize,
    /// Regex matched against error texts to decide whether to surface them.
    pub config_error_pattern: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            grace_period: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(5),
            event_buffer: 50,
            config_error_pattern: DEFAULT_CONFIG_ERROR_PATTERN.to_string(),
        }
    }
}

/// What the session should do after a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Drop the current stream and attach a fresh one.
    Reconnect,
}

/// The monitor's running picture of one station.
#[derive(Debug, Clone)]
pub struct StationView {
    /// Every field ever reported, newest value per field.
    pub weather: Observation,
    /// Last status seen, forced to connected by incoming data.
    pub connection_status: ConnectionStatus,
    /// Label from the most recent status that carried one.
    pub label: Option<String>,
    /// Last time anything updated the weather map.
    pub last_update: Option<Instant>,
    /// Last time a `weather-data` frame arrived.
    pub last_data_received: Option<Instant>,
}

impl StationView {
    fn new() -> Self {
        Self {
            weather: Observation::default(),
            connection_status: ConnectionStatus::Disconnected,
            label: None,
            last_update: None,
            last_data_received: None,
        }
    }

    fn is_unhealthy(&self, now: Instant, stale_after: Duration) -> bool {
        let stale = match self.last_update {
            None => true,
            Some(at) => now.saturating_duration_since(at) > stale_after,
        };
        stale
            || self.connection_status == ConnectionStatus::Disconnected
            || self.weather.timestamp_epoch_seconds.is_none()
    }
}

/// One line of the per-station summary.
#[derive(Debug, Clone, PartialEq)]
pub struct StationReport {
    /// Device the line describes.
    pub device_id: DeviceId,
    /// Display label.
    pub label: String,
    /// Current status.
    pub status: ConnectionStatus,
    /// Whole seconds since the last update, `None` if never updated.
    pub seconds_since_update: Option<u64>,
    /// Merged weather fields.
    pub weather: Observation,
}

/// # Health Monitor
///
/// Feed it frames with [`HealthMonitor::on_frame`], call
/// [`HealthMonitor::sweep`] on the sweep interval and
/// [`HealthMonitor::check_grace`] once the grace period after attach elapses.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    config_error: Regex,
    stations: BTreeMap<DeviceId, StationView>,
    // label -> message, one line per label.
    error_board: BTreeMap<String, String>,
    no_stations: bool,
    attached_at: Option<Instant>,
    reconnecting: bool,
    events: VecDeque<WeatherEvent>,
}

fn display_label(device_id: Option<DeviceId>, label: Option<&str>) -> String {
    match (label, device_id) {
        (Some(label), _) => label.to_string(),
        (None, Some(id)) => format!("Device {}", id),
        (None, None) => "Upstream".to_string(),
    }
}

impl HealthMonitor {
    /// Builds a monitor.
    ///
    /// # Errors
    /// Fails if `config.config_error_pattern` is not a valid regex.
    pub fn new(config: HealthConfig) -> Result<Self, regex::Error> {
        let config_error = Regex::new(&config.config_error_pattern)?;
        Ok(Self {
            config,
            config_error,
            stations: BTreeMap::new(),
            error_board: BTreeMap::new(),
            no_stations: false,
            attached_at: None,
            reconnecting: false,
            events: VecDeque::new(),
        })
    }

    /// Monitor settings.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// A new stream has been attached. Re-arms the reconnect trigger and the
    /// grace period.
    pub fn on_attach(&mut self, now: Instant) {
        self.attached_at = Some(now);
        self.reconnecting = false;
    }

    /// Dispatches a decoded push-stream frame. Unknown or malformed frames are
    /// logged and ignored.
    pub fn on_frame(&mut self, frame: &SseFrame, now: Instant) {
        let outcome = match frame.event.as_str() {
            FRAME_STATUS => serde_json::from_str(&frame.data).map(|s| self.on_status(&s)),
            FRAME_DATA => serde_json::from_str(&frame.data).map(|o| self.on_data(&o, now)),
            FRAME_EVENT => serde_json::from_str(&frame.data).map(|e| self.on_event(e)),
            other => {
                log::debug!("Ignoring push frame '{}'", other);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            log::warn!("Malformed '{}' frame: {}", frame.event, e);
        }
    }

    /// Applies a status transition.
    pub fn on_status(&mut self, status: &StatusEvent) {
        let key = display_label(status.device_id, status.label.as_deref());

        if let Some(device_id) = status.device_id {
            let view = self.stations.entry(device_id).or_insert_with(StationView::new);
            view.connection_status = status.status;
            if status.label.is_some() {
                view.label = status.label.clone();
            }
            self.no_stations = false;
        }

        match status.status {
            ConnectionStatus::Connected => {
                self.error_board.remove(&key);
            }
            ConnectionStatus::Error => {
                let message = status.error.as_deref().unwrap_or("unknown error");
                if self.config_error.is_match(message) {
                    log::error!("{}: {}", key, message);
                    self.error_board.insert(key, message.to_string());
                } else {
                    log::warn!("Transient error from {}: {}", key, message);
                }
            }
            ConnectionStatus::Disconnected => {
                log::debug!("{} disconnected", key);
            }
        }
    }

    /// Merges a reading into the station's map.
    pub fn on_data(&mut self, observation: &Observation, now: Instant) {
        let Some(device_id) = observation.device_id else {
            log::debug!("Ignoring observation without a device id");
            return;
        };
        let view = self.stations.entry(device_id).or_insert_with(StationView::new);
        view.weather.merge_from(observation);
        view.last_update = Some(now);
        view.last_data_received = Some(now);
        view.connection_status = ConnectionStatus::Connected;
        let key = display_label(Some(device_id), view.label.as_deref());
        self.error_board.remove(&key);
        self.no_stations = false;
    }

    /// Remembers an event, evicting the oldest beyond the buffer size.
    pub fn on_event(&mut self, event: WeatherEvent) {
        log::info!("{:?} from device {}: {}", event.kind, event.device_id, event.payload);
        self.events.push_back(event);
        while self.events.len() > self.config.event_buffer {
            self.events.pop_front();
        }
    }

    /// Staleness sweep. Returns `Reconnect` at most once per attachment, and
    /// never while an error is on display.
    pub fn sweep(&mut self, now: Instant) -> Option<HealthAction> {
        if self.reconnecting || self.error_message().is_some() {
            return None;
        }
        let unhealthy: Vec<DeviceId> = self
            .stations
            .iter()
            .filter(|(_, view)| view.is_unhealthy(now, self.config.stale_after))
            .map(|(id, _)| *id)
            .collect();
        if unhealthy.is_empty() {
            return None;
        }
        log::warn!("Unhealthy stations {:?}; reconnecting stream", unhealthy);
        self.reconnecting = true;
        Some(HealthAction::Reconnect)
    }

    /// Surfaces the no-stations hint if the grace period has elapsed with an
    /// empty station list. Returns whether the hint was raised by this call.
    pub fn check_grace(&mut self, now: Instant) -> bool {
        let Some(attached_at) = self.attached_at else {
            return false;
        };
        if self.no_stations
            || !self.stations.is_empty()
            || self.error_message().is_some()
            || now.saturating_duration_since(attached_at) < self.config.grace_period
        {
            return false;
        }
        self.no_stations = true;
        true
    }

    /// The user-visible error: every configuration-class error, one line per
    /// label, or the no-stations hint.
    pub fn error_message(&self) -> Option<String> {
        if !self.error_board.is_empty() {
            let lines: Vec<String> = self
                .error_board
                .iter()
                .map(|(label, message)| format!("{}: {}", label, message))
                .collect();
            return Some(lines.join("\n"));
        }
        self.no_stations.then(|| NO_STATIONS_MESSAGE.to_string())
    }

    /// Station views keyed by device.
    pub fn stations(&self) -> &BTreeMap<DeviceId, StationView> {
        &self.stations
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &WeatherEvent> {
        self.events.iter()
    }

    /// Summary of every station.
    pub fn reports(&self, now: Instant) -> Vec<StationReport> {
        self.stations
            .iter()
            .map(|(id, view)| StationReport {
                device_id: *id,
                label: display_label(Some(*id), view.label.as_deref()),
                status: view.connection_status,
                seconds_since_update: view
                    .last_update
                    .map(|at| now.saturating_duration_since(at).as_secs()),
                weather: view.weather.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::model::EventKind;
    use serde_json::json;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default()).unwrap()
    }

    fn reading(device_id: DeviceId) -> Observation {
        Observation {
            device_id: Some(device_id),
            timestamp_epoch_seconds: Some(1_700_000_000),
            temperature_c: Some(20.0),
            ..Observation::default()
        }
    }

    #[test]
    fn stale_station_triggers_exactly_one_reconnect() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_data(&reading(1), start);

        let now = start + Duration::from_secs(121);
        assert_eq!(monitor.sweep(now), Some(HealthAction::Reconnect));
        assert_eq!(monitor.sweep(now + Duration::from_secs(30)), None);

        monitor.on_attach(now + Duration::from_secs(31));
        assert_eq!(
            monitor.sweep(now + Duration::from_secs(61)),
            Some(HealthAction::Reconnect)
        );
    }

    #[test]
    fn fresh_stations_are_left_alone() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_data(&reading(1), start);
        assert_eq!(monitor.sweep(start + Duration::from_secs(119)), None);
    }

    #[test]
    fn never_timestamped_or_disconnected_stations_are_unhealthy() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_data(
            &Observation {
                device_id: Some(2),
                wind_speed_ms: Some(3.0),
                ..Observation::default()
            },
            start,
        );
        assert_eq!(monitor.sweep(start), Some(HealthAction::Reconnect));

        let mut monitor = self::monitor();
        monitor.on_attach(start);
        monitor.on_data(&reading(3), start);
        monitor.on_status(&StatusEvent::device(3, ConnectionStatus::Disconnected, None));
        assert_eq!(monitor.sweep(start), Some(HealthAction::Reconnect));
    }

    #[test]
    fn data_merges_and_forces_connected() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_status(&StatusEvent::device(5, ConnectionStatus::Disconnected, Some("Roof".into())));
        monitor.on_data(&reading(5), start);
        monitor.on_data(
            &Observation {
                device_id: Some(5),
                uv_index: Some(4.0),
                ..Observation::default()
            },
            start,
        );

        let view = &monitor.stations()[&5];
        assert_eq!(view.connection_status, ConnectionStatus::Connected);
        assert_eq!(view.weather.temperature_c, Some(20.0));
        assert_eq!(view.weather.uv_index, Some(4.0));
        assert_eq!(view.label.as_deref(), Some("Roof"));
        assert_eq!(view.last_data_received, Some(start));
    }

    #[test]
    fn configuration_errors_are_aggregated_per_label() {
        let mut monitor = monitor();
        let config_error = |id, label: &str, text: &str| StatusEvent {
            device_id: Some(id),
            status: ConnectionStatus::Error,
            label: Some(label.to_string()),
            error: Some(text.to_string()),
        };

        monitor.on_status(&config_error(1, "Roof", "Missing device id"));
        monitor.on_status(&config_error(1, "Roof", "Missing device id"));
        monitor.on_status(&config_error(2, "Deck", "Failed to create WebSocket connection: 401"));
        monitor.on_status(&config_error(3, "Shed", "socket reset by peer"));

        assert_eq!(
            monitor.error_message().as_deref(),
            Some("Deck: Failed to create WebSocket connection: 401\nRoof: Missing device id")
        );

        monitor.on_status(&StatusEvent::device(2, ConnectionStatus::Connected, Some("Deck".into())));
        assert_eq!(monitor.error_message().as_deref(), Some("Roof: Missing device id"));
    }

    #[test]
    fn data_clears_the_station_error_line() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_status(&StatusEvent {
            device_id: Some(1),
            status: ConnectionStatus::Error,
            label: Some("Roof".into()),
            error: Some("Missing device id".into()),
        });
        assert_eq!(monitor.error_message().as_deref(), Some("Roof: Missing device id"));

        monitor.on_data(&reading(1), start);
        assert!(monitor.error_message().is_none());
        assert_eq!(monitor.stations()[&1].connection_status, ConnectionStatus::Connected);
        assert_eq!(
            monitor.sweep(start + Duration::from_secs(121)),
            Some(HealthAction::Reconnect)
        );
    }

    #[test]
    fn errors_on_display_suppress_reconnects() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_status(&StatusEvent::global(
            ConnectionStatus::Error,
            Some("WEATHER_TOKENS environment variable not configured".into()),
        ));
        monitor.on_status(&StatusEvent::device(9, ConnectionStatus::Disconnected, None));
        assert_eq!(monitor.sweep(start + Duration::from_secs(300)), None);

        monitor.on_status(&StatusEvent::global(ConnectionStatus::Connected, None));
        assert!(monitor.error_message().is_none());
    }

    #[test]
    fn empty_station_list_raises_hint_after_grace() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        assert!(!monitor.check_grace(start + Duration::from_secs(2)));
        assert!(monitor.check_grace(start + Duration::from_secs(3)));
        assert!(!monitor.check_grace(start + Duration::from_secs(4)));
        assert_eq!(monitor.error_message().as_deref(), Some(NO_STATIONS_MESSAGE));

        monitor.on_data(&reading(1), start + Duration::from_secs(5));
        assert!(monitor.error_message().is_none());
    }

    #[test]
    fn grace_hint_stays_hidden_behind_a_displayed_error() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_attach(start);
        monitor.on_status(&StatusEvent::global(
            ConnectionStatus::Error,
            Some("WEATHER_TOKENS environment variable not configured".into()),
        ));

        assert!(!monitor.check_grace(start + Duration::from_secs(5)));
        assert_eq!(
            monitor.error_message().as_deref(),
            Some("Upstream: WEATHER_TOKENS environment variable not configured")
        );
    }

    #[test]
    fn event_buffer_keeps_the_latest() {
        let mut monitor = HealthMonitor::new(HealthConfig {
            event_buffer: 2,
            ..HealthConfig::default()
        })
        .unwrap();
        for ts in 1..=3 {
            monitor.on_event(WeatherEvent {
                device_id: 1,
                kind: EventKind::LightningStrike,
                timestamp_epoch_seconds: Some(ts),
                payload: json!({}),
            });
        }
        let kept: Vec<_> = monitor
            .recent_events()
            .filter_map(|e| e.timestamp_epoch_seconds)
            .collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn frames_are_dispatched_by_name() {
        let start = Instant::now();
        let mut monitor = monitor();
        monitor.on_frame(
            &SseFrame {
                event: "status".into(),
                data: r#"{"deviceId":4,"status":"connected","label":"Deck"}"#.into(),
            },
            start,
        );
        monitor.on_frame(
            &SseFrame {
                event: "weather-data".into(),
                data: r#"{"deviceId":4,"timestampEpochSeconds":1700000000,"pressureMb":1010.5}"#.into(),
            },
            start,
        );
        monitor.on_frame(
            &SseFrame {
                event: "weather-data".into(),
                data: "not json".into(),
            },
            start,
        );

        let reports = monitor.reports(start + Duration::from_secs(7));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].label, "Deck");
        assert_eq!(reports[0].seconds_since_update, Some(7));
        assert_eq!(reports[0].weather.pressure_mb, Some(1010.5));
    }
}
