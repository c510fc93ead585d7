//! Canonical records shared by the relay and its subscribers.
//!
//! Every record here is produced once and never mutated after it is handed to
//! the bus. Consumers that want a running view of a station merge observations
//! into their own copy (see `Observation::merge_from`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upstream device identifier.
pub type DeviceId = u64;

/// Push-stream frame name for `StatusEvent` payloads.
pub const FRAME_STATUS: &str = "status";
/// Push-stream frame name for `Observation` payloads.
pub const FRAME_DATA: &str = "weather-data";
/// Push-stream frame name for `WeatherEvent` payloads.
pub const FRAME_EVENT: &str = "weather-event";

/// Health of a single station, or of the upstream socket when a status event
/// carries no device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Reachable and reporting (or just discovered).
    Connected,
    /// The socket carrying this station is down.
    Disconnected,
    /// A fault was reported; see the accompanying error text.
    Error,
}

/// Direction of the station pressure over the trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarometricTrend {
    /// Pressure went up by more than the threshold.
    Rising,
    /// Pressure went down by more than the threshold.
    Falling,
    /// Not enough samples, or the change is within the threshold.
    Steady,
}

/// One continuous reading. Which fields are present depends on the upstream
/// message type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Reporting device.
    pub device_id: Option<DeviceId>,
    /// Upstream sample time, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_epoch_seconds: Option<i64>,
    /// Air temperature in °C.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    /// Relative humidity in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    /// Station pressure in millibar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_mb: Option<f64>,
    /// Average wind speed in m/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed_ms: Option<f64>,
    /// UV index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_index: Option<f64>,
    /// Pressure trend, only set on readings that carry a pressure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barometric_trend: Option<BarometricTrend>,
    /// Humidex-derived perceived temperature in °C.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feels_like_c: Option<f64>,
}

impl Observation {
    /// Folds `newer` into `self`: every field present in `newer` overrides the
    /// stored value, absent fields leave the stored value untouched.
    pub fn merge_from(&mut self, newer: &Observation) {
        fn take<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.device_id, newer.device_id);
        take(&mut self.timestamp_epoch_seconds, newer.timestamp_epoch_seconds);
        take(&mut self.temperature_c, newer.temperature_c);
        take(&mut self.humidity_pct, newer.humidity_pct);
        take(&mut self.pressure_mb, newer.pressure_mb);
        take(&mut self.wind_speed_ms, newer.wind_speed_ms);
        take(&mut self.uv_index, newer.uv_index);
        take(&mut self.barometric_trend, newer.barometric_trend);
        take(&mut self.feels_like_c, newer.feels_like_c);
    }
}

/// Kind of a discrete occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A lightning strike was detected.
    LightningStrike,
    /// Rain started falling.
    PrecipitationStart,
}

/// A discrete occurrence, as opposed to a continuous reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherEvent {
    /// Reporting device.
    pub device_id: DeviceId,
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Upstream event time, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_epoch_seconds: Option<i64>,
    /// Type-specific details, e.g. `{"distanceKm": 12, "energy": 3400}`.
    pub payload: Value,
}

/// A connection/health transition. `device_id == None` refers to the upstream
/// socket as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Station concerned, or `None` for the global socket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// New status.
    pub status: ConnectionStatus,
    /// Station label, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Error text for `ConnectionStatus::Error` transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    /// Global (socket-level) transition.
    pub fn global(status: ConnectionStatus, error: Option<String>) -> Self {
        Self {
            device_id: None,
            status,
            label: None,
            error,
        }
    }

    /// Per-station transition.
    pub fn device(device_id: DeviceId, status: ConnectionStatus, label: Option<String>) -> Self {
        Self {
            device_id: Some(device_id),
            status,
            label,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_fields_the_newer_reading_omits() {
        let mut view = Observation {
            device_id: Some(7),
            temperature_c: Some(21.5),
            pressure_mb: Some(1012.0),
            ..Default::default()
        };
        let wind_only = Observation {
            device_id: Some(7),
            timestamp_epoch_seconds: Some(1_700_000_100),
            wind_speed_ms: Some(3.2),
            ..Default::default()
        };
        view.merge_from(&wind_only);

        assert_eq!(view.temperature_c, Some(21.5));
        assert_eq!(view.pressure_mb, Some(1012.0));
        assert_eq!(view.wind_speed_ms, Some(3.2));
        assert_eq!(view.timestamp_epoch_seconds, Some(1_700_000_100));

        let warmer = Observation {
            temperature_c: Some(23.0),
            ..Default::default()
        };
        view.merge_from(&warmer);
        assert_eq!(view.temperature_c, Some(23.0));
        assert_eq!(view.wind_speed_ms, Some(3.2));
    }

    #[test]
    fn wire_shapes_use_camel_case() {
        let obs = Observation {
            device_id: Some(1),
            feels_like_c: Some(30.1),
            barometric_trend: Some(BarometricTrend::Rising),
            ..Default::default()
        };
        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["deviceId"], 1);
        assert_eq!(json["feelsLikeC"], 30.1);
        assert_eq!(json["barometricTrend"], "rising");
        assert!(json.get("temperatureC").is_none());

        let status = StatusEvent::global(ConnectionStatus::Error, Some("boom".into()));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "error": "boom"}));

        let event = WeatherEvent {
            device_id: 3,
            kind: EventKind::LightningStrike,
            timestamp_epoch_seconds: Some(10),
            payload: serde_json::json!({"distanceKm": 4.0}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lightning-strike");
    }
}
