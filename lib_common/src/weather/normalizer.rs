//! # Observation Normalizer
//!
//! Maps one upstream JSON frame onto zero or one canonical record. Observation
//! payloads arrive as positional numeric arrays; the index tables below follow
//! the upstream's documented layout.
//!
//! Failure semantics: a frame that cannot be parsed, or lacks the fields its
//! type requires, is logged and dropped. `normalize` never returns an error.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use super::metrics::{feels_like, PressureHistory};
use super::model::{DeviceId, EventKind, Observation, WeatherEvent};

// obs_air: [time, pressure, temperature, humidity, strike count, strike distance, battery, interval]
const AIR_TIME: usize = 0;
const AIR_PRESSURE: usize = 1;
const AIR_TEMPERATURE: usize = 2;
const AIR_HUMIDITY: usize = 3;

// obs_sky: [time, illuminance, uv, rain, wind lull, wind avg, wind gust, wind dir, ...]
const SKY_TIME: usize = 0;
const SKY_UV: usize = 2;
const SKY_WIND_AVG: usize = 5;

// obs_st: [time, wind lull, wind avg, wind gust, wind dir, wind interval,
//          pressure, temperature, humidity, illuminance, uv, ...]
const ST_TIME: usize = 0;
const ST_WIND_AVG: usize = 2;
const ST_PRESSURE: usize = 6;
const ST_TEMPERATURE: usize = 7;
const ST_HUMIDITY: usize = 8;
const ST_UV: usize = 10;

// rapid_wind: [time, speed, direction]
const RAPID_TIME: usize = 0;
const RAPID_SPEED: usize = 1;

// evt_strike: [time, distance km, energy]
const STRIKE_TIME: usize = 0;
const STRIKE_DISTANCE: usize = 1;
const STRIKE_ENERGY: usize = 2;

type Row = Vec<Option<f64>>;

/// Raw upstream frame, tagged by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamFrame {
    /// Acknowledgement of a control frame.
    #[serde(rename = "ack")]
    Ack {
        /// Echo of the control frame id.
        #[serde(default)]
        id: Option<String>,
    },
    /// Air module observation.
    #[serde(rename = "obs_air")]
    ObsAir {
        /// Reporting device.
        device_id: DeviceId,
        /// Observation rows.
        obs: Vec<Row>,
    },
    /// Sky module observation.
    #[serde(rename = "obs_sky")]
    ObsSky {
        /// Reporting device.
        device_id: DeviceId,
        /// Observation rows.
        obs: Vec<Row>,
    },
    /// Combined station observation.
    #[serde(rename = "obs_st")]
    ObsSt {
        /// Reporting device.
        device_id: DeviceId,
        /// Observation rows.
        obs: Vec<Row>,
    },
    /// High-frequency wind sample.
    #[serde(rename = "rapid_wind")]
    RapidWind {
        /// Reporting device.
        device_id: DeviceId,
        /// Single sample.
        ob: Row,
    },
    /// Lightning strike.
    #[serde(rename = "evt_strike")]
    EvtStrike {
        /// Reporting device.
        device_id: DeviceId,
        /// Event fields.
        evt: Row,
    },
    /// Rain onset.
    #[serde(rename = "evt_precip")]
    EvtPrecip {
        /// Reporting device.
        device_id: DeviceId,
        /// Event fields, usually just the time.
        #[serde(default)]
        evt: Row,
    },
    /// Anything else the upstream sends (connection notices, device online, ...).
    #[serde(other)]
    Unknown,
}

/// Why a frame was dropped.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// Not JSON, or JSON of the wrong shape for its type.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A payload array was empty or too short.
    #[error("{kind} frame is missing its {field} field")]
    MissingField {
        /// Upstream type name.
        kind: &'static str,
        /// Missing field.
        field: &'static str,
    },
}

/// A canonical record produced from one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A continuous reading.
    Observation(Observation),
    /// A discrete occurrence.
    Event(WeatherEvent),
}

/// Parses raw text into an `UpstreamFrame`.
pub fn parse_frame(raw: &str) -> Result<UpstreamFrame, NormalizeError> {
    Ok(serde_json::from_str(raw)?)
}

/// Normalizes one upstream text frame. Control frames, unknown types and
/// malformed input all yield `None`; the last is logged at `warn`.
pub fn normalize(raw: &str) -> Option<Normalized> {
    let frame = match parse_frame(raw) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping upstream frame: {}", e);
            return None;
        }
    };

    match normalize_frame(frame) {
        Ok(normalized) => normalized,
        Err(e) => {
            log::warn!("Dropping upstream frame: {}", e);
            None
        }
    }
}

/// Normalizes an already-parsed frame.
pub fn normalize_frame(frame: UpstreamFrame) -> Result<Option<Normalized>, NormalizeError> {
    let normalized = match frame {
        UpstreamFrame::Ack { id } => {
            log::debug!("Upstream ack for {:?}", id);
            return Ok(None);
        }
        UpstreamFrame::Unknown => {
            log::debug!("Ignoring upstream frame of unrecognized type");
            return Ok(None);
        }
        UpstreamFrame::ObsAir { device_id, obs } => {
            let row = first_row("obs_air", &obs)?;
            let mut observation = Observation {
                device_id: Some(device_id),
                timestamp_epoch_seconds: epoch(row, AIR_TIME),
                temperature_c: field(row, AIR_TEMPERATURE),
                humidity_pct: field(row, AIR_HUMIDITY),
                pressure_mb: field(row, AIR_PRESSURE),
                ..Default::default()
            };
            observation.feels_like_c = derive_feels_like(&observation);
            Normalized::Observation(observation)
        }
        UpstreamFrame::ObsSky { device_id, obs } => {
            let row = first_row("obs_sky", &obs)?;
            Normalized::Observation(Observation {
                device_id: Some(device_id),
                timestamp_epoch_seconds: epoch(row, SKY_TIME),
                wind_speed_ms: field(row, SKY_WIND_AVG),
                uv_index: field(row, SKY_UV),
                ..Default::default()
            })
        }
        UpstreamFrame::ObsSt { device_id, obs } => {
            let row = first_row("obs_st", &obs)?;
            let mut observation = Observation {
                device_id: Some(device_id),
                timestamp_epoch_seconds: epoch(row, ST_TIME),
                temperature_c: field(row, ST_TEMPERATURE),
                humidity_pct: field(row, ST_HUMIDITY),
                pressure_mb: field(row, ST_PRESSURE),
                wind_speed_ms: field(row, ST_WIND_AVG),
                uv_index: field(row, ST_UV),
                ..Default::default()
            };
            observation.feels_like_c = derive_feels_like(&observation);
            Normalized::Observation(observation)
        }
        UpstreamFrame::RapidWind { device_id, ob } => {
            let speed = field(&ob, RAPID_SPEED).ok_or(NormalizeError::MissingField {
                kind: "rapid_wind",
                field: "wind speed",
            })?;
            Normalized::Observation(Observation {
                device_id: Some(device_id),
                timestamp_epoch_seconds: epoch(&ob, RAPID_TIME),
                wind_speed_ms: Some(speed),
                ..Default::default()
            })
        }
        UpstreamFrame::EvtStrike { device_id, evt } => {
            if evt.is_empty() {
                return Err(NormalizeError::MissingField {
                    kind: "evt_strike",
                    field: "evt",
                });
            }
            Normalized::Event(WeatherEvent {
                device_id,
                kind: EventKind::LightningStrike,
                timestamp_epoch_seconds: epoch(&evt, STRIKE_TIME),
                payload: json!({
                    "distanceKm": field(&evt, STRIKE_DISTANCE),
                    "energy": field(&evt, STRIKE_ENERGY),
                }),
            })
        }
        UpstreamFrame::EvtPrecip { device_id, evt } => Normalized::Event(WeatherEvent {
            device_id,
            kind: EventKind::PrecipitationStart,
            timestamp_epoch_seconds: epoch(&evt, 0),
            payload: json!({}),
        }),
    };

    Ok(Some(normalized))
}

/// Pushes the observation's pressure into `history` and stamps the resulting
/// trend on the observation. Readings without pressure are left alone.
pub fn attach_trend(observation: &mut Observation, history: &mut PressureHistory) {
    if let Some(pressure) = observation.pressure_mb {
        history.push(pressure);
        observation.barometric_trend = Some(history.trend());
    }
}

fn derive_feels_like(observation: &Observation) -> Option<f64> {
    match (observation.temperature_c, observation.humidity_pct) {
        (Some(t), Some(h)) => feels_like(t, h),
        _ => None,
    }
}

fn first_row<'a>(kind: &'static str, rows: &'a [Row]) -> Result<&'a Row, NormalizeError> {
    rows.first()
        .filter(|row| !row.is_empty())
        .ok_or(NormalizeError::MissingField { kind, field: "obs" })
}

fn field(row: &[Option<f64>], index: usize) -> Option<f64> {
    row.get(index).copied().flatten()
}

fn epoch(row: &[Option<f64>], index: usize) -> Option<i64> {
    field(row, index).map(|t| t as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weather::model::BarometricTrend;

    fn observation(raw: &str) -> Observation {
        match normalize(raw) {
            Some(Normalized::Observation(obs)) => obs,
            other => panic!("expected observation, got {:?}", other),
        }
    }

    #[test]
    fn air_observation() {
        let obs = observation(
            r#"{"type":"obs_air","device_id":1110,"obs":[[1700000000,1011.5,32.0,70.0,0,0,3.46,1]]}"#,
        );
        assert_eq!(obs.device_id, Some(1110));
        assert_eq!(obs.timestamp_epoch_seconds, Some(1_700_000_000));
        assert_eq!(obs.pressure_mb, Some(1011.5));
        assert_eq!(obs.temperature_c, Some(32.0));
        assert_eq!(obs.humidity_pct, Some(70.0));
        assert!(obs.feels_like_c.unwrap() > 32.0);
        assert_eq!(obs.wind_speed_ms, None);
    }

    #[test]
    fn sky_observation() {
        let obs = observation(
            r#"{"type":"obs_sky","device_id":2,"obs":[[1700000060,9000,3.2,0,0.5,1.8,2.9,180,3.1,1,130,0,0,3]]}"#,
        );
        assert_eq!(obs.uv_index, Some(3.2));
        assert_eq!(obs.wind_speed_ms, Some(1.8));
        assert_eq!(obs.temperature_c, None);
        assert_eq!(obs.feels_like_c, None);
    }

    #[test]
    fn station_observation() {
        let obs = observation(
            r#"{"type":"obs_st","device_id":3,"obs":[[1700000120,0.1,2.4,3.0,200,3,1009.2,15.0,55.0,800,1.1,20,0,0,0,0,2.6,1]]}"#,
        );
        assert_eq!(obs.wind_speed_ms, Some(2.4));
        assert_eq!(obs.pressure_mb, Some(1009.2));
        assert_eq!(obs.temperature_c, Some(15.0));
        assert_eq!(obs.humidity_pct, Some(55.0));
        assert_eq!(obs.uv_index, Some(1.1));
        assert_eq!(obs.feels_like_c, None);
    }

    #[test]
    fn rapid_wind() {
        let obs = observation(r#"{"type":"rapid_wind","device_id":4,"ob":[1700000003,4.5,270]}"#);
        assert_eq!(obs.wind_speed_ms, Some(4.5));
        assert_eq!(obs.timestamp_epoch_seconds, Some(1_700_000_003));
    }

    #[test]
    fn lightning_strike_event() {
        match normalize(r#"{"type":"evt_strike","device_id":5,"evt":[1700000200,12,3400]}"#) {
            Some(Normalized::Event(event)) => {
                assert_eq!(event.kind, EventKind::LightningStrike);
                assert_eq!(event.device_id, 5);
                assert_eq!(event.payload["distanceKm"], 12.0);
                assert_eq!(event.payload["energy"], 3400.0);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn precipitation_event_needs_only_device() {
        match normalize(r#"{"type":"evt_precip","device_id":6}"#) {
            Some(Normalized::Event(event)) => {
                assert_eq!(event.kind, EventKind::PrecipitationStart);
                assert_eq!(event.timestamp_epoch_seconds, None);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn control_unknown_and_malformed_frames_are_dropped() {
        assert_eq!(normalize(r#"{"type":"ack","id":"listen-1-1"}"#), None);
        assert_eq!(normalize(r#"{"type":"connection_opened"}"#), None);
        assert_eq!(normalize("not json"), None);
        assert_eq!(normalize(r#"{"type":"obs_air","obs":[[1]]}"#), None);
        assert_eq!(normalize(r#"{"type":"obs_air","device_id":1,"obs":[]}"#), None);
        assert_eq!(normalize(r#"{"type":"rapid_wind","device_id":1,"ob":[1700000000]}"#), None);
    }

    #[test]
    fn nulls_inside_arrays_become_absent_fields() {
        let obs = observation(r#"{"type":"obs_air","device_id":9,"obs":[[1700000000,null,21.0,null]]}"#);
        assert_eq!(obs.pressure_mb, None);
        assert_eq!(obs.temperature_c, Some(21.0));
        assert_eq!(obs.humidity_pct, None);
    }

    #[test]
    fn trend_is_attached_from_history() {
        let mut history = PressureHistory::new();
        let mut last = None;
        for pressure in [1000.0, 1000.0, 1000.0, 1001.0, 1002.0, 1003.0] {
            let mut obs = Observation {
                pressure_mb: Some(pressure),
                ..Default::default()
            };
            attach_trend(&mut obs, &mut history);
            last = obs.barometric_trend;
        }
        assert_eq!(last, Some(BarometricTrend::Rising));

        let mut wind = Observation {
            wind_speed_ms: Some(1.0),
            ..Default::default()
        };
        attach_trend(&mut wind, &mut history);
        assert_eq!(wind.barometric_trend, None);
        assert_eq!(history.len(), 6);
    }
}
