//! # Device Discovery
//!
//! REST prefetch of the devices a token can see: `GET stations?token=...`.
//! Hubs are dropped since they never report observations of their own.

use serde::Deserialize;
use thiserror::Error;

use super::model::DeviceId;
use crate::retrieve::rest_client::RestClient;

#[derive(Debug, Deserialize)]
struct StationsResponse {
    #[serde(default)]
    stations: Vec<StationRecord>,
}

#[derive(Debug, Deserialize)]
struct StationRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
struct DeviceRecord {
    device_id: DeviceId,
    #[serde(default)]
    device_type: Option<String>,
}

/// A subscribable device and the label subscribers should show for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Upstream device id.
    pub device_id: DeviceId,
    /// Human-readable station label.
    pub label: String,
}

/// Discovery failures. All of them are transient from the caller's view and
/// retried on a fixed timer.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Transport failure or undecodable body.
    #[error("station list request failed: {0}")]
    Request(#[from] anyhow::Error),
    /// The upstream answered with a non-2xx status.
    #[error("station list request returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
}

/// Lists devices via the upstream REST API.
#[derive(Clone)]
pub struct DeviceDirectory {
    client: RestClient,
}

impl DeviceDirectory {
    /// Directory rooted at `rest_url` (e.g. `https://swd.weatherflow.com/swd/rest/`).
    pub fn new(rest_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: RestClient::new(rest_url)?,
        })
    }

    /// Fetches every non-hub device visible to `token`.
    pub async fn fetch_devices(&self, token: &str) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let response = self
            .client
            .get_json::<StationsResponse>("stations", &[("token", token)])
            .await?;

        if !response.success {
            return Err(DiscoveryError::Status {
                status: response.status,
                body: response.error_body.unwrap_or_default(),
            });
        }

        Ok(response.data.map(devices_from_response).unwrap_or_default())
    }
}

fn is_hub(device: &DeviceRecord) -> bool {
    device
        .device_type
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("hb") || kind.eq_ignore_ascii_case("hub"))
}

fn devices_from_response(response: StationsResponse) -> Vec<DiscoveredDevice> {
    let mut found = Vec::new();
    for station in response.stations {
        let sensors: Vec<&DeviceRecord> = station.devices.iter().filter(|d| !is_hub(d)).collect();
        let multiple = sensors.len() > 1;

        for device in sensors {
            let base = station
                .name
                .clone()
                .unwrap_or_else(|| format!("Device {}", device.device_id));
            // Stations with several sensors get the device type appended so
            // labels stay distinguishable.
            let label = match (&device.device_type, multiple) {
                (Some(kind), true) => format!("{} ({})", base, kind),
                _ => base,
            };
            found.push(DiscoveredDevice {
                device_id: device.device_id,
                label,
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Vec<DiscoveredDevice> {
        devices_from_response(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn hubs_are_excluded() {
        let devices = parse(
            r#"{"stations":[{"name":"Backyard","devices":[
                {"device_id":10,"device_type":"HB"},
                {"device_id":11,"device_type":"ST"}
            ]}]}"#,
        );
        assert_eq!(
            devices,
            vec![DiscoveredDevice {
                device_id: 11,
                label: "Backyard".to_string()
            }]
        );
    }

    #[test]
    fn multi_sensor_stations_get_typed_labels() {
        let devices = parse(
            r#"{"stations":[{"name":"Roof","devices":[
                {"device_id":1,"device_type":"hub"},
                {"device_id":2,"device_type":"AR"},
                {"device_id":3,"device_type":"SK"}
            ]},{"devices":[{"device_id":4}]}]}"#,
        );
        let labels: Vec<_> = devices.iter().map(|d| (d.device_id, d.label.as_str())).collect();
        assert_eq!(labels, vec![(2, "Roof (AR)"), (3, "Roof (SK)"), (4, "Device 4")]);
    }

    #[test]
    fn empty_response_has_no_devices() {
        assert!(parse("{}").is_empty());
    }
}
