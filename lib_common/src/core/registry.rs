//! # Station Registry
//!
//! Per-device state owned by the connection manager. Nothing outside the
//! manager mutates it; subscribers only ever see the status events derived
//! from it.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::weather::metrics::PressureHistory;
use crate::weather::model::{ConnectionStatus, DeviceId, StatusEvent};

/// One upstream device as the relay knows it.
#[derive(Debug, Clone)]
pub struct Station {
    /// Label from discovery, if any.
    pub label: Option<String>,
    /// Arrival time of the last frame for this device.
    pub last_seen: Option<DateTime<Utc>>,
    /// Current health.
    pub connection_status: ConnectionStatus,
    /// Recent pressure readings for the trend.
    pub pressure_history: PressureHistory,
}

impl Station {
    fn new() -> Self {
        Self {
            label: None,
            last_seen: None,
            connection_status: ConnectionStatus::Disconnected,
            pressure_history: PressureHistory::new(),
        }
    }

    /// Status event describing this station as it stands now.
    pub fn status_event(&self, device_id: DeviceId) -> StatusEvent {
        StatusEvent::device(device_id, self.connection_status, self.label.clone())
    }
}

/// Keyed by device id. Ordered so snapshots replay deterministically.
#[derive(Debug, Default)]
pub struct StationRegistry {
    stations: BTreeMap<DeviceId, Station>,
}

impl StationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the station for `device_id`, creating a blank one first if the
    /// id has never been seen. Creation is how observations that arrive before
    /// discovery (or for undiscovered devices) still get a registry entry.
    pub fn get_or_create(&mut self, device_id: DeviceId) -> &mut Station {
        self.stations.entry(device_id).or_insert_with(|| {
            log::debug!("Registry: created station {}", device_id);
            Station::new()
        })
    }

    /// Station for `device_id`, if known.
    pub fn get(&self, device_id: DeviceId) -> Option<&Station> {
        self.stations.get(&device_id)
    }

    /// True when `device_id` has a station.
    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.stations.contains_key(&device_id)
    }

    /// Number of known stations.
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// True before the first station is created.
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Sets the status of one station. Returns the event to publish when the
    /// status actually changed.
    pub fn set_status(&mut self, device_id: DeviceId, status: ConnectionStatus) -> Option<StatusEvent> {
        let station = self.get_or_create(device_id);
        if station.connection_status == status {
            return None;
        }
        station.connection_status = status;
        Some(station.status_event(device_id))
    }

    /// Marks every connected station as disconnected, returning one event per
    /// station that changed.
    pub fn disconnect_all(&mut self) -> Vec<StatusEvent> {
        self.stations
            .iter_mut()
            .filter(|(_, s)| s.connection_status != ConnectionStatus::Disconnected)
            .map(|(id, s)| {
                s.connection_status = ConnectionStatus::Disconnected;
                s.status_event(*id)
            })
            .collect()
    }

    /// One status event per known station, in device id order.
    pub fn snapshot(&self) -> Vec<StatusEvent> {
        self.stations.iter().map(|(id, s)| s.status_event(*id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_explicit_and_stable() {
        let mut registry = StationRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.contains(5));
        registry.get_or_create(5).label = Some("Garden".into());
        registry.get_or_create(5);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(5) && !registry.is_empty());
        assert_eq!(registry.get(5).unwrap().label.as_deref(), Some("Garden"));
        assert_eq!(registry.get(5).unwrap().connection_status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn set_status_reports_only_transitions() {
        let mut registry = StationRegistry::new();
        let event = registry.set_status(1, ConnectionStatus::Connected).unwrap();
        assert_eq!(event.device_id, Some(1));
        assert_eq!(event.status, ConnectionStatus::Connected);
        assert!(registry.set_status(1, ConnectionStatus::Connected).is_none());
    }

    #[test]
    fn disconnect_all_skips_already_disconnected() {
        let mut registry = StationRegistry::new();
        registry.set_status(1, ConnectionStatus::Connected);
        registry.get_or_create(2);
        let events = registry.disconnect_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, Some(1));
        assert!(registry
            .snapshot()
            .iter()
            .all(|e| e.status == ConnectionStatus::Disconnected));
    }
}
