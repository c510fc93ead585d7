//! # Derived Metrics
//!
//! Two values the upstream does not send directly:
//!
//! - **Feels-like temperature**: a humidex-style figure, only reported when it
//!   differs meaningfully from the air temperature in warm, humid conditions.
//! - **Barometric trend**: rising/falling/steady over the last six pressure
//!   samples (about thirty minutes at the upstream's five-minute cadence).

use std::collections::VecDeque;

use super::model::BarometricTrend;

/// Pressure samples kept per station.
pub const PRESSURE_HISTORY_CAPACITY: usize = 20;
/// Trailing samples the trend looks at.
pub const TREND_WINDOW: usize = 6;
/// Fewer samples than this in the window always reads as steady.
pub const TREND_MIN_SAMPLES: usize = 3;
/// Change in mb that counts as a trend.
pub const TREND_THRESHOLD_MB: f64 = 1.0;

const FEELS_LIKE_MIN_TEMP_C: f64 = 20.0;
const FEELS_LIKE_MIN_HUMIDITY: f64 = 40.0;
const FEELS_LIKE_MIN_DELTA_C: f64 = 2.0;

/// Humidex-style perceived temperature.
///
/// Returns `None` below 20 °C or 40 % humidity, and when the result is within
/// 2 °C of the air temperature or humidity is not strictly above 40 %.
pub fn feels_like(temperature_c: f64, humidity_pct: f64) -> Option<f64> {
    if temperature_c < FEELS_LIKE_MIN_TEMP_C || humidity_pct < FEELS_LIKE_MIN_HUMIDITY {
        return None;
    }

    let dew_point = temperature_c - (100.0 - humidity_pct) / 5.0;
    let vapor_pressure = 6.11 * (5417.753 * (1.0 / 273.16 - 1.0 / (dew_point + 273.16))).exp();
    let humidex = temperature_c + 0.5555 * (vapor_pressure - 10.0);

    if (humidex - temperature_c).abs() > FEELS_LIKE_MIN_DELTA_C && humidity_pct > FEELS_LIKE_MIN_HUMIDITY {
        Some((humidex * 10.0).round() / 10.0)
    } else {
        None
    }
}

/// Classifies the trailing `TREND_WINDOW` samples of `history` (oldest first).
pub fn barometric_trend<'a, I>(history: I) -> BarometricTrend
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut window: Vec<f64> = history.into_iter().rev().take(TREND_WINDOW).copied().collect();
    if window.len() < TREND_MIN_SAMPLES {
        return BarometricTrend::Steady;
    }
    window.reverse();

    let difference = window[window.len() - 1] - window[0];
    if difference > TREND_THRESHOLD_MB {
        BarometricTrend::Rising
    } else if difference < -TREND_THRESHOLD_MB {
        BarometricTrend::Falling
    } else {
        BarometricTrend::Steady
    }
}

/// Bounded pressure ring buffer. The oldest sample is evicted on overflow.
#[derive(Debug, Clone, Default)]
pub struct PressureHistory {
    samples: VecDeque<f64>,
}

impl PressureHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(PRESSURE_HISTORY_CAPACITY),
        }
    }

    /// Appends a reading, evicting the oldest one when full.
    pub fn push(&mut self, pressure_mb: f64) {
        if self.samples.len() == PRESSURE_HISTORY_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(pressure_mb);
    }

    /// Trend over the buffered readings.
    pub fn trend(&self) -> BarometricTrend {
        barometric_trend(self.samples.iter())
    }

    /// Number of buffered readings.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing has been buffered yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Readings, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }
}
