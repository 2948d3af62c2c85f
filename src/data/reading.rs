//! Telemetry record data structures.
//!
//! Contains the typed form of one telemetry frame received from the bottle.

use serde::{Deserialize, Serialize};

use crate::utils::celsius_to_fahrenheit;

/// One validated telemetry sample.
///
/// Produced only by the [`FrameAssembler`](crate::protocol::FrameAssembler).
/// The extended sensor fields are `None` when the peripheral runs the base
/// protocol that only reports temperature and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Water temperature in degrees Celsius.
    pub temperature: f64,

    /// Whether the UV sterilisation cycle was running.
    pub uv_cycle: Option<bool>,

    /// Battery voltage in volts.
    pub battery_voltage: Option<f64>,

    /// Flow rate as reported by the flow sensor.
    pub flow_rate: Option<f64>,

    /// Sample time in epoch seconds.
    pub timestamp_epoch_seconds: i64,

    /// Sample time rendered for display (`dd MMM yyyy, hh:mm a`).
    pub display_timestamp: String,
}

impl TelemetryRecord {
    /// Temperature converted to Fahrenheit.
    pub fn temperature_fahrenheit(&self) -> f64 {
        celsius_to_fahrenheit(self.temperature)
    }

    /// Whether the frame carried the extended sensor fields.
    pub fn is_extended(&self) -> bool {
        self.uv_cycle.is_some() || self.battery_voltage.is_some() || self.flow_rate.is_some()
    }
}

impl std::fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}°C @ {}", self.temperature, self.display_timestamp)?;
        if let Some(uv) = self.uv_cycle {
            write!(f, " uv={}", if uv { "on" } else { "off" })?;
        }
        if let Some(battery) = self.battery_voltage {
            write!(f, " bat={:.2}V", battery)?;
        }
        if let Some(flow) = self.flow_rate {
            write!(f, " flow={:.2}", flow)?;
        }
        Ok(())
    }
}
