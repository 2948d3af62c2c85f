//! Data structures for bottle telemetry.
//!
//! This module contains the typed telemetry record and the bounded history
//! of recent records.

pub mod history;
pub mod reading;

pub use history::{ReadingHistory, DEFAULT_HISTORY_CAPACITY};
pub use reading::TelemetryRecord;
