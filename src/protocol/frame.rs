//! Telemetry frame assembly and parsing.
//!
//! The bottle streams newline-delimited JSON objects over the telemetry
//! characteristic. Notifications are cut at arbitrary points by the radio, so
//! bytes are accumulated until a delimiter completes a frame.
//!
//! Wire schema (one flat object per line):
//!
//! | key    | type                          | required |
//! |--------|-------------------------------|----------|
//! | `t`    | number, °C                    | yes      |
//! | `ts`   | string `yyyy-MM-dd HH:mm:ss`  | yes      |
//! | `uv`   | number, `0` or `1`            | no       |
//! | `bat`  | number, volts                 | no       |
//! | `flow` | number                        | no       |
//!
//! Older firmware only sends `t` and `ts`; the extended keys are then
//! reported as `None` on the record.

use bytes::BytesMut;
use serde::Deserialize;
use tracing::{trace, warn};

use crate::data::TelemetryRecord;
use crate::error::{Error, Result};
use crate::utils::{epoch_to_display, parse_device_timestamp};

/// Byte terminating every frame.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Raw frame as it appears on the wire.
#[derive(Debug, Deserialize)]
struct WireFrame {
    t: f64,
    ts: String,
    #[serde(default, alias = "uvCycle")]
    uv: Option<f64>,
    #[serde(default, alias = "battery")]
    bat: Option<f64>,
    #[serde(default, alias = "flowRate")]
    flow: Option<f64>,
}

/// Decode a single frame (without its delimiter) into a record.
///
/// The text is trimmed before parsing. Unknown keys are ignored.
///
/// # Errors
///
/// Returns [`Error::FrameParse`] if the frame is not a JSON object, a
/// required key is missing, a value has the wrong type, `uv` is not 0 or 1,
/// or the timestamp does not match `yyyy-MM-dd HH:mm:ss`.
pub fn decode_frame(text: &str) -> Result<TelemetryRecord> {
    let text = text.trim();

    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(text).map_err(|e| Error::FrameParse {
            context: format!("not a JSON object: {}", e),
        })?;

    let wire = WireFrame::deserialize(serde_json::Value::Object(object)).map_err(|e| {
        Error::FrameParse {
            context: e.to_string(),
        }
    })?;

    let uv_cycle = match wire.uv {
        None => None,
        Some(v) if v == 0.0 => Some(false),
        Some(v) if v == 1.0 => Some(true),
        Some(v) => {
            return Err(Error::FrameParse {
                context: format!("uv flag must be 0 or 1, got {}", v),
            })
        }
    };

    let timestamp_epoch_seconds = parse_device_timestamp(&wire.ts)?;
    let display_timestamp = epoch_to_display(timestamp_epoch_seconds)?;

    Ok(TelemetryRecord {
        temperature: wire.t,
        uv_cycle,
        battery_voltage: wire.bat,
        flow_rate: wire.flow,
        timestamp_epoch_seconds,
        display_timestamp,
    })
}

/// Reassembles the notification byte stream into telemetry records.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// Bytes received but not yet terminated by a delimiter.
    buffer: BytesMut,
    /// Number of frames dropped because they failed to decode.
    rejected: u64,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every record completed by it, in order.
    ///
    /// Malformed frames are logged and dropped. Blank lines are skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<TelemetryRecord> {
        // Bytes before `start` were already searched on a previous call.
        let mut start = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();

        while let Some(offset) = self.buffer[start..]
            .iter()
            .position(|&b| b == FRAME_DELIMITER)
        {
            let frame = self.buffer.split_to(start + offset + 1);
            start = 0;

            let body = &frame[..frame.len() - 1];
            if let Some(record) = self.decode(body) {
                records.push(record);
            }
        }

        records
    }

    fn decode(&mut self, body: &[u8]) -> Option<TelemetryRecord> {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                self.rejected += 1;
                warn!("Dropping frame with invalid UTF-8: {}", e);
                return None;
            }
        };

        if text.trim().is_empty() {
            trace!("Skipping empty frame");
            return None;
        }

        match decode_frame(text) {
            Ok(record) => {
                trace!("Assembled frame: {}", text.trim());
                Some(record)
            }
            Err(e) => {
                self.rejected += 1;
                warn!("Dropping malformed frame {:?}: {}", text.trim(), e);
                None
            }
        }
    }

    /// Number of buffered bytes still waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of frames dropped since creation.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
