//! MQTT report and command message types, plus topic helpers.
//!
//! The controller publishes one JSON report per cycle to
//! `tele/<device_id>/report` and, when remote commands are enabled,
//! accepts manual dose requests on `cmd/<device_id>/dose`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::activity::{DoseActivity, RelayActivity};
use crate::config::CHANNEL_COUNT;
use crate::peripherals::EnvReading;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Per-cycle telemetry snapshot. Optional fields are omitted when the
/// corresponding peripheral is absent or its read failed this cycle.
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub device_id: String,
    /// Unix timestamp at publish time.
    pub ts: i64,
    /// Raw moisture readings (pulses/sec) for channels 1..=8.
    pub readings: Vec<f64>,
    /// Saturation fractions for channels 1..=8.
    pub saturation: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_present: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<f64>,
    pub dose_activities: Vec<DoseActivity>,
    pub relay_activities: Vec<RelayActivity>,
}

/// Manual dose request received over MQTT.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct DoseCommand {
    /// Pump position, 1..=8.
    pub position: u8,
    /// Dose length in seconds.
    pub duration: f64,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub fn report_topic(device_id: &str) -> String {
    format!("tele/{device_id}/report")
}

pub fn command_topic(device_id: &str) -> String {
    format!("cmd/{device_id}/dose")
}

/// Parse and validate a dose command payload. Position must name a real
/// channel and the duration must be positive.
pub fn parse_dose_command(payload: &[u8]) -> Result<DoseCommand> {
    let cmd: DoseCommand =
        serde_json::from_slice(payload).context("malformed dose command payload")?;
    if cmd.position < 1 || cmd.position as usize > CHANNEL_COUNT {
        bail!("dose command position {} out of range 1..=8", cmd.position);
    }
    if !(cmd.duration > 0.0) || !cmd.duration.is_finite() {
        bail!("dose command duration {} must be positive", cmd.duration);
    }
    Ok(cmd)
}

// ===========================================================================
// Tests
// ===========================================================================
