//! TOML config file loading and validation for the controller.
//!
//! The threshold policy is decided once at startup: either one value
//! shared by every position or an eight-entry table indexed by position.
//! A malformed table is a fatal startup error, never a per-cycle one.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Number of paired sensor/pump channels on the board.
pub const CHANNEL_COUNT: usize = 8;

/// Plausible pulses/sec range for a dryness threshold.
const THRESHOLD_MAX: f64 = 28.0;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device_id: String,
    pub irrigation: Irrigation,
    #[serde(default)]
    pub water_sensor: WaterSensor,
    #[serde(default)]
    pub refill: Refill,
    #[serde(default)]
    pub reporting: Reporting,
    #[serde(default)]
    pub peripherals: Peripherals,
    #[serde(default)]
    pub calibration: Calibration,
}

#[derive(Debug, Deserialize)]
pub struct Irrigation {
    /// Dryness threshold in pulses/sec: readings at or above it dose.
    pub soil_wet_threshold: ThresholdPolicy,
    /// Allow dosing even when no water gate confirms reservoir presence.
    #[serde(default)]
    pub pump_when_dry: bool,
    #[serde(default = "default_dose_duration")]
    pub dose_duration_sec: f64,
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay_sec: f64,
    #[serde(default = "default_channel_delay")]
    pub channel_delay_sec: f64,
}

fn default_dose_duration() -> f64 {
    30.0
}
fn default_cycle_delay() -> f64 {
    5.0
}
fn default_channel_delay() -> f64 {
    2.0
}

/// Dryness threshold policy: one value for the whole board or a
/// per-position table of length [`CHANNEL_COUNT`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ThresholdPolicy {
    Uniform(f64),
    PerPosition(Vec<f64>),
}

impl ThresholdPolicy {
    /// Resolve the threshold for a 0-indexed position. Table length is
    /// enforced at startup by `validate()`, so indexing cannot fail.
    pub fn threshold_for(&self, position: usize) -> f64 {
        match self {
            Self::Uniform(value) => *value,
            Self::PerPosition(table) => table[position],
        }
    }

    fn values(&self) -> &[f64] {
        match self {
            Self::Uniform(value) => std::slice::from_ref(value),
            Self::PerPosition(table) => table,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WaterSensor {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_water_pin")]
    pub gpio_pin: u8,
}

fn default_true() -> bool {
    true
}
fn default_water_pin() -> u8 {
    21
}

impl Default for WaterSensor {
    fn default() -> Self {
        Self {
            enabled: true,
            gpio_pin: default_water_pin(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Refill {
    #[serde(default)]
    pub enabled: bool,
    /// Relay board position reported in activity records.
    #[serde(default = "default_relay_position")]
    pub relay_position: u8,
    #[serde(default = "default_refill_pin")]
    pub gpio_pin: u8,
    #[serde(default = "default_refill_duration")]
    pub duration_sec: f64,
}

fn default_relay_position() -> u8 {
    1
}
fn default_refill_pin() -> u8 {
    20
}
fn default_refill_duration() -> f64 {
    60.0
}

impl Default for Refill {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_position: default_relay_position(),
            gpio_pin: default_refill_pin(),
            duration_sec: default_refill_duration(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Reporting {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// Accept at most one externally supplied dose command per cycle.
    #[serde(default)]
    pub remote_commands: bool,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}

impl Default for Reporting {
    fn default() -> Self {
        Self {
            enabled: false,
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            remote_commands: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Peripherals {
    #[serde(default)]
    pub co2_enabled: bool,
    #[serde(default)]
    pub ph_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct Calibration {
    /// Fully-wet calibration point in pulses/sec.
    #[serde(default = "default_wet_point")]
    pub wet_point: f64,
    /// Fully-dry calibration point in pulses/sec.
    #[serde(default = "default_dry_point")]
    pub dry_point: f64,
}

fn default_wet_point() -> f64 {
    0.7
}
fn default_dry_point() -> f64 {
    27.6
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            wet_point: default_wet_point(),
            dry_point: default_dry_point(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".to_string());
        }

        self.validate_irrigation(&mut errors);
        self.validate_peripherals(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let irr = &self.irrigation;

        // ── Threshold policy ─────────────────────────────────────
        if let ThresholdPolicy::PerPosition(table) = &irr.soil_wet_threshold {
            if table.len() != CHANNEL_COUNT {
                errors.push(format!(
                    "soil_wet_threshold table has {} entries, expected {CHANNEL_COUNT}",
                    table.len()
                ));
            }
        }
        for (i, value) in irr.soil_wet_threshold.values().iter().enumerate() {
            if !(0.0..=THRESHOLD_MAX).contains(value) {
                errors.push(format!(
                    "soil_wet_threshold[{i}] = {value} out of range [0, {THRESHOLD_MAX}]"
                ));
            }
        }

        // ── Timing values ────────────────────────────────────────
        if irr.dose_duration_sec <= 0.0 {
            errors.push(format!(
                "dose_duration_sec must be positive, got {}",
                irr.dose_duration_sec
            ));
        }
        if irr.cycle_delay_sec < 0.0 {
            errors.push(format!(
                "cycle_delay_sec must not be negative, got {}",
                irr.cycle_delay_sec
            ));
        }
        if irr.channel_delay_sec < 0.0 {
            errors.push(format!(
                "channel_delay_sec must not be negative, got {}",
                irr.channel_delay_sec
            ));
        }

        // ── GPIO pins ────────────────────────────────────────────
        if self.water_sensor.enabled && !VALID_GPIO_PINS.contains(&self.water_sensor.gpio_pin) {
            errors.push(format!(
                "water_sensor.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.water_sensor.gpio_pin
            ));
        }

        // ── Refill relay ─────────────────────────────────────────
        if self.refill.enabled {
            if self.refill.duration_sec <= 0.0 {
                errors.push(format!(
                    "refill.duration_sec must be positive, got {}",
                    self.refill.duration_sec
                ));
            }
            if self.refill.relay_position == 0 || self.refill.relay_position > 16 {
                errors.push(format!(
                    "refill.relay_position {} out of range [1, 16]",
                    self.refill.relay_position
                ));
            }
            if !VALID_GPIO_PINS.contains(&self.refill.gpio_pin) {
                errors.push(format!(
                    "refill.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    self.refill.gpio_pin
                ));
            }
        }

        // ── Calibration ──────────────────────────────────────────
        let cal = &self.calibration;
        if cal.wet_point == cal.dry_point {
            errors.push(format!(
                "calibration wet_point and dry_point are both {} — saturation range is zero",
                cal.wet_point
            ));
        }

        // ── Reporting ────────────────────────────────────────────
        if self.reporting.enabled {
            if self.reporting.mqtt_host.trim().is_empty() {
                errors.push("reporting.mqtt_host is empty".to_string());
            }
            if self.reporting.mqtt_port == 0 {
                errors.push("reporting.mqtt_port must not be 0".to_string());
            }
        }
        if self.reporting.remote_commands && !self.reporting.enabled {
            errors.push("reporting.remote_commands requires reporting.enabled".to_string());
        }
    }

    fn validate_peripherals(&self, errors: &mut Vec<String>) {
        // Peripheral flags are booleans; nothing to range-check today, but
        // reporting peripheral data without reporting enabled is a config
        // smell worth flagging.
        if (self.peripherals.co2_enabled || self.peripherals.ph_enabled)
            && !self.reporting.enabled
        {
            tracing::warn!("peripherals enabled without reporting — values will only be logged");
        }
        let _ = errors;
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            device_id: "grow-1".into(),
            irrigation: Irrigation {
                soil_wet_threshold: ThresholdPolicy::Uniform(10.0),
                pump_when_dry: false,
                dose_duration_sec: 30.0,
                cycle_delay_sec: 5.0,
                channel_delay_sec: 2.0,
            },
            water_sensor: WaterSensor::default(),
            refill: Refill::default(),
            reporting: Reporting::default(),
            peripherals: Peripherals::default(),
            calibration: Calibration::default(),
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config() {
        let toml_str = r#"
device_id = "grow-1"

[irrigation]
soil_wet_threshold = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device_id, "grow-1");
        assert_eq!(
            config.irrigation.soil_wet_threshold,
            ThresholdPolicy::Uniform(10.0)
        );
        // Defaults
        assert_eq!(config.irrigation.dose_duration_sec, 30.0);
        assert_eq!(config.irrigation.cycle_delay_sec, 5.0);
        assert_eq!(config.irrigation.channel_delay_sec, 2.0);
        assert!(!config.irrigation.pump_when_dry);
        assert!(config.water_sensor.enabled);
        assert_eq!(config.water_sensor.gpio_pin, 21);
        assert!(!config.refill.enabled);
        assert!(!config.reporting.enabled);
        assert_eq!(config.calibration.wet_point, 0.7);
        assert_eq!(config.calibration.dry_point, 27.6);
    }

    #[test]
    fn parse_per_position_threshold_table() {
        let toml_str = r#"
device_id = "grow-1"

[irrigation]
soil_wet_threshold = [7, 7, 10, 8, 9, 12, 13, 10]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        match &config.irrigation.soil_wet_threshold {
            ThresholdPolicy::PerPosition(table) => assert_eq!(table.len(), 8),
            other => panic!("expected per-position table, got {other:?}"),
        }
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
device_id = "grow-1"

[irrigation]
soil_wet_threshold = 12
pump_when_dry = true
dose_duration_sec = 15.0
cycle_delay_sec = 10.0
channel_delay_sec = 1.0

[water_sensor]
enabled = true
gpio_pin = 22

[refill]
enabled = true
relay_position = 2
gpio_pin = 20
duration_sec = 45.0

[reporting]
enabled = true
mqtt_host = "192.168.1.10"
mqtt_port = 1883
remote_commands = true

[peripherals]
co2_enabled = true
ph_enabled = true

[calibration]
wet_point = 0.5
dry_point = 26.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert!(config.irrigation.pump_when_dry);
        assert!(config.refill.enabled);
        assert_eq!(config.refill.relay_position, 2);
        assert!(config.reporting.remote_commands);
        assert!(config.peripherals.co2_enabled);
    }

    // -- Threshold policy ---------------------------------------------------

    #[test]
    fn uniform_threshold_applies_to_all_positions() {
        let policy = ThresholdPolicy::Uniform(10.0);
        for position in 0..CHANNEL_COUNT {
            assert_eq!(policy.threshold_for(position), 10.0);
        }
    }

    #[test]
    fn per_position_threshold_indexes_by_position() {
        let policy =
            ThresholdPolicy::PerPosition(vec![7.0, 7.0, 10.0, 8.0, 9.0, 12.0, 13.0, 10.0]);
        assert_eq!(policy.threshold_for(0), 7.0);
        assert_eq!(policy.threshold_for(2), 10.0);
        assert_eq!(policy.threshold_for(7), 10.0);
    }

    #[test]
    fn threshold_table_wrong_length_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.soil_wet_threshold = ThresholdPolicy::PerPosition(vec![7.0, 8.0, 9.0]);
        assert_validation_err(&cfg, "has 3 entries, expected 8");
    }

    #[test]
    fn threshold_above_plausible_range_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.soil_wet_threshold = ThresholdPolicy::Uniform(29.0);
        assert_validation_err(&cfg, "out of range");
    }

    #[test]
    fn threshold_negative_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.soil_wet_threshold =
            ThresholdPolicy::PerPosition(vec![7.0, 7.0, -1.0, 8.0, 9.0, 12.0, 13.0, 10.0]);
        assert_validation_err(&cfg, "out of range");
    }

    // -- Identity / timing ----------------------------------------------------

    #[test]
    fn empty_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.device_id = "  ".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn zero_dose_duration_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.dose_duration_sec = 0.0;
        assert_validation_err(&cfg, "dose_duration_sec must be positive");
    }

    #[test]
    fn negative_cycle_delay_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.cycle_delay_sec = -1.0;
        assert_validation_err(&cfg, "cycle_delay_sec");
    }

    // -- GPIO / refill --------------------------------------------------------

    #[test]
    fn water_sensor_bad_pin_rejected() {
        let mut cfg = valid_config();
        cfg.water_sensor.gpio_pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn water_sensor_bad_pin_ignored_when_disabled() {
        let mut cfg = valid_config();
        cfg.water_sensor.enabled = false;
        cfg.water_sensor.gpio_pin = 0;
        cfg.validate().unwrap();
    }

    #[test]
    fn refill_zero_duration_rejected() {
        let mut cfg = valid_config();
        cfg.refill.enabled = true;
        cfg.refill.duration_sec = 0.0;
        assert_validation_err(&cfg, "refill.duration_sec must be positive");
    }

    #[test]
    fn refill_position_zero_rejected() {
        let mut cfg = valid_config();
        cfg.refill.enabled = true;
        cfg.refill.relay_position = 0;
        assert_validation_err(&cfg, "relay_position 0 out of range");
    }

    // -- Calibration / reporting ------------------------------------------------

    #[test]
    fn degenerate_calibration_rejected() {
        let mut cfg = valid_config();
        cfg.calibration.wet_point = 5.0;
        cfg.calibration.dry_point = 5.0;
        assert_validation_err(&cfg, "saturation range is zero");
    }

    #[test]
    fn reporting_empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.reporting.enabled = true;
        cfg.reporting.mqtt_host = "".into();
        assert_validation_err(&cfg, "mqtt_host is empty");
    }

    #[test]
    fn remote_commands_require_reporting() {
        let mut cfg = valid_config();
        cfg.reporting.remote_commands = true;
        assert_validation_err(&cfg, "remote_commands requires reporting.enabled");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.device_id = "".into();
        cfg.irrigation.dose_duration_sec = -1.0;
        cfg.irrigation.soil_wet_threshold = ThresholdPolicy::Uniform(100.0);
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("device_id is empty"), "missing id error: {msg}");
        assert!(
            msg.contains("dose_duration_sec"),
            "missing duration error: {msg}"
        );
        assert!(msg.contains("out of range"), "missing threshold error: {msg}");
    }
}
