//! Optional auxiliary peripherals: environment sensor, pH probe, status
//! display. All are best-effort — a failed read degrades the report, it
//! never blocks irrigation.

use anyhow::Result;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnvReading {
    pub temp_c: f64,
    pub rh_pct: f64,
    pub co2_ppm: f64,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait EnvSensor: Send {
    fn read(&mut self) -> Result<EnvReading>;
}

pub trait PhProbe: Send {
    fn read_ph(&mut self) -> Result<f64>;
}

/// Somewhere to show a short status line. The real build drives a
/// character LCD; everywhere else the log is the display.
pub trait StatusDisplay: Send {
    fn show(&mut self, line1: &str, line2: &str);
}

// ---------------------------------------------------------------------------
// Log-backed display (always available)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&mut self, line1: &str, line2: &str) {
        tracing::debug!(line1, line2, "status display");
    }
}

// ---------------------------------------------------------------------------
// Simulated peripherals (development — no hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "sim")]
pub use self::sim::{SimEnvSensor, SimPhProbe};

#[cfg(feature = "sim")]
mod sim {
    use super::{EnvReading, EnvSensor, PhProbe};
    use anyhow::Result;

    /// Plausible greenhouse air: low-noise jitter around fixed means.
    pub struct SimEnvSensor;

    impl EnvSensor for SimEnvSensor {
        fn read(&mut self) -> Result<EnvReading> {
            Ok(EnvReading {
                temp_c: 23.0 + 2.0 * (fastrand::f64() - 0.5),
                rh_pct: 55.0 + 6.0 * (fastrand::f64() - 0.5),
                co2_ppm: 800.0 + 120.0 * (fastrand::f64() - 0.5),
            })
        }
    }

    /// Nutrient solution pH hovering around 6.
    pub struct SimPhProbe;

    impl PhProbe for SimPhProbe {
        fn read_ph(&mut self) -> Result<f64> {
            Ok(6.0 + 0.4 * (fastrand::f64() - 0.5))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
