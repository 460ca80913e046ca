//! Stateful moisture probe simulator for local development.
//!
//! Models realistic capacitive probe behaviour in the pulse-frequency
//! domain (dry soil oscillates fast, saturated soil slow):
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-sample electronic jitter
//! - Occasional spikes (probe flakiness)
//! - Per-channel calibration offsets
//! - Closed-loop dosing response (frequency drops while a pump runs)

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::moisture::MoistureSensor;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry. Moderate jitter. The
    /// realistic steady-state for a warm day.
    Drying,
    /// Hovers near the centre. Low jitter, rare spikes. Good for watching
    /// the report stream without triggering doses.
    Stable,
    /// High jitter, ~10% spike rate, larger spike magnitude. Exercises
    /// averaging and clamping robustness.
    Flaky,
    /// Starts near the wet end, very slow drying. Checks that the
    /// scheduler correctly does nothing when moisture is adequate.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct ChannelState {
    /// Current "true" pulse frequency in Hz. Evolves each tick.
    base: f64,
    /// Permanent per-channel calibration offset (Hz). Two probes in the
    /// same soil never read identically.
    offset: f64,
    /// Per-channel jitter sigma (Hz).
    noise_sigma: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing realistic probe pulse frequencies.
pub struct SoilPulseSim {
    channels: Vec<ChannelState>,

    // Calibration endpoints (pulses/sec)
    wet_hz: f64,
    dry_hz: f64,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    // Spike parameters
    spike_prob: f32,
    spike_sigma: f64,

    // Dosing response: which channel is being watered, if any
    watering: Option<usize>,
    wet_rate: f64,
}

impl SoilPulseSim {
    /// Create a new simulator for `channel_count` probes.
    ///
    /// `wet_hz` / `dry_hz` should match the calibration in `config.toml`
    /// (typically 0.7 / 27.6).
    pub fn new(scenario: Scenario, channel_count: usize, wet_hz: f64, dry_hz: f64) -> Self {
        let range = dry_hz - wet_hz; // typically ~27
        let center = (dry_hz + wet_hz) / 2.0;

        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start_frac) =
            match scenario {
                // start_frac: 0.0 = at wet_hz (wettest), 1.0 = at dry_hz (driest)
                Scenario::Drying => (0.03, 0.3, 0.02, 0.15, 0.03_f32, 4.0, 0.5),
                Scenario::Stable => (0.005, 0.1, 0.05, 0.08, 0.005, 2.0, 0.5),
                Scenario::Flaky => (0.02, 0.5, 0.02, 0.4, 0.10, 6.0, 0.5),
                Scenario::Wet => (0.007, 0.15, 0.02, 0.1, 0.02, 3.0, 0.15),
            };

        let start_base = wet_hz + start_frac * range;

        // Per-channel: randomise initial base slightly and assign a
        // permanent calibration offset so probes diverge naturally.
        let channels = (0..channel_count)
            .map(|_| {
                let jitter = gaussian(0.0, range * 0.03);
                let offset = gaussian(0.0, range * 0.02);
                let channel_noise = noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3);
                ChannelState {
                    base: (start_base + jitter).clamp(wet_hz, dry_hz),
                    offset,
                    noise_sigma: channel_noise,
                }
            })
            .collect();

        Self {
            channels,
            wet_hz,
            dry_hz,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center,
            spike_prob,
            spike_sigma,
            watering: None,
            wet_rate: -0.6,
        }
    }

    /// Inform the simulator which channel (0-based) is currently being
    /// dosed, or `None` when all pumps are off.
    pub fn set_watering(&mut self, channel: Option<usize>) {
        self.watering = channel;
    }

    /// Produce the next pulse frequency for the probe at `index`.
    ///
    /// Call this once per channel per tick. The internal base evolves
    /// with each call, so the order and frequency of calls matters.
    pub fn sample(&mut self, index: usize) -> f64 {
        let channel = &mut self.channels[index];

        // -- Evolve the base value ----------------------------------------

        // Mean reversion: pull toward centre
        let pull = self.mean_reversion * (self.center - channel.base);

        // Random walk step
        let walk = gaussian(0.0, self.walk_sigma);

        // Drying drift (positive = toward dry_hz = faster oscillation)
        let drift = self.drift_per_sample;

        // Dosing effect (negative = toward wet_hz = slower)
        let wet = if self.watering == Some(index) {
            self.wet_rate
        } else {
            0.0
        };

        channel.base = (channel.base + drift + pull + walk + wet)
            .clamp(self.wet_hz - 0.5, self.dry_hz + 0.5);

        // -- Build the instantaneous reading ------------------------------

        // Electronic jitter
        let noise = gaussian(0.0, channel.noise_sigma);

        // Occasional spike (probe flakiness)
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = channel.base + channel.offset + noise + spike;

        // Clamp to a physically possible frequency. A stuck-low probe
        // reads near zero, never negative.
        reading.max(0.05)
    }

    /// Number of probe channels in this simulator.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// Edge driver
// ---------------------------------------------------------------------------

/// Spawn one task per channel that feeds rising edges into the matching
/// sensor at the simulator's current frequency, as a hardware interrupt
/// would.
pub fn drive(sim: Arc<Mutex<SoilPulseSim>>, sensors: Vec<Arc<MoistureSensor>>) {
    for (index, sensor) in sensors.into_iter().enumerate() {
        let sim = Arc::clone(&sim);
        tokio::spawn(async move {
            loop {
                let hz = {
                    let mut sim = sim.lock().unwrap_or_else(|p| p.into_inner());
                    sim.sample(index)
                };
                sensor.on_edge();
                tokio::time::sleep(Duration::from_secs_f64(1.0 / hz)).await;
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
