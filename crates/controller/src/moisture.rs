//! Interrupt-driven soil moisture sensor.
//!
//! The probe emits a pulse train whose frequency is inversely
//! proportional to moisture content: under 1 pulse/sec fully submerged,
//! near 28 pulses/sec in dry air. Every rising edge calls
//! [`MoistureSensor::on_edge`]; once at least [`WINDOW_SECS`] of window
//! time has elapsed the accumulated count is closed out into a
//! pulses/sec reading. Using frequency directly as the comparand lets
//! the threshold policy treat "reading >= threshold" as "too dry".
//!
//! `on_edge` may fire from interrupt context at any time, including while
//! the scheduler is reading. The pulse counter and timestamps are
//! atomics; the mutex is taken only for the window close-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Default fully-wet calibration point in pulses/sec.
pub const DEFAULT_WET_POINT: f64 = 0.7;
/// Default fully-dry calibration point in pulses/sec.
pub const DEFAULT_DRY_POINT: f64 = 27.6;

/// Minimum window length before a reading is closed out.
const WINDOW_SECS: f64 = 3.0;
/// Readings retained for `history()`, newest first.
const HISTORY_LENGTH: usize = 200;
/// A probe is considered live if a pulse arrived this recently.
const PULSE_LIVENESS_SECS: f64 = 1.0;
/// Plausible pulses/sec ceiling for a healthy probe reading.
const MAX_PLAUSIBLE_READING: f64 = 28.0;

/// Sentinel for "no pulse observed yet".
const NEVER: u64 = u64::MAX;

struct Inner {
    /// Most recent closed-out reading, pulses/sec.
    reading: f64,
    /// Raw readings, newest first, at most [`HISTORY_LENGTH`].
    history: VecDeque<f64>,
    wet_point: f64,
    dry_point: f64,
}

pub struct MoistureSensor {
    channel: u8,
    /// Reference instant; all atomic timestamps are offsets from it.
    epoch: Instant,
    pulse_count: AtomicU32,
    last_pulse_us: AtomicU64,
    window_start_us: AtomicU64,
    new_data: AtomicBool,
    inner: Mutex<Inner>,
}

impl MoistureSensor {
    /// Create a sensor bound to a hardware channel (1..=8). `None`
    /// calibration points fall back to the stock probe values.
    pub fn new(channel: u8, wet_point: Option<f64>, dry_point: Option<f64>) -> Self {
        Self {
            channel,
            epoch: Instant::now(),
            pulse_count: AtomicU32::new(0),
            last_pulse_us: AtomicU64::new(NEVER),
            window_start_us: AtomicU64::new(0),
            new_data: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                reading: 0.0,
                history: VecDeque::with_capacity(HISTORY_LENGTH),
                wet_point: wet_point.unwrap_or(DEFAULT_WET_POINT),
                dry_point: dry_point.unwrap_or(DEFAULT_DRY_POINT),
            }),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Interrupt handler: count one rising edge and close out the
    /// window if enough time has passed.
    pub fn on_edge(&self) {
        self.edge_at(Instant::now());
    }

    pub(crate) fn edge_at(&self, now: Instant) {
        let now_us = self.offset_us(now);
        self.pulse_count.fetch_add(1, Ordering::AcqRel);
        self.last_pulse_us.store(now_us, Ordering::Release);

        let start_us = self.window_start_us.load(Ordering::Acquire);
        let elapsed = now_us.saturating_sub(start_us) as f64 / 1_000_000.0;
        if elapsed >= WINDOW_SECS {
            // Single swap so edges racing with the close-out land in the
            // next window instead of being lost.
            let count = self.pulse_count.swap(0, Ordering::AcqRel);
            let reading = f64::from(count) / elapsed;

            let mut inner = self.lock();
            inner.reading = reading;
            inner.history.push_front(reading);
            inner.history.truncate(HISTORY_LENGTH);
            drop(inner);

            self.window_start_us.store(now_us, Ordering::Release);
            self.new_data.store(true, Ordering::Release);
        }
    }

    /// Current reading in pulses/sec. Clears the new-data flag.
    pub fn moisture(&self) -> f64 {
        self.new_data.store(false, Ordering::Release);
        self.lock().reading
    }

    /// Normalized saturation in [0.0, 1.0], derived from the calibration
    /// points and rounded to 3 decimal places. Clears the new-data flag.
    pub fn saturation(&self) -> f64 {
        self.new_data.store(false, Ordering::Release);
        let inner = self.lock();
        saturate(inner.reading, inner.wet_point, inner.dry_point)
    }

    /// Saturation values for every buffered reading, newest first.
    pub fn history(&self) -> Vec<f64> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .map(|&reading| saturate(reading, inner.wet_point, inner.dry_point))
            .collect()
    }

    /// Recalibrate the wet point. `None` captures the most recent raw
    /// reading, for field calibration with a freshly watered probe.
    pub fn set_wet_point(&self, value: Option<f64>) {
        let mut inner = self.lock();
        inner.wet_point = value.unwrap_or(inner.reading);
    }

    /// Recalibrate the dry point. `None` captures the most recent raw
    /// reading, for field calibration with a dry probe.
    pub fn set_dry_point(&self, value: Option<f64>) {
        let mut inner = self.lock();
        inner.dry_point = value.unwrap_or(inner.reading);
    }

    /// Self-health check: a pulse arrived within the last second and the
    /// reading is within the probe's plausible range. A disconnected
    /// probe reports inactive rather than erroring.
    pub fn active(&self) -> bool {
        self.active_at(Instant::now())
    }

    pub(crate) fn active_at(&self, now: Instant) -> bool {
        let last = self.last_pulse_us.load(Ordering::Acquire);
        if last == NEVER {
            return false;
        }
        let age = self.offset_us(now).saturating_sub(last) as f64 / 1_000_000.0;
        let reading = self.lock().reading;
        age < PULSE_LIVENESS_SECS && (0.0..=MAX_PLAUSIBLE_READING).contains(&reading)
    }

    /// True if the reading has been updated since the last call to
    /// `moisture()` or `saturation()`.
    pub fn new_data(&self) -> bool {
        self.new_data.load(Ordering::Acquire)
    }

    fn offset_us(&self, now: Instant) -> u64 {
        now.checked_duration_since(self.epoch)
            .unwrap_or_default()
            .as_micros() as u64
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding this lock leaves only plain data behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn set_reading(&self, reading: f64) {
        self.lock().reading = reading;
    }
}

/// Convert a raw pulses/sec reading to a saturation fraction using the
/// calibration endpoints. Degenerate calibration (wet == dry) yields 0.0
/// rather than dividing by zero.
fn saturate(reading: f64, wet_point: f64, dry_point: f64) -> f64 {
    let range = wet_point - dry_point;
    if range == 0.0 {
        return 0.0;
    }
    let saturation = (reading - dry_point) / range;
    round3(saturation).clamp(0.0, 1.0)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sensor() -> MoistureSensor {
        MoistureSensor::new(1, None, None)
    }

    /// Emit `count` evenly spaced edges over `secs` seconds starting at
    /// `base`, ending with one edge that closes the window.
    fn pulse_train(s: &MoistureSensor, base: Instant, count: u32, secs: f64) {
        for i in 1..=count {
            let t = base + Duration::from_secs_f64(secs * f64::from(i) / f64::from(count));
            s.edge_at(t);
        }
    }

    // -- Window close-out ---------------------------------------------------

    #[test]
    fn window_closes_after_three_seconds() {
        let s = sensor();
        let base = Instant::now();
        // 30 edges over exactly 3 s: last edge closes the window.
        pulse_train(&s, base, 30, 3.0);
        assert!(s.new_data());
        let reading = s.moisture();
        assert!((reading - 10.0).abs() < 1e-3, "reading = {reading}");
    }

    #[test]
    fn no_reading_before_window_elapses() {
        let s = sensor();
        let base = Instant::now();
        pulse_train(&s, base, 10, 2.0); // only 2 s elapsed
        assert!(!s.new_data());
        assert_eq!(s.moisture(), 0.0);
    }

    #[test]
    fn counter_resets_between_windows() {
        let s = sensor();
        let base = Instant::now();
        pulse_train(&s, base, 30, 3.0); // closes at 10 pulses/sec
        // Next window: 15 edges over the following 3 s.
        for i in 1..=15 {
            let t = base + Duration::from_secs_f64(3.0 + 3.0 * f64::from(i) / 15.0);
            s.edge_at(t);
        }
        let reading = s.moisture();
        assert!((reading - 5.0).abs() < 1e-3, "reading = {reading}");
    }

    #[test]
    fn moisture_clears_new_data_flag() {
        let s = sensor();
        pulse_train(&s, Instant::now(), 30, 3.0);
        assert!(s.new_data());
        s.moisture();
        assert!(!s.new_data());
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let s = sensor();
        let base = Instant::now();
        // Close 205 windows, one edge each, 3 s apart.
        for i in 1..=205u32 {
            s.edge_at(base + Duration::from_secs_f64(3.0 * f64::from(i)));
        }
        let history = s.history();
        assert_eq!(history.len(), 200);
    }

    #[test]
    fn history_applies_saturation_formula() {
        let s = sensor();
        let base = Instant::now();
        // One window of 138 pulses closed at 5 s = 27.6 pulses/sec = dry
        // point. The first 137 edges land inside the window so only the
        // final edge closes it.
        for i in 1..=137u32 {
            s.edge_at(base + Duration::from_secs_f64(2.9 * f64::from(i) / 137.0));
        }
        s.edge_at(base + Duration::from_secs_f64(5.0));
        let history = s.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0], 0.0); // fully dry
    }

    // -- Saturation arithmetic ------------------------------------------------

    #[test]
    fn saturation_at_dry_point_is_zero() {
        let s = sensor();
        s.set_reading(27.6);
        assert_eq!(s.saturation(), 0.0);
    }

    #[test]
    fn saturation_at_wet_point_is_one() {
        let s = sensor();
        s.set_reading(0.7);
        assert_eq!(s.saturation(), 1.0);
    }

    #[test]
    fn saturation_at_midpoint_is_half() {
        let s = sensor();
        s.set_reading(14.15);
        assert_eq!(s.saturation(), 0.5);
    }

    #[test]
    fn saturation_clamped_for_extreme_readings() {
        let s = sensor();
        s.set_reading(1000.0);
        assert_eq!(s.saturation(), 0.0);
        s.set_reading(-5.0);
        assert_eq!(s.saturation(), 1.0);
    }

    #[test]
    fn saturation_always_in_unit_interval() {
        let s = MoistureSensor::new(2, Some(3.0), Some(25.0));
        for reading in [-100.0, 0.0, 3.0, 12.0, 25.0, 400.0, 900.0] {
            s.set_reading(reading);
            let sat = s.saturation();
            assert!((0.0..=1.0).contains(&sat), "reading {reading} -> {sat}");
        }
    }

    #[test]
    fn degenerate_calibration_yields_zero() {
        let s = MoistureSensor::new(3, Some(5.0), Some(5.0));
        s.set_reading(10.0);
        assert_eq!(s.saturation(), 0.0);
    }

    #[test]
    fn saturation_rounds_to_three_decimals() {
        let s = sensor();
        // (26.0 - 27.6) / (0.7 - 27.6) = 0.059479... -> 0.059
        s.set_reading(26.0);
        assert_eq!(s.saturation(), 0.059);
    }

    // -- Calibration -----------------------------------------------------------

    #[test]
    fn set_wet_point_with_value() {
        let s = sensor();
        s.set_wet_point(Some(1.2));
        s.set_reading(1.2);
        assert_eq!(s.saturation(), 1.0);
    }

    #[test]
    fn set_points_capture_live_reading() {
        let s = sensor();
        s.set_reading(2.0);
        s.set_wet_point(None); // wet point becomes 2.0
        s.set_reading(20.0);
        s.set_dry_point(None); // dry point becomes 20.0
        s.set_reading(11.0); // midpoint of [2, 20]
        assert_eq!(s.saturation(), 0.5);
    }

    // -- Liveness ----------------------------------------------------------------

    #[test]
    fn inactive_before_any_pulse() {
        assert!(!sensor().active());
    }

    #[test]
    fn active_right_after_pulse() {
        let s = sensor();
        let now = Instant::now();
        s.edge_at(now);
        assert!(s.active_at(now));
    }

    #[test]
    fn inactive_after_pulses_stop() {
        let s = sensor();
        let now = Instant::now();
        s.edge_at(now);
        assert!(!s.active_at(now + Duration::from_secs(2)));
    }

    #[test]
    fn inactive_when_reading_exceeds_plausible_range() {
        let s = sensor();
        let now = Instant::now();
        s.edge_at(now);
        s.set_reading(30.0); // beyond the plausible 28 pulses/sec
        assert!(!s.active_at(now));
    }
}
