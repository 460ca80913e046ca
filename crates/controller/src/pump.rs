//! Dosing pump driver over a PWM output capability.
//!
//! A dose is a blocking, uninterruptible physical action: it holds the
//! calling task for its full duration and does not re-check the
//! reservoir mid-pulse. Callers must confirm water presence first.

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use crate::hal::PwmOutput;

pub struct Pump {
    channel: u8,
    speed: f64,
    pwm: Box<dyn PwmOutput>,
}

impl Pump {
    pub fn new(channel: u8, pwm: Box<dyn PwmOutput>) -> Self {
        Self {
            channel,
            speed: 0.0,
            pwm,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Last accepted speed.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Set the pump speed (PWM duty cycle). Speeds outside [0.0, 1.0]
    /// are rejected without touching the hardware.
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&speed) {
            bail!("pump {}: speed {speed} out of range [0.0, 1.0]", self.channel);
        }
        self.pwm.set_duty(speed)?;
        self.speed = speed;
        Ok(())
    }

    /// Stop the pump. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        self.set_speed(0.0)
    }

    /// Pulse the pump at `speed` for `duration`, then stop. Holds the
    /// calling task for the full duration.
    pub async fn dose(&mut self, speed: f64, duration: Duration) -> Result<()> {
        self.set_speed(speed)?;
        info!(
            channel = self.channel,
            speed,
            duration_sec = duration.as_secs_f64(),
            "dosing pump"
        );
        sleep(duration).await;
        self.stop()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockPwm;

    fn pump() -> (Pump, MockPwm) {
        let pwm = MockPwm::default();
        (Pump::new(1, Box::new(pwm.clone())), pwm)
    }

    // -- set_speed ----------------------------------------------------------

    #[test]
    fn set_speed_writes_duty() {
        let (mut pump, pwm) = pump();
        pump.set_speed(0.5).unwrap();
        assert_eq!(pump.speed(), 0.5);
        assert_eq!(pwm.state().lock().unwrap().duty, 0.5);
    }

    #[test]
    fn set_speed_rejects_above_one() {
        let (mut pump, pwm) = pump();
        pump.set_speed(0.5).unwrap();
        assert!(pump.set_speed(1.5).is_err());
        // Prior speed unchanged, no hardware write issued.
        assert_eq!(pump.speed(), 0.5);
        assert_eq!(pwm.state().lock().unwrap().history, vec![0.5]);
    }

    #[test]
    fn set_speed_rejects_negative() {
        let (mut pump, pwm) = pump();
        assert!(pump.set_speed(-0.1).is_err());
        assert_eq!(pump.speed(), 0.0);
        assert!(pwm.state().lock().unwrap().history.is_empty());
    }

    #[test]
    fn set_speed_accepts_bounds() {
        let (mut pump, _pwm) = pump();
        pump.set_speed(0.0).unwrap();
        pump.set_speed(1.0).unwrap();
        assert_eq!(pump.speed(), 1.0);
    }

    // -- stop ------------------------------------------------------------------

    #[test]
    fn stop_is_idempotent() {
        let (mut pump, _pwm) = pump();
        pump.set_speed(1.0).unwrap();
        pump.stop().unwrap();
        assert_eq!(pump.speed(), 0.0);
        pump.stop().unwrap();
        assert_eq!(pump.speed(), 0.0);
    }

    // -- dose ---------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dose_pulses_then_stops() {
        let (mut pump, pwm) = pump();
        pump.dose(1.0, Duration::from_secs(30)).await.unwrap();
        assert_eq!(pump.speed(), 0.0);
        assert_eq!(pwm.state().lock().unwrap().history, vec![1.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn dose_rejects_invalid_speed_without_side_effects() {
        let (mut pump, pwm) = pump();
        assert!(pump.dose(2.0, Duration::from_secs(30)).await.is_err());
        assert!(pwm.state().lock().unwrap().history.is_empty());
    }
}
