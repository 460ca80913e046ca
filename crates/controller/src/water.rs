//! Reservoir water presence with statistical debounce.
//!
//! The level sensor is active-low: a low level means water is present.
//! A single sample can be fooled by a float or a bubble, so presence is
//! only confirmed by three agreeing samples half a second apart. A dry
//! sample short-circuits immediately — the failure case resolves fast,
//! the success case takes the full confirmation window.

use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

use crate::hal::DigitalInput;

const SAMPLES: u32 = 3;
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

pub struct WaterLevelGate {
    input: Box<dyn DigitalInput>,
}

impl WaterLevelGate {
    pub fn new(input: Box<dyn DigitalInput>) -> Self {
        Self { input }
    }

    /// Debounced presence verdict. Returns `false` on the first dry
    /// sample; `true` only after all samples agree.
    pub async fn has_water(&mut self) -> Result<bool> {
        for _ in 0..SAMPLES {
            let water_present = !self.input.read_high()?; // active-low
            if !water_present {
                return Ok(false);
            }
            sleep(SAMPLE_INTERVAL).await;
        }
        Ok(true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockDigitalInput;
    use tokio::time::Instant;

    fn gate(input: MockDigitalInput) -> WaterLevelGate {
        WaterLevelGate::new(Box::new(input))
    }

    #[tokio::test(start_paused = true)]
    async fn water_present_when_all_samples_agree() {
        // Active-low: held low = water present.
        let mut gate = gate(MockDigitalInput::held(false));
        assert!(gate.has_water().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn no_water_short_circuits_immediately() {
        let mut gate = gate(MockDigitalInput::held(true));
        let start = Instant::now();
        assert!(!gate.has_water().await.unwrap());
        // First sample already settles it — no debounce wait at all.
        assert!(Instant::now() - start < SAMPLE_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_water_rejected_on_second_sample() {
        // Water on the first sample, gone on the second.
        let mut gate = gate(MockDigitalInput::sequence(vec![false, true]));
        let start = Instant::now();
        assert!(!gate.has_water().await.unwrap());
        let elapsed = Instant::now() - start;
        assert!(elapsed >= SAMPLE_INTERVAL);
        assert!(elapsed < 2 * SAMPLE_INTERVAL + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_takes_full_window() {
        let mut gate = gate(MockDigitalInput::held(false));
        let start = Instant::now();
        assert!(gate.has_water().await.unwrap());
        assert!(Instant::now() - start >= 3 * SAMPLE_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_propagates() {
        let mut gate = gate(MockDigitalInput::failing());
        assert!(gate.has_water().await.is_err());
    }
}
