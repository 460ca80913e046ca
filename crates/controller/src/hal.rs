//! Hardware capability traits and their implementations.
//!
//! The core never touches a concrete device: pumps want a [`PwmOutput`],
//! the water gate a [`DigitalInput`], the refill shot a [`RelayOutput`],
//! and moisture probes a [`PulseInput`] that delivers rising edges. The
//! `gpio` feature gates the real rppal drivers; mock implementations are
//! always compiled for tests and sim builds.

use anyhow::Result;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait PwmOutput: Send {
    /// Set the duty cycle as a fraction of full scale (0.0..=1.0).
    fn set_duty(&mut self, fraction: f64) -> Result<()>;
}

pub trait DigitalInput: Send {
    /// Read the raw pin level. `true` means electrically high.
    fn read_high(&mut self) -> Result<bool>;
}

pub trait RelayOutput: Send {
    fn set(&mut self, on: bool) -> Result<()>;
}

pub trait PulseInput: Send {
    /// Register a callback invoked on every rising edge of the input.
    /// The callback runs in interrupt/poller context and must be O(1).
    fn on_rising_edge(&mut self, callback: Box<dyn FnMut() + Send>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Mock implementations (development and tests — no hardware)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MockPwmState {
    pub duty: f64,
    /// Every accepted duty write, in order.
    pub history: Vec<f64>,
}

/// Mock PWM output. Clones share state so tests can hold an inspection
/// handle while the pump owns the boxed trait object.
#[derive(Clone, Default)]
pub struct MockPwm {
    state: Arc<Mutex<MockPwmState>>,
}

impl MockPwm {
    pub fn state(&self) -> Arc<Mutex<MockPwmState>> {
        Arc::clone(&self.state)
    }
}

impl PwmOutput for MockPwm {
    fn set_duty(&mut self, fraction: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.duty = fraction;
        state.history.push(fraction);
        Ok(())
    }
}

/// Mock digital input that replays a scripted sequence of levels, then
/// holds the last one. An empty script holds `initial` forever.
pub struct MockDigitalInput {
    levels: Vec<bool>,
    next: usize,
    initial: bool,
    fail: bool,
}

impl MockDigitalInput {
    /// Input pinned at one level.
    pub fn held(level: bool) -> Self {
        Self {
            levels: Vec::new(),
            next: 0,
            initial: level,
            fail: false,
        }
    }

    /// Input replaying `levels` in order, holding the last afterwards.
    pub fn sequence(levels: Vec<bool>) -> Self {
        Self {
            levels,
            next: 0,
            initial: false,
            fail: false,
        }
    }

    /// Input whose every read fails, for fault-path tests.
    pub fn failing() -> Self {
        Self {
            levels: Vec::new(),
            next: 0,
            initial: false,
            fail: true,
        }
    }
}

impl DigitalInput for MockDigitalInput {
    fn read_high(&mut self) -> Result<bool> {
        if self.fail {
            anyhow::bail!("mock digital input read failure");
        }
        if self.levels.is_empty() {
            return Ok(self.initial);
        }
        let level = self.levels[self.next.min(self.levels.len() - 1)];
        if self.next < self.levels.len() {
            self.next += 1;
        }
        Ok(level)
    }
}

/// Mock relay. Clones share state for test inspection.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<Vec<bool>>>,
}

impl MockRelay {
    /// Every `set` call, in order.
    pub fn history(&self) -> Arc<Mutex<Vec<bool>>> {
        Arc::clone(&self.state)
    }
}

impl RelayOutput for MockRelay {
    fn set(&mut self, on: bool) -> Result<()> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).push(on);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real GPIO implementations (production — requires rppal + Raspberry Pi)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use self::gpio::{GpioDigitalInput, GpioPulseInput, GpioPwm, GpioRelay};

#[cfg(feature = "gpio")]
mod gpio {
    use super::{DigitalInput, PulseInput, PwmOutput, RelayOutput};
    use anyhow::{Context, Result};
    use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

    /// Pump PWM carrier frequency.
    const PUMP_PWM_FREQ_HZ: f64 = 10_000.0;

    /// BCM pins for pump channels 1..=8, in channel order.
    pub const PUMP_PINS: [u8; 8] = [2, 3, 4, 5, 6, 7, 8, 9];
    /// BCM pins for moisture probe channels 1..=8, in channel order.
    pub const MOISTURE_PINS: [u8; 8] = [10, 11, 12, 13, 14, 15, 17, 16];

    pub struct GpioPwm {
        pin: OutputPin,
    }

    impl GpioPwm {
        pub fn new(channel: u8) -> Result<Self> {
            let pin_num = PUMP_PINS[channel as usize - 1];
            let mut pin = Gpio::new()?
                .get(pin_num)
                .with_context(|| format!("failed to claim pump GPIO {pin_num}"))?
                .into_output();
            pin.set_low(); // fail-safe: pump off at startup
            Ok(Self { pin })
        }
    }

    impl PwmOutput for GpioPwm {
        fn set_duty(&mut self, fraction: f64) -> Result<()> {
            if fraction <= 0.0 {
                self.pin.clear_pwm()?;
                self.pin.set_low();
            } else {
                self.pin.set_pwm_frequency(PUMP_PWM_FREQ_HZ, fraction)?;
            }
            Ok(())
        }
    }

    pub struct GpioDigitalInput {
        pin: InputPin,
    }

    impl GpioDigitalInput {
        pub fn new(pin_num: u8) -> Result<Self> {
            let pin = Gpio::new()?
                .get(pin_num)
                .with_context(|| format!("failed to claim input GPIO {pin_num}"))?
                .into_input_pulldown();
            Ok(Self { pin })
        }
    }

    impl DigitalInput for GpioDigitalInput {
        fn read_high(&mut self) -> Result<bool> {
            Ok(self.pin.is_high())
        }
    }

    pub struct GpioRelay {
        pin: OutputPin,
        active_low: bool, // many relay boards are active-low
    }

    impl GpioRelay {
        pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
            let mut pin = Gpio::new()?
                .get(pin_num)
                .with_context(|| format!("failed to claim relay GPIO {pin_num}"))?
                .into_output();
            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            Ok(Self { pin, active_low })
        }
    }

    impl RelayOutput for GpioRelay {
        fn set(&mut self, on: bool) -> Result<()> {
            if on != self.active_low {
                self.pin.set_high();
            } else {
                self.pin.set_low();
            }
            Ok(())
        }
    }

    pub struct GpioPulseInput {
        pin: InputPin,
    }

    impl GpioPulseInput {
        /// Claim the probe pin for `channel` (1..=8). The returned value
        /// must stay alive for the program's lifetime — dropping it
        /// detaches the interrupt.
        pub fn new(channel: u8) -> Result<Self> {
            let pin_num = MOISTURE_PINS[channel as usize - 1];
            let pin = Gpio::new()?
                .get(pin_num)
                .with_context(|| format!("failed to claim probe GPIO {pin_num}"))?
                .into_input_pullup();
            Ok(Self { pin })
        }
    }

    impl PulseInput for GpioPulseInput {
        fn on_rising_edge(&mut self, mut callback: Box<dyn FnMut() + Send>) -> Result<()> {
            self.pin
                .set_async_interrupt(Trigger::RisingEdge, move |_level| callback())
                .context("failed to register edge interrupt")?;
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
