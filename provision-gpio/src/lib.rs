//! Concrete `ResetLine` binding for the reset pin (§4.8a, §6.3): pull-up
//! input read via `rppal`, polarity-corrected for active-low wiring.

use rppal::gpio::{Gpio, InputPin};
use tracing::info;

use provision_core::transport::ResetLine;

pub const DEFAULT_PIN: u8 = 18;

#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    #[error("failed to access GPIO chip: {0}")]
    ChipUnavailable(#[from] rppal::gpio::Error),
}

/// Owns a single pulled-up input pin, wired active-low: a grounded line
/// (button pressed) reads `Level::Low`.
pub struct RppalResetLine {
    pin: InputPin,
}

impl RppalResetLine {
    pub fn open(pin_number: u8) -> Result<Self, GpioError> {
        let gpio = Gpio::new()?;
        let pin = gpio.get(pin_number)?.into_input_pullup();
        info!(pin_number, "reset line GPIO opened");
        Ok(Self { pin })
    }
}

impl ResetLine for RppalResetLine {
    fn is_asserted(&self) -> bool {
        self.pin.is_low()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake used by higher-level tests that don't have real GPIO hardware.
    pub struct FakeResetLine {
        pub asserted: std::sync::atomic::AtomicBool,
    }

    impl ResetLine for FakeResetLine {
        fn is_asserted(&self) -> bool {
            self.asserted.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    #[test]
    fn fake_reset_line_reflects_atomic_flag() {
        let line = FakeResetLine { asserted: std::sync::atomic::AtomicBool::new(false) };
        assert!(!line.is_asserted());
        line.asserted.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(line.is_asserted());
    }
}
