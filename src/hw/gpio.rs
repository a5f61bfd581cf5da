//! Relay backend over sysfs GPIO. Relay boards are active-low: driving the
//! pin low energizes the relay, and pins are exported high so everything is
//! de-energized between daemon restarts.

use super::{HwBackend, HwError};
use crate::measure::Temp;
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;
use sysfs_gpio::{Direction, Pin};

pub struct GpioBackend {
    /// Channel index -> GPIO pin number.
    channels: Vec<u64>,
    pins: HashMap<usize, Pin>,
    staged: HashMap<usize, bool>,
}

impl GpioBackend {
    pub fn new(channels: Vec<u64>) -> Self {
        GpioBackend {
            channels,
            pins: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    fn setup_pin(pin_no: u64) -> Result<Pin, HwError> {
        debug!(target: "hw", "setting up pin {}", pin_no);
        let pin = Pin::new(pin_no);
        pin.export().map_err(|e| {
            warn!(target: "hw", "failed to export pin {}: {}", pin_no, e);
            HwError::Hardware
        })?;

        const MAX_ATTEMPTS: usize = 5;
        let mut attempt = 0;
        // Direction::High exports as output with the pin held high (relay off).
        while let Err(e) = pin.set_direction(Direction::High) {
            warn!(
                target: "hw",
                "failed to set direction of pin {} - attempt {}: {}",
                pin_no, attempt, e
            );
            if attempt >= MAX_ATTEMPTS {
                return Err(HwError::Hardware);
            }
            attempt += 1;
            sleep(Duration::from_millis(400));
        }
        Ok(pin)
    }
}

#[async_trait]
impl HwBackend for GpioBackend {
    fn name(&self) -> &str {
        "gpio"
    }

    async fn online(&mut self) -> Result<(), HwError> {
        for (channel, &pin_no) in self.channels.iter().enumerate() {
            let pin = Self::setup_pin(pin_no)?;
            self.pins.insert(channel, pin);
        }
        Ok(())
    }

    async fn input(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    fn input_value(&self, _channel: usize) -> Result<Temp, HwError> {
        Err(HwError::NotImplemented)
    }

    fn output_state_set(&mut self, channel: usize, on: bool) -> Result<(), HwError> {
        if channel >= self.channels.len() {
            return Err(HwError::NotConfigured);
        }
        self.staged.insert(channel, on);
        Ok(())
    }

    fn output_state_get(&self, channel: usize) -> Result<bool, HwError> {
        let pin = self.pins.get(&channel).ok_or(HwError::NotConfigured)?;
        match pin.get_value() {
            Ok(0) => Ok(true),
            Ok(_) => Ok(false),
            Err(e) => {
                warn!(target: "hw", "failed to read pin for channel {}: {}", channel, e);
                Err(HwError::Hardware)
            }
        }
    }

    async fn output(&mut self) -> Result<(), HwError> {
        for (&channel, &on) in &self.staged {
            let pin = self.pins.get(&channel).ok_or(HwError::Offline)?;
            let bit_value = if on { 0 } else { 1 };
            trace!(target: "hw", "channel {} -> {}", channel, if on { "on" } else { "off" });
            pin.set_value(bit_value).map_err(|e| {
                warn!(target: "hw", "failed to write pin for channel {}: {}", channel, e);
                HwError::Hardware
            })?;
        }
        self.staged.clear();
        Ok(())
    }

    async fn offline(&mut self) -> Result<(), HwError> {
        for pin in self.pins.values() {
            let _ = pin.set_value(1);
        }
        self.pins.clear();
        Ok(())
    }
}
