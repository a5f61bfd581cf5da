//! In-memory backend for tests and dry runs. The paired handle lets a test
//! feed sensor values and observe relay states from outside the plant.

use super::{HwBackend, HwError};
use crate::measure::Temp;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

struct DummyState {
    temps: Vec<Temp>,
    relays: Vec<bool>,
    fail_input: bool,
    fail_relays: bool,
}

pub struct DummyBackend {
    state: Arc<Mutex<DummyState>>,
    snapshot: Vec<Temp>,
}

/// Test-side handle onto the backend state.
#[derive(Clone)]
pub struct DummyHandle {
    state: Arc<Mutex<DummyState>>,
}

impl DummyBackend {
    pub fn new(sensor_channels: usize, relay_channels: usize) -> (DummyBackend, DummyHandle) {
        let state = Arc::new(Mutex::new(DummyState {
            temps: vec![Temp::UNSET; sensor_channels],
            relays: vec![false; relay_channels],
            fail_input: false,
            fail_relays: false,
        }));
        let backend = DummyBackend {
            state: state.clone(),
            snapshot: vec![Temp::UNSET; sensor_channels],
        };
        (backend, DummyHandle { state })
    }
}

impl DummyHandle {
    pub fn set_temp(&self, channel: usize, value: Temp) {
        self.state.lock().unwrap().temps[channel] = value;
    }

    pub fn set_temp_c(&self, channel: usize, celsius: f64) {
        self.set_temp(channel, Temp::from_celsius(celsius));
    }

    pub fn relay_state(&self, channel: usize) -> bool {
        self.state.lock().unwrap().relays[channel]
    }

    /// Make every relay write fail until cleared.
    pub fn fail_relays(&self, fail: bool) {
        self.state.lock().unwrap().fail_relays = fail;
    }

    /// Make the bulk input cycle fail until cleared.
    pub fn fail_input(&self, fail: bool) {
        self.state.lock().unwrap().fail_input = fail;
    }
}

#[async_trait]
impl HwBackend for DummyBackend {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn online(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    async fn input(&mut self) -> Result<(), HwError> {
        let state = self.state.lock().unwrap();
        if state.fail_input {
            return Err(HwError::Hardware);
        }
        self.snapshot.clone_from(&state.temps);
        Ok(())
    }

    fn input_value(&self, channel: usize) -> Result<Temp, HwError> {
        match self.snapshot.get(channel) {
            Some(&Temp::SHORT) => Err(HwError::SensorShort),
            Some(&Temp::DISCON) => Err(HwError::SensorDiscon),
            Some(&value) => Ok(value),
            None => Err(HwError::NotConfigured),
        }
    }

    fn output_state_set(&mut self, channel: usize, on: bool) -> Result<(), HwError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_relays {
            return Err(HwError::Hardware);
        }
        match state.relays.get_mut(channel) {
            Some(slot) => {
                *slot = on;
                Ok(())
            }
            None => Err(HwError::NotConfigured),
        }
    }

    fn output_state_get(&self, channel: usize) -> Result<bool, HwError> {
        self.state
            .lock()
            .unwrap()
            .relays
            .get(channel)
            .copied()
            .ok_or(HwError::NotConfigured)
    }

    async fn output(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    async fn offline(&mut self) -> Result<(), HwError> {
        Ok(())
    }
}
