//! Building thermal model: a first-order low-pass over the outdoor sensor.
//! The filtered "mixed" outdoor temperature is what the water laws consume,
//! so a sunny hour does not collapse the heating of a heavy building.

use crate::error::ControlError;
use crate::hw::{Hardware, InputId};
use crate::measure::filter::ema;
use crate::measure::{Temp, Ticks};
use crate::plant::{EntityState, TickCtx};
use log::{info, warn};

/// Index into the plant's model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(pub usize);

#[derive(Debug)]
pub struct BuildingModel {
    name: String,
    outdoor: InputId,
    /// Thermal time constant in seconds.
    tau: u64,
    state: EntityState,
    t_outdoor: Temp,
    t_mixed: Temp,
    last_update: Option<Ticks>,
}

impl BuildingModel {
    pub fn new(name: String, outdoor: InputId, tau: u64) -> BuildingModel {
        BuildingModel {
            name,
            outdoor,
            tau,
            state: EntityState::Configured,
            t_outdoor: Temp::UNSET,
            t_mixed: Temp::UNSET,
            last_update: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online(&mut self, hw: &Hardware) -> Result<(), ControlError> {
        hw.input_time(self.outdoor)?;
        self.state = EntityState::Online;
        info!(target: "bmodel", "\"{}\" online, tau {}s", self.name, self.tau);
        Ok(())
    }

    pub fn offline(&mut self) {
        self.state = EntityState::Offline;
        self.last_update = None;
    }

    /// Instantaneous outdoor reading from the last good sample.
    pub fn outdoor(&self) -> Temp {
        self.t_outdoor
    }

    /// Low-passed outdoor temperature. Frozen at its last good value while
    /// the sensor is unusable, which is this model's declared fallback.
    pub fn mixed(&self) -> Temp {
        self.t_mixed
    }

    pub fn run(&mut self, ctx: &TickCtx) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }
        let value = match ctx.hw.input_value(self.outdoor, ctx.now) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target: "bmodel",
                    "\"{}\" outdoor sensor unusable ({}), holding mixed temp at {}",
                    self.name, err, self.t_mixed
                );
                ctx.alarms
                    .raise(&self.name, format!("outdoor sensor: {}", err));
                return Err(err);
            }
        };

        self.t_outdoor = value;
        match self.last_update {
            None => {
                // First good sample primes the filter.
                self.t_mixed = value;
            }
            Some(last) => {
                let dt = ctx.now.since(last);
                self.t_mixed = ema(self.t_mixed, value, dt, self.tau);
            }
        }
        self.last_update = Some(ctx.now);
        Ok(())
    }

    /// Test hook: preload the filter state.
    #[cfg(test)]
    pub fn prime(&mut self, mixed: Temp, now: Ticks) {
        self.t_outdoor = mixed;
        self.t_mixed = mixed;
        self.last_update = Some(now);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm;
    use crate::hw::dummy::{DummyBackend, DummyHandle};

    fn fixture(tau: u64) -> (Hardware, DummyHandle, BuildingModel) {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(1, 0);
        let b = hw.add_backend(Box::new(backend));
        let outdoor = hw.declare_input("outdoor", b, 0).unwrap();
        let mut model = BuildingModel::new("house".to_owned(), outdoor, tau);
        model.online(&hw).unwrap();
        (hw, handle, model)
    }

    #[tokio::test]
    async fn test_first_sample_primes_filter() {
        let (mut hw, handle, mut model) = fixture(86400);
        let (alarms, _rx) = alarm::channel();
        handle.set_temp_c(0, -5.0);
        hw.input(Ticks::from_secs(1)).await;
        model
            .run(&TickCtx {
                hw: &hw,
                alarms: &alarms,
                now: Ticks::from_secs(1),
            })
            .unwrap();
        assert_eq!(model.mixed(), Temp::from_celsius(-5.0));
        assert_eq!(model.outdoor(), Temp::from_celsius(-5.0));
    }

    #[tokio::test]
    async fn test_mixed_lags_outdoor() {
        let (mut hw, handle, mut model) = fixture(3600);
        let (alarms, _rx) = alarm::channel();

        handle.set_temp_c(0, 0.0);
        hw.input(Ticks::from_secs(0)).await;
        model
            .run(&TickCtx {
                hw: &hw,
                alarms: &alarms,
                now: Ticks::from_secs(0),
            })
            .unwrap();

        // Outdoor jumps 10K; after one tau the filter has only covered half.
        handle.set_temp_c(0, 10.0);
        hw.input(Ticks::from_secs(3600)).await;
        model
            .run(&TickCtx {
                hw: &hw,
                alarms: &alarms,
                now: Ticks::from_secs(3600),
            })
            .unwrap();

        assert_eq!(model.outdoor(), Temp::from_celsius(10.0));
        assert_eq!(model.mixed(), Temp::from_celsius(5.0));
    }

    #[tokio::test]
    async fn test_sensor_failure_freezes_mixed() {
        let (mut hw, handle, mut model) = fixture(3600);
        let (alarms, mut rx) = alarm::channel();

        handle.set_temp_c(0, 2.0);
        hw.input(Ticks::from_secs(0)).await;
        model
            .run(&TickCtx {
                hw: &hw,
                alarms: &alarms,
                now: Ticks::from_secs(0),
            })
            .unwrap();

        handle.set_temp(0, Temp::DISCON);
        hw.input(Ticks::from_secs(10)).await;
        let err = model
            .run(&TickCtx {
                hw: &hw,
                alarms: &alarms,
                now: Ticks::from_secs(10),
            })
            .unwrap_err();
        assert_eq!(err, ControlError::SensorDiscon);
        assert_eq!(model.mixed(), Temp::from_celsius(2.0));
        assert_eq!(rx.drain().len(), 1);
    }
}
