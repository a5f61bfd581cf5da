//! Heating circuit: computes the feed water temperature its emitters need
//! from the building model and the water law, asks the heatsources for it,
//! and drives its own mixing valve and feed pump.

use crate::error::ControlError;
use crate::hw::{Hardware, InputId};
use crate::measure::filter::RateLimiter;
use crate::measure::{DeltaK, Temp, Ticks};
use crate::plant::bmodel::{BuildingModel, ModelId};
use crate::plant::law::BilinearLaw;
use crate::plant::pump::{Pump, PumpHandle};
use crate::plant::valve::{Valve, ValveId};
use crate::plant::{EntityState, PlantShared, TickCtx};
use crate::runtime::RunMode;
use log::{debug, info, warn};

/// Index into the plant's circuit arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostParams {
    /// Added to the ambient target while boosting.
    pub delta: DeltaK,
    /// Longest continuous boost, seconds.
    pub max_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitParams {
    pub t_comfort: Temp,
    pub t_eco: Temp,
    pub t_frostfree: Temp,
    /// Outdoor temperatures above which heating is not worth running, per
    /// run mode, with a shared hysteresis band.
    pub outhoff_comfort: Temp,
    pub outhoff_eco: Temp,
    pub outhoff_frostfree: Temp,
    pub outhoff_hysteresis: DeltaK,
    pub limit_wtmin: Temp,
    pub limit_wtmax: Temp,
    /// Added to the computed water target to form the heat request, covering
    /// losses between the heatsource manifold and the circuit.
    pub temp_inoffset: DeltaK,
    /// Rate-of-rise limit on the water target, ΔK per hour.
    pub wtemp_rorh: Option<DeltaK>,
    pub boost: Option<BoostParams>,
    /// Never command the valve below the currently measured water temp.
    pub floor_output: bool,
}

/// Sample period of the rate-of-rise limiter.
const RORH_DT: u64 = 60;

#[derive(Debug)]
pub struct HCircuit {
    name: String,
    bmodel: ModelId,
    pump: Option<PumpHandle>,
    valve: Option<ValveId>,
    sensor_feed: InputId,
    sensor_return: Option<InputId>,
    sensor_ambient: Option<InputId>,
    law: BilinearLaw,
    params: CircuitParams,
    state: EntityState,

    run_mode: RunMode,
    request_ambient: Temp,
    target_ambient: Temp,
    actual_ambient: Option<Temp>,
    actual_wtemp: Temp,
    /// Water target before interferences; what the heat request is built on.
    target_wtemp: Option<Temp>,
    heat_request: Option<Temp>,
    rorh: Option<RateLimiter>,
    outhoff: bool,
    boost_since: Option<Ticks>,
    /// Actuators already parked by a completed shutdown.
    is_shut: bool,
}

impl HCircuit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        bmodel: ModelId,
        pump: Option<PumpHandle>,
        valve: Option<ValveId>,
        sensor_feed: InputId,
        sensor_return: Option<InputId>,
        sensor_ambient: Option<InputId>,
        law: BilinearLaw,
        params: CircuitParams,
    ) -> HCircuit {
        let rorh = params
            .wtemp_rorh
            .map(|max_per_hour| RateLimiter::new(max_per_hour, RORH_DT));
        HCircuit {
            name,
            bmodel,
            pump,
            valve,
            sensor_feed,
            sensor_return,
            sensor_ambient,
            law,
            params,
            state: EntityState::Configured,
            run_mode: RunMode::Off,
            request_ambient: Temp::UNSET,
            target_ambient: Temp::UNSET,
            actual_ambient: None,
            actual_wtemp: Temp::UNSET,
            target_wtemp: None,
            heat_request: None,
            rorh,
            outhoff: false,
            boost_since: None,
            is_shut: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online(&mut self, hw: &Hardware) -> Result<(), ControlError> {
        hw.input_time(self.sensor_feed)?;
        if self.params.limit_wtmin >= self.params.limit_wtmax {
            warn!(target: "hcircuit", "\"{}\" water limits are inverted", self.name);
            return Err(ControlError::Misconfigured);
        }
        self.state = EntityState::Online;
        info!(target: "hcircuit", "\"{}\" online", self.name);
        Ok(())
    }

    pub fn set_run_mode(&mut self, mode: RunMode) {
        if mode != self.run_mode {
            info!(target: "hcircuit", "\"{}\" run mode {} -> {}", self.name, self.run_mode, mode);
        }
        self.run_mode = mode;
    }

    pub fn heat_request(&self) -> Option<Temp> {
        self.heat_request
    }

    pub fn target_wtemp(&self) -> Option<Temp> {
        self.target_wtemp
    }

    pub fn actual_wtemp(&self) -> Temp {
        self.actual_wtemp
    }

    pub fn target_ambient(&self) -> Temp {
        self.target_ambient
    }

    pub fn request_ambient(&self) -> Temp {
        self.request_ambient
    }

    pub fn actual_ambient(&self) -> Option<Temp> {
        self.actual_ambient
    }

    fn ambient_setpoint(&self, mode: RunMode) -> Temp {
        match mode {
            RunMode::Comfort => self.params.t_comfort,
            RunMode::Eco => self.params.t_eco,
            // DHW-only keeps the building frost-protected, nothing more.
            RunMode::Frostfree | RunMode::Dhwonly => self.params.t_frostfree,
            _ => self.params.t_frostfree,
        }
    }

    fn outhoff_threshold(&self, mode: RunMode) -> Temp {
        match mode {
            RunMode::Comfort => self.params.outhoff_comfort,
            RunMode::Eco => self.params.outhoff_eco,
            _ => self.params.outhoff_frostfree,
        }
    }

    fn set_pump(&self, pumps: &mut [Pump], on: bool) -> Result<(), ControlError> {
        if let Some(handle) = self.pump {
            pumps[handle.pump.0].set_state(handle, on, false)?;
        }
        Ok(())
    }

    /// Sensor failure failsafe: stop asking for heat, close the mix so no
    /// uncontrolled hot water reaches the emitters, keep water moving.
    fn failsafe(
        &mut self,
        hw: &Hardware,
        now: Ticks,
        pumps: &mut [Pump],
        valves: &mut [Valve],
    ) -> Result<(), ControlError> {
        self.heat_request = None;
        self.target_wtemp = None;
        if let Some(valve) = self.valve {
            valves[valve.0].reqclose_full(hw, now)?;
        }
        self.set_pump(pumps, true)?;
        self.is_shut = false;
        Ok(())
    }

    fn shutdown(
        &mut self,
        hw: &Hardware,
        now: Ticks,
        pumps: &mut [Pump],
        valves: &mut [Valve],
    ) -> Result<(), ControlError> {
        if self.is_shut {
            return Ok(());
        }
        debug!(target: "hcircuit", "\"{}\" shutting down", self.name);
        self.heat_request = None;
        self.target_wtemp = None;
        self.target_ambient = Temp::UNSET;
        self.boost_since = None;
        if let Some(rorh) = &mut self.rorh {
            rorh.reset();
        }
        self.set_pump(pumps, false)?;
        if let Some(valve) = self.valve {
            let valve = &mut valves[valve.0];
            valve.clear_target();
            valve.reqclose_full(hw, now)?;
        }
        self.is_shut = true;
        Ok(())
    }

    pub fn offline(&mut self, hw: &Hardware, now: Ticks, pumps: &mut [Pump], valves: &mut [Valve]) {
        if self.state == EntityState::Offline {
            return;
        }
        self.is_shut = false;
        let _ = self.shutdown(hw, now, pumps, valves);
        self.state = EntityState::Offline;
    }

    /// Ambient target including the optional boost: while the room is below
    /// target, raise the target by a delta for a bounded time.
    fn resolve_target_ambient(&mut self, ctx: &TickCtx, mode: RunMode) -> Temp {
        self.request_ambient = self.ambient_setpoint(mode);
        let mut target = self.request_ambient;

        self.actual_ambient = self
            .sensor_ambient
            .and_then(|id| ctx.hw.input_value(id, ctx.now).ok());

        if let (Some(boost), Some(ambient)) = (self.params.boost, self.actual_ambient) {
            if ambient < self.request_ambient {
                let since = *self.boost_since.get_or_insert(ctx.now);
                if ctx.now.since(since) < boost.max_time {
                    target = target + boost.delta;
                }
            } else {
                self.boost_since = None;
            }
        }
        self.target_ambient = target;
        target
    }

    pub fn run(
        &mut self,
        ctx: &TickCtx,
        shared: &PlantShared,
        models: &[BuildingModel],
        pumps: &mut [Pump],
        valves: &mut [Valve],
    ) -> Result<(), ControlError> {
        if self.state != EntityState::Online {
            return Err(ControlError::Offline);
        }

        // The feed sensor is mandatory: without it the circuit is blind.
        self.actual_wtemp = match ctx.hw.input_value(self.sensor_feed, ctx.now) {
            Ok(value) => value,
            Err(err) => {
                ctx.alarms
                    .raise(&self.name, format!("feed sensor: {}", err));
                self.failsafe(ctx.hw, ctx.now, pumps, valves)?;
                return Err(err);
            }
        };

        // A producer at its hard limit needs every consumer dissipating.
        let mut mode = self.run_mode;
        if shared.hs_overtemp && mode != RunMode::Test {
            mode = RunMode::Comfort;
        } else if shared.dhwc_absolute && mode != RunMode::Off && mode != RunMode::Test {
            // Absolute DHW priority: fall back to frost protection while the
            // tank takes all the heat.
            mode = RunMode::Dhwonly;
        }

        if mode == RunMode::Test {
            if let Some(valve) = self.valve {
                valves[valve.0].reqstop(ctx.hw)?;
            }
            self.set_pump(pumps, true)?;
            self.is_shut = false;
            return Ok(());
        }

        // Summer cutoff: heating is pointless above the outdoor threshold.
        if mode != RunMode::Off {
            let t_out_mix = models[self.bmodel.0].mixed();
            if let Ok(t_out_mix) = t_out_mix.checked() {
                let threshold = self.outhoff_threshold(mode);
                let half = self.params.outhoff_hysteresis.half();
                if self.outhoff {
                    if t_out_mix < threshold - half {
                        self.outhoff = false;
                    }
                } else if t_out_mix > threshold + half {
                    info!(
                        target: "hcircuit",
                        "\"{}\" outdoor {} above {} threshold, heating off",
                        self.name, t_out_mix, threshold
                    );
                    self.outhoff = true;
                }
            }
        } else {
            self.outhoff = false;
        }

        if mode == RunMode::Off || self.outhoff {
            // Producers wind down through the consumer shutdown delay: while
            // it runs, a circuit that was heating keeps its request and its
            // water moving so residual burner heat has somewhere to go.
            if shared.consumer_sdelay > 0 && self.target_wtemp.is_some() {
                debug!(
                    target: "hcircuit",
                    "\"{}\" holding for consumer shutdown delay ({}s left)",
                    self.name, shared.consumer_sdelay
                );
                self.set_pump(pumps, true)?;
                self.is_shut = false;
                return Ok(());
            }
            return self.shutdown(ctx.hw, ctx.now, pumps, valves);
        }

        let target_ambient = self.resolve_target_ambient(ctx, mode);

        // Water law on the building-filtered outdoor temperature.
        let t_out_mix = match models[self.bmodel.0].mixed().checked() {
            Ok(t_out_mix) => t_out_mix,
            Err(err) => {
                ctx.alarms
                    .raise(&self.name, format!("building model unusable: {}", err));
                self.failsafe(ctx.hw, ctx.now, pumps, valves)?;
                return Err(err);
            }
        };
        let wtemp = self.law.compute(t_out_mix, target_ambient);
        let wtemp = wtemp.clamp(self.params.limit_wtmin, self.params.limit_wtmax);
        self.target_wtemp = Some(wtemp);
        self.heat_request = Some(wtemp + self.params.temp_inoffset);

        // Interferences only matter when a mixing valve can act on them.
        if let Some(valve) = self.valve {
            let mut water = wtemp;

            if let Some(rorh) = &mut self.rorh {
                water = rorh.update(water, self.actual_wtemp, ctx.now);
            }

            if self.params.floor_output {
                water = water.max(self.actual_wtemp);
            }

            if shared.consumer_shift != 0 {
                let reference = self
                    .sensor_return
                    .and_then(|id| ctx.hw.input_value(id, ctx.now).ok())
                    .unwrap_or(Temp::ZERO_CELSIUS);
                let shift = (water - reference).percent(shared.consumer_shift);
                water = water + shift;
            }

            if shared.hs_overtemp {
                water = self.params.limit_wtmax;
            }
            water = water.min(self.params.limit_wtmax);

            valves[valve.0].set_target(water);
        }

        self.set_pump(pumps, true)?;
        self.is_shut = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm;
    use crate::hw::dummy::{DummyBackend, DummyHandle};
    use crate::plant::pump::PumpId;
    use crate::plant::valve::{Valve, ValveParams};

    struct Fixture {
        hw: Hardware,
        handle: DummyHandle,
        models: Vec<BuildingModel>,
        pumps: Vec<Pump>,
        valves: Vec<Valve>,
        circuit: HCircuit,
        alarms: alarm::AlarmSender,
        alarm_rx: alarm::AlarmReceiver,
    }

    // Channels: 0 outdoor, 1 feed, 2 return, 3 ambient.
    // Relays: 0 pump, 1 valve open, 2 valve close.
    fn fixture(params: CircuitParams) -> Fixture {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(4, 3);
        let b = hw.add_backend(Box::new(backend));
        let outdoor = hw.declare_input("outdoor", b, 0).unwrap();
        let feed = hw.declare_input("feed", b, 1).unwrap();
        let ret = hw.declare_input("return", b, 2).unwrap();
        let _ambient = hw.declare_input("ambient", b, 3).unwrap();
        let pump_relay = hw.declare_output("pump", b, 0).unwrap();
        let open = hw.declare_output("valve_open", b, 1).unwrap();
        let close = hw.declare_output("valve_close", b, 2).unwrap();

        let mut model = BuildingModel::new("house".to_owned(), outdoor, 3600);
        model.online(&hw).unwrap();

        let mut pump = Pump::new("pump".to_owned(), pump_relay, false, 0);
        let pump_handle = pump.grab(PumpId(0)).unwrap();
        pump.online(&mut hw).unwrap();

        let mut valve = Valve::new(
            "valve".to_owned(),
            feed,
            open,
            close,
            ValveParams::default(),
        );
        valve.online(&mut hw).unwrap();

        let law = BilinearLaw::new(
            Temp::from_celsius(-10.0),
            Temp::from_celsius(65.0),
            Temp::from_celsius(15.0),
            Temp::from_celsius(25.0),
            110,
        );

        let mut circuit = HCircuit::new(
            "circuit".to_owned(),
            ModelId(0),
            Some(pump_handle),
            Some(ValveId(0)),
            feed,
            Some(ret),
            None,
            law,
            params,
        );
        circuit.online(&hw).unwrap();

        let (alarms, alarm_rx) = alarm::channel();
        Fixture {
            hw,
            handle,
            models: vec![model],
            pumps: vec![pump],
            valves: vec![valve],
            circuit,
            alarms,
            alarm_rx,
        }
    }

    fn default_params() -> CircuitParams {
        CircuitParams {
            t_comfort: Temp::from_celsius(20.0),
            t_eco: Temp::from_celsius(17.0),
            t_frostfree: Temp::from_celsius(7.0),
            outhoff_comfort: Temp::from_celsius(17.0),
            outhoff_eco: Temp::from_celsius(14.0),
            outhoff_frostfree: Temp::from_celsius(7.0),
            outhoff_hysteresis: DeltaK::from_kelvin(1.0),
            limit_wtmin: Temp::from_celsius(20.0),
            limit_wtmax: Temp::from_celsius(80.0),
            temp_inoffset: DeltaK::from_kelvin(5.0),
            wtemp_rorh: None,
            boost: None,
            floor_output: false,
        }
    }

    fn shared() -> PlantShared {
        PlantShared::default()
    }

    impl Fixture {
        async fn feed_temps(&mut self, outdoor: f64, feed: f64, now: u64) {
            self.handle.set_temp_c(0, outdoor);
            self.handle.set_temp_c(1, feed);
            self.handle.set_temp_c(2, 30.0);
            self.hw.input(Ticks::from_secs(now)).await;
        }

        fn run(&mut self, shared: &PlantShared, now: u64) -> Result<(), ControlError> {
            let ctx = TickCtx {
                hw: &self.hw,
                alarms: &self.alarms,
                now: Ticks::from_secs(now),
            };
            self.models[0].run(&ctx)?;
            let result = self.circuit.run(
                &ctx,
                shared,
                &self.models,
                &mut self.pumps,
                &mut self.valves,
            );
            self.pumps[0].run(&ctx).unwrap();
            result
        }

        fn pump_commanded(&self) -> bool {
            self.pumps[0].get_state()
        }
    }

    #[tokio::test]
    async fn test_cold_day_water_target() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);
        f.feed_temps(-5.0, 35.0, 0).await;
        f.run(&shared(), 0).unwrap();

        // Bilinear law with (-10,65)/(15,25) nH110 at -5°C mixed outdoor.
        let target = f.circuit.target_wtemp().unwrap();
        assert!(
            (target.to_celsius() - 57.3).abs() < 0.5,
            "got {}",
            target
        );
        // Heat request carries the feed offset.
        let request = f.circuit.heat_request().unwrap();
        assert_eq!(request, target + DeltaK::from_kelvin(5.0));
        assert!(f.pump_commanded());
    }

    #[tokio::test]
    async fn test_feed_sensor_failure_fails_safe() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);
        f.handle.set_temp_c(0, -5.0);
        f.handle.set_temp(1, Temp::SHORT);
        f.hw.input(Ticks::from_secs(0)).await;

        let err = f.run(&shared(), 0).unwrap_err();
        assert_eq!(err, ControlError::SensorShort);
        assert_eq!(f.circuit.heat_request(), None);
        assert!(f.pump_commanded(), "failsafe keeps the water moving");
        // The valve is driven toward closed.
        let close = f.hw.output_ibn("valve_close").unwrap();
        assert!(f.hw.output_state(close).unwrap());
        assert_eq!(f.alarm_rx.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_off_mode_shuts_down() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);
        f.feed_temps(-5.0, 35.0, 0).await;
        f.run(&shared(), 0).unwrap();
        assert!(f.circuit.heat_request().is_some());

        f.circuit.set_run_mode(RunMode::Off);
        f.feed_temps(-5.0, 35.0, 1).await;
        f.run(&shared(), 1).unwrap();
        assert_eq!(f.circuit.heat_request(), None);
        assert!(!f.pump_commanded());
    }

    #[tokio::test]
    async fn test_consumer_sdelay_holds_request() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);
        f.feed_temps(-5.0, 35.0, 0).await;
        f.run(&shared(), 0).unwrap();
        let request = f.circuit.heat_request();
        assert!(request.is_some());

        // Mode goes off while the plant still counts down the shutdown
        // delay: the request and the pump must survive the window.
        f.circuit.set_run_mode(RunMode::Off);
        let holding = PlantShared {
            consumer_sdelay: 120,
            ..PlantShared::default()
        };
        f.feed_temps(-5.0, 35.0, 1).await;
        f.run(&holding, 1).unwrap();
        assert_eq!(f.circuit.heat_request(), request);
        assert!(f.pump_commanded());

        // Window over: normal shutdown.
        f.feed_temps(-5.0, 35.0, 2).await;
        f.run(&shared(), 2).unwrap();
        assert_eq!(f.circuit.heat_request(), None);
        assert!(!f.pump_commanded());
    }

    #[tokio::test]
    async fn test_overtemp_dumps_heat() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Off);
        let overtemp = PlantShared {
            hs_overtemp: true,
            ..PlantShared::default()
        };
        f.feed_temps(-5.0, 35.0, 0).await;
        f.run(&overtemp, 0).unwrap();

        // Even an OFF circuit is drafted into dissipating.
        assert!(f.pump_commanded());
        assert!(f.circuit.heat_request().is_some());
    }

    #[tokio::test]
    async fn test_summer_cutoff_with_hysteresis() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);

        // Mixed outdoor settles at 20°C, above the 17°C comfort threshold.
        f.feed_temps(20.0, 30.0, 0).await;
        f.run(&shared(), 0).unwrap();
        assert_eq!(f.circuit.heat_request(), None, "cutoff should shut heating");
        assert!(!f.pump_commanded());

        // 16.6°C is within the half-kelvin band: still off.
        f.feed_temps(16.6, 30.0, 36000).await;
        f.run(&shared(), 36000).unwrap();
        assert_eq!(f.circuit.heat_request(), None);
    }

    #[tokio::test]
    async fn test_negative_shift_depresses_valve_target() {
        let mut f = fixture(default_params());
        f.circuit.set_run_mode(RunMode::Comfort);
        f.feed_temps(-5.0, 35.0, 0).await;
        f.run(&shared(), 0).unwrap();
        let unshifted = f.valves[0].target().unwrap();

        let shifted = PlantShared {
            consumer_shift: -50,
            ..PlantShared::default()
        };
        f.feed_temps(-5.0, 35.0, 1).await;
        f.run(&shifted, 1).unwrap();
        let depressed = f.valves[0].target().unwrap();
        assert!(
            depressed < unshifted,
            "-50% shift should depress the valve target ({} vs {})",
            depressed,
            unshifted
        );
        // Heat request itself is not shifted.
        assert_eq!(
            f.circuit.heat_request().unwrap(),
            f.circuit.target_wtemp().unwrap() + DeltaK::from_kelvin(5.0)
        );
    }

    #[tokio::test]
    async fn test_rate_of_rise_limits_valve_target() {
        let mut f = fixture(CircuitParams {
            wtemp_rorh: Some(DeltaK::from_kelvin(6.0)),
            ..default_params()
        });
        f.circuit.set_run_mode(RunMode::Comfort);

        // Water is cold; the law asks for ~57°C immediately.
        f.feed_temps(-5.0, 25.0, 0).await;
        f.run(&shared(), 0).unwrap();
        let initial = f.valves[0].target().unwrap();
        assert!(
            (initial.to_celsius() - 25.0).abs() < 0.5,
            "ramp starts from the water temp, got {}",
            initial
        );

        // One hour later the ramp has only covered ~6K.
        let mut now = 0;
        for _ in 0..60 {
            now += 60;
            f.feed_temps(-5.0, 25.0, now).await;
            f.run(&shared(), now).unwrap();
        }
        let after_hour = f.valves[0].target().unwrap();
        assert!(
            (after_hour.to_celsius() - 31.0).abs() < 0.6,
            "6K/h from 25 should be ~31, got {}",
            after_hour
        );
        // The heat request is not rate limited.
        assert!(f.circuit.heat_request().unwrap() > after_hour);
    }
}
