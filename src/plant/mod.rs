//! The plant: arenas of every entity kind, ticked in dependency order, plus
//! the aggregated consumer/producer coupling state. Entities never hold
//! references to each other; they hold typed indices into these arenas.

use crate::alarm::AlarmSender;
use crate::error::ControlError;
use crate::hw::Hardware;
use crate::measure::{Temp, Ticks};
use crate::runtime::{ResolvedModes, RunMode};
use itertools::Itertools;
use log::{error, info, warn};

pub mod bmodel;
pub mod boiler;
pub mod dhwt;
pub mod hcircuit;
pub mod law;
pub mod pump;
pub mod valve;

use bmodel::{BuildingModel, ModelId};
use boiler::{Boiler, BoilerId};
use dhwt::{DhwPriority, Dhwt, DhwtId};
use hcircuit::{CircuitId, HCircuit};
use pump::{Pump, PumpId};
use valve::{Valve, ValveId};

/// Lifecycle shared by every entity. `Online` is the only state in which
/// `run` may be invoked; `Offline` has parked all owned actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Configured,
    Online,
    Offline,
}

/// Per-tick context handed to every entity.
pub struct TickCtx<'a> {
    pub hw: &'a Hardware,
    pub alarms: &'a AlarmSender,
    pub now: Ticks,
}

/// Consumer/producer coupling state, rebuilt by aggregation every tick.
/// Consumers read the values the producers wrote on the previous pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlantShared {
    /// Percent, negative inhibits consumption, positive dumps excess.
    pub consumer_shift: i32,
    /// Seconds consumers must keep their requests after a burner stop.
    pub consumer_sdelay: u64,
    /// A sliding-priority tank is charging: circuits are asked to back off.
    pub dhwc_sliding: bool,
    /// An absolute-priority tank is charging: circuits are cut to frost
    /// protection.
    pub dhwc_absolute: bool,
    /// A producer tripped its hard limit: consumers dump heat.
    pub hs_overtemp: bool,
    /// No online consumer requests heat.
    pub could_sleep: bool,
}

/// Additional negative shift applied to circuits while a sliding-priority
/// tank charges.
const DHW_SLIDING_SHIFT: i32 = -50;

/// One entity's failure during a tick, for status aggregation. Failsafes
/// have already been applied by the entity itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityError {
    pub entity: String,
    pub error: ControlError,
}

#[derive(Debug)]
pub struct Plant {
    pub models: Vec<BuildingModel>,
    pub pumps: Vec<Pump>,
    pub valves: Vec<Valve>,
    pub circuits: Vec<HCircuit>,
    pub dhwts: Vec<Dhwt>,
    pub boilers: Vec<Boiler>,
    shared: PlantShared,
}

impl Default for Plant {
    fn default() -> Self {
        Plant::new()
    }
}

impl Plant {
    pub fn new() -> Plant {
        Plant {
            models: Vec::new(),
            pumps: Vec::new(),
            valves: Vec::new(),
            circuits: Vec::new(),
            dhwts: Vec::new(),
            boilers: Vec::new(),
            shared: PlantShared::default(),
        }
    }

    pub fn add_model(&mut self, model: BuildingModel) -> ModelId {
        self.models.push(model);
        ModelId(self.models.len() - 1)
    }

    pub fn add_pump(&mut self, pump: Pump) -> PumpId {
        self.pumps.push(pump);
        PumpId(self.pumps.len() - 1)
    }

    pub fn add_valve(&mut self, valve: Valve) -> ValveId {
        self.valves.push(valve);
        ValveId(self.valves.len() - 1)
    }

    pub fn add_circuit(&mut self, circuit: HCircuit) -> CircuitId {
        self.circuits.push(circuit);
        CircuitId(self.circuits.len() - 1)
    }

    pub fn add_dhwt(&mut self, dhwt: Dhwt) -> DhwtId {
        self.dhwts.push(dhwt);
        DhwtId(self.dhwts.len() - 1)
    }

    pub fn add_boiler(&mut self, boiler: Boiler) -> BoilerId {
        self.boilers.push(boiler);
        BoilerId(self.boilers.len() - 1)
    }

    pub fn shared(&self) -> &PlantShared {
        &self.shared
    }

    pub fn could_sleep(&self) -> bool {
        self.shared.could_sleep
    }

    /// Brings every entity online. Any failure is fatal to startup: a plant
    /// with a half-configured entity must not run.
    pub fn online(&mut self, hw: &mut Hardware) -> Result<(), ControlError> {
        for model in &mut self.models {
            model.online(hw)?;
        }
        for pump in &mut self.pumps {
            pump.online(hw)?;
        }
        for valve in &mut self.valves {
            valve.online(hw)?;
        }
        for circuit in &mut self.circuits {
            circuit.online(hw)?;
        }
        for dhwt in &mut self.dhwts {
            dhwt.online(hw)?;
        }
        for boiler in &mut self.boilers {
            boiler.online(hw)?;
        }
        info!(
            target: "plant",
            "online: {} model(s), {} pump(s), {} valve(s), {} circuit(s), {} dhwt(s), {} boiler(s)",
            self.models.len(),
            self.pumps.len(),
            self.valves.len(),
            self.circuits.len(),
            self.dhwts.len(),
            self.boilers.len()
        );
        Ok(())
    }

    /// Consumers first so their shutdown can still reference pumps and
    /// valves, then producers, then the bare actuators.
    pub fn offline(&mut self, hw: &mut Hardware, now: Ticks) {
        for circuit in &mut self.circuits {
            circuit.offline(hw, now, &mut self.pumps, &mut self.valves);
        }
        for dhwt in &mut self.dhwts {
            dhwt.offline(hw, now, &mut self.pumps);
        }
        for boiler in &mut self.boilers {
            boiler.offline(hw, &mut self.pumps);
        }
        for valve in &mut self.valves {
            valve.offline(hw);
        }
        for pump in &mut self.pumps {
            pump.offline(hw);
        }
        for model in &mut self.models {
            model.offline();
        }
        info!(target: "plant", "offline");
    }

    /// Heatsources serve DHW charges even when the circuits are off.
    fn heatsource_mode(modes: &ResolvedModes) -> RunMode {
        match (modes.circuit, modes.dhwt) {
            (RunMode::Off, RunMode::Off) => RunMode::Off,
            (RunMode::Off, _) => RunMode::Dhwonly,
            (circuit, _) => circuit,
        }
    }

    /// One logic+run pass over the whole plant. The caller has already run
    /// the hardware input phase; the output phase follows this.
    pub fn tick(
        &mut self,
        hw: &Hardware,
        alarms: &AlarmSender,
        modes: &ResolvedModes,
        now: Ticks,
    ) -> Vec<EntityError> {
        let ctx = TickCtx { hw, alarms, now };
        let mut errors = Vec::new();

        // Mode distribution and scheduler-driven triggers.
        for circuit in &mut self.circuits {
            circuit.set_run_mode(modes.circuit);
        }
        for dhwt in &mut self.dhwts {
            dhwt.set_run_mode(modes.dhwt);
            dhwt.set_recycle(modes.recycle);
            if modes.legionella_trigger {
                dhwt.request_legionella();
            }
        }
        let hs_mode = Self::heatsource_mode(modes);
        for boiler in &mut self.boilers {
            boiler.set_run_mode(hs_mode);
        }

        // 1. Building models advance their outdoor filters.
        for model in &mut self.models {
            if let Err(error) = model.run(&ctx) {
                errors.push(EntityError {
                    entity: model.name().to_owned(),
                    error,
                });
            }
        }

        // 2. Valves walk their control loops. Deadzone means the mixed
        // temperature is already where it should be, not a failure.
        for valve in &mut self.valves {
            match valve.run(&ctx) {
                Ok(()) | Err(ControlError::Deadzone) => {}
                Err(error) => errors.push(EntityError {
                    entity: valve.name().to_owned(),
                    error,
                }),
            }
        }

        // 3. Pumps materialize the requests of the previous pass.
        for pump in &mut self.pumps {
            if let Err(error) = pump.run(&ctx) {
                errors.push(EntityError {
                    entity: pump.name().to_owned(),
                    error,
                });
            }
        }

        // 4. Consumers.
        let shared = self.shared;
        for circuit in &mut self.circuits {
            if let Err(error) = circuit.run(
                &ctx,
                &shared,
                &self.models,
                &mut self.pumps,
                &mut self.valves,
            ) {
                errors.push(EntityError {
                    entity: circuit.name().to_owned(),
                    error,
                });
            }
        }
        for dhwt in &mut self.dhwts {
            if let Err(error) = dhwt.run(&ctx, &shared, &mut self.pumps) {
                errors.push(EntityError {
                    entity: dhwt.name().to_owned(),
                    error,
                });
            }
        }

        // 5. Consumer aggregation, visible to the heatsources this tick.
        self.shared.could_sleep = self
            .circuits
            .iter()
            .all(|c| c.heat_request().is_none())
            && self.dhwts.iter().all(|d| d.heat_request().is_none());
        self.shared.dhwc_sliding = self.dhwts.iter().any(|d| {
            d.is_charging() && !d.electric_mode() && d.priority() == DhwPriority::Sliding
        });
        self.shared.dhwc_absolute = self.dhwts.iter().any(|d| {
            d.is_charging() && !d.electric_mode() && d.priority() == DhwPriority::Absolute
        });

        // 6. Heatsources get the maximum consumer request.
        let heat_request: Option<Temp> = self
            .circuits
            .iter()
            .filter_map(|c| c.heat_request())
            .chain(self.dhwts.iter().filter_map(|d| d.heat_request()))
            .max();
        let shared = self.shared;
        for boiler in &mut self.boilers {
            boiler.set_heat_request(heat_request);
            let result = boiler
                .logic(&ctx, &shared, &mut self.pumps)
                .and_then(|_| boiler.run(&ctx, &mut self.pumps, &mut self.valves));
            if let Err(error) = result {
                if error == ControlError::Safety {
                    error!(
                        target: "plant",
                        "heatsource \"{}\" in safety shutdown",
                        boiler.name()
                    );
                }
                errors.push(EntityError {
                    entity: boiler.name().to_owned(),
                    error,
                });
            }
        }

        // 7. Producer aggregation, visible to the consumers next tick.
        let producer_shift = self
            .boilers
            .iter()
            .map(|b| b.cshift_crit() + b.cshift_noncrit())
            .min()
            .unwrap_or(0);
        let sliding_shift = if self.shared.dhwc_sliding {
            DHW_SLIDING_SHIFT
        } else {
            0
        };
        self.shared.consumer_shift = (producer_shift + sliding_shift).clamp(-100, 100);
        self.shared.hs_overtemp = self.boilers.iter().any(|b| b.overtemp());
        self.shared.consumer_sdelay = self
            .boilers
            .iter()
            .map(|b| b.sdelay_left())
            .max()
            .unwrap_or(0);

        if !errors.is_empty() {
            warn!(
                target: "plant",
                "tick completed with {} entity error(s): {}",
                errors.len(),
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.entity, e.error))
                    .join(", ")
            );
        }
        errors
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alarm;
    use crate::hw::dummy::{DummyBackend, DummyHandle};
    use crate::measure::DeltaK;
    use crate::plant::boiler::{BoilerParams, IdleMode};
    use crate::plant::dhwt::DhwtParams;
    use crate::plant::hcircuit::CircuitParams;
    use crate::plant::law::BilinearLaw;
    use crate::plant::valve::ValveParams;

    struct Fixture {
        hw: Hardware,
        handle: DummyHandle,
        plant: Plant,
        alarms: alarm::AlarmSender,
        _alarm_rx: alarm::AlarmReceiver,
    }

    // Sensors: 0 outdoor, 1 circuit feed, 2 boiler out, 3 dhw bottom,
    // 4 dhw top.
    // Relays: 0 circuit pump, 1 valve open, 2 valve close, 3 burner,
    // 4 dhw feed pump.
    const OUTDOOR: usize = 0;
    const FEED: usize = 1;
    const BOILER_OUT: usize = 2;
    const DHW_BOTTOM: usize = 3;
    const DHW_TOP: usize = 4;

    fn c(celsius: f64) -> Temp {
        Temp::from_celsius(celsius)
    }

    fn fixture() -> Fixture {
        let mut hw = Hardware::new();
        let (backend, handle) = DummyBackend::new(5, 5);
        let b = hw.add_backend(Box::new(backend));
        let outdoor = hw.declare_input("outdoor", b, OUTDOOR).unwrap();
        let feed = hw.declare_input("feed", b, FEED).unwrap();
        let boiler_out = hw.declare_input("boiler_out", b, BOILER_OUT).unwrap();
        let dhw_bottom = hw.declare_input("dhw_bottom", b, DHW_BOTTOM).unwrap();
        let dhw_top = hw.declare_input("dhw_top", b, DHW_TOP).unwrap();
        let circuit_pump_relay = hw.declare_output("circuit_pump", b, 0).unwrap();
        let valve_open = hw.declare_output("valve_open", b, 1).unwrap();
        let valve_close = hw.declare_output("valve_close", b, 2).unwrap();
        let burner = hw.declare_output("burner", b, 3).unwrap();
        let dhw_pump_relay = hw.declare_output("dhw_pump", b, 4).unwrap();

        let mut plant = Plant::new();
        let model = plant.add_model(BuildingModel::new("house".to_owned(), outdoor, 3600));

        let circuit_pump = plant.add_pump(Pump::new(
            "circuit_pump".to_owned(),
            circuit_pump_relay,
            false,
            0,
        ));
        let circuit_pump_handle = plant.pumps[circuit_pump.0].grab(circuit_pump).unwrap();

        let dhw_pump = plant.add_pump(Pump::new("dhw_pump".to_owned(), dhw_pump_relay, false, 0));
        let dhw_pump_handle = plant.pumps[dhw_pump.0].grab(dhw_pump).unwrap();

        let valve = plant.add_valve(Valve::new(
            "circuit_valve".to_owned(),
            feed,
            valve_open,
            valve_close,
            ValveParams::default(),
        ));

        plant.add_circuit(HCircuit::new(
            "circuit".to_owned(),
            model,
            Some(circuit_pump_handle),
            Some(valve),
            feed,
            None,
            None,
            BilinearLaw::new(c(-10.0), c(65.0), c(15.0), c(25.0), 110),
            CircuitParams {
                t_comfort: c(20.0),
                t_eco: c(17.0),
                t_frostfree: c(7.0),
                outhoff_comfort: c(17.0),
                outhoff_eco: c(14.0),
                outhoff_frostfree: c(7.0),
                outhoff_hysteresis: DeltaK::from_kelvin(1.0),
                limit_wtmin: c(20.0),
                limit_wtmax: c(80.0),
                temp_inoffset: DeltaK::from_kelvin(5.0),
                wtemp_rorh: None,
                boost: None,
                floor_output: false,
            },
        ));

        plant.add_dhwt(Dhwt::new(
            "tank".to_owned(),
            Some(dhw_bottom),
            Some(dhw_top),
            None,
            None,
            Some(dhw_pump_handle),
            None,
            DhwPriority::Parallel,
            DhwtParams {
                t_comfort: c(55.0),
                t_eco: c(40.0),
                t_frostfree: c(10.0),
                t_legionella: c(65.0),
                hysteresis: DeltaK::from_kelvin(5.0),
                temp_inoffset: DeltaK::from_kelvin(7.0),
                limit_tmin: c(5.0),
                limit_tmax: c(90.0),
                limit_wintmax: c(75.0),
                limit_chargetime: 1800,
                electric_failover: false,
            },
        ));

        plant.add_boiler(Boiler::new(
            "boiler".to_owned(),
            boiler_out,
            None,
            burner,
            None,
            None,
            None,
            BoilerParams {
                hysteresis: DeltaK::from_kelvin(8.0),
                limit_tmin: c(10.0),
                limit_tmax: c(90.0),
                limit_thardmax: c(100.0),
                limit_treturnmin: None,
                t_freeze: c(5.0),
                burner_min_time: 0,
                idle_mode: IdleMode::Always,
                consumer_sdelay: 120,
            },
        ));

        plant.online(&mut hw).unwrap();

        let (alarms, _alarm_rx) = alarm::channel();
        Fixture {
            hw,
            handle,
            plant,
            alarms,
            _alarm_rx,
        }
    }

    fn comfort_modes() -> ResolvedModes {
        ResolvedModes {
            circuit: RunMode::Comfort,
            dhwt: RunMode::Comfort,
            legionella_trigger: false,
            recycle: false,
        }
    }

    fn off_modes() -> ResolvedModes {
        ResolvedModes {
            circuit: RunMode::Off,
            dhwt: RunMode::Off,
            legionella_trigger: false,
            recycle: false,
        }
    }

    impl Fixture {
        async fn tick(&mut self, modes: &ResolvedModes, now: u64) -> Vec<EntityError> {
            self.hw.input(Ticks::from_secs(now)).await;
            let errors = self
                .plant
                .tick(&self.hw, &self.alarms, modes, Ticks::from_secs(now));
            self.hw.output(Ticks::from_secs(now)).await;
            errors
        }

        fn relay(&self, name: &str) -> bool {
            self.hw.output_state(self.hw.output_ibn(name).unwrap()).unwrap()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_cold_start_end_to_end() {
        let mut f = fixture();
        // Cold winter day, everything needs heat.
        f.handle.set_temp_c(OUTDOOR, -5.0);
        f.handle.set_temp_c(FEED, 30.0);
        f.handle.set_temp_c(BOILER_OUT, 30.0);
        f.handle.set_temp_c(DHW_BOTTOM, 40.0);
        f.handle.set_temp_c(DHW_TOP, 45.0);

        let errors = f.tick(&comfort_modes(), 0).await;
        assert!(errors.is_empty(), "{:?}", errors);

        // Circuit asks for law output ~57.3 + 5 offset; tank asks for 62.
        let circuit_request = f.plant.circuits[0].heat_request().unwrap();
        assert!((circuit_request.to_celsius() - 62.3).abs() < 0.5);
        let tank_request = f.plant.dhwts[0].heat_request().unwrap();
        assert_eq!(tank_request, c(62.0));

        // Boiler got the max of the requests and fired.
        let boiler_target = f.plant.boilers[0].target_temp().unwrap();
        assert_eq!(boiler_target, circuit_request.max(tank_request));
        assert!(f.relay("burner"));
        assert!(!f.plant.could_sleep());

        // Next tick the pumps materialize the consumer requests.
        let errors = f.tick(&comfort_modes(), 1).await;
        assert!(errors.is_empty());
        assert!(f.relay("circuit_pump"));
        assert!(f.relay("dhw_pump"));
        // Valve drives open toward the hot target.
        assert!(f.relay("valve_open"));
        assert!(!f.relay("valve_close"));
    }

    #[test_log::test(tokio::test)]
    async fn test_overtemp_propagates_to_consumers() {
        let mut f = fixture();
        f.handle.set_temp_c(OUTDOOR, -5.0);
        f.handle.set_temp_c(FEED, 60.0);
        f.handle.set_temp_c(BOILER_OUT, 85.0);
        f.handle.set_temp_c(DHW_BOTTOM, 56.0);
        f.handle.set_temp_c(DHW_TOP, 58.0);
        f.tick(&comfort_modes(), 0).await;

        // Boiler shoots past its hard limit.
        f.handle.set_temp_c(BOILER_OUT, 101.0);
        let errors = f.tick(&comfort_modes(), 1).await;
        assert!(errors.iter().any(|e| e.error == ControlError::Safety));
        assert!(!f.relay("burner"), "burner dead within the same tick");
        assert_eq!(f.plant.shared().consumer_shift, 100);
        assert!(f.plant.shared().hs_overtemp);

        // Next tick the circuit dumps: valve target pinned to wtmax.
        f.tick(&comfort_modes(), 2).await;
        assert_eq!(f.plant.valves[0].target(), Some(c(80.0)));
        assert!(f.relay("circuit_pump"));
    }

    #[test_log::test(tokio::test)]
    async fn test_could_sleep_when_nothing_requests() {
        let mut f = fixture();
        // Mild day, tank satisfied.
        f.handle.set_temp_c(OUTDOOR, 18.0);
        f.handle.set_temp_c(FEED, 30.0);
        f.handle.set_temp_c(BOILER_OUT, 40.0);
        f.handle.set_temp_c(DHW_BOTTOM, 56.0);
        f.handle.set_temp_c(DHW_TOP, 58.0);

        let errors = f.tick(&comfort_modes(), 0).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(f.plant.could_sleep());
        assert!(!f.relay("burner"));
    }

    #[test_log::test(tokio::test)]
    async fn test_consumer_sdelay_flows_from_boiler() {
        let mut f = fixture();
        f.handle.set_temp_c(OUTDOOR, -5.0);
        f.handle.set_temp_c(FEED, 30.0);
        f.handle.set_temp_c(BOILER_OUT, 30.0);
        f.handle.set_temp_c(DHW_BOTTOM, 56.0);
        f.handle.set_temp_c(DHW_TOP, 58.0);

        f.tick(&comfort_modes(), 0).await;
        assert!(f.plant.boilers[0].burner_on());
        assert_eq!(f.plant.shared().consumer_sdelay, 120);

        // System goes off while the burner was running: the circuit keeps
        // its heat request through the delay window.
        let request_before = f.plant.circuits[0].heat_request();
        assert!(request_before.is_some());
        f.tick(&off_modes(), 1).await;
        assert_eq!(f.plant.circuits[0].heat_request(), request_before);
        assert!(f.plant.circuits[0].target_wtemp().is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_off_plant_goes_quiet() {
        let mut f = fixture();
        f.handle.set_temp_c(OUTDOOR, -5.0);
        f.handle.set_temp_c(FEED, 30.0);
        f.handle.set_temp_c(BOILER_OUT, 50.0);
        f.handle.set_temp_c(DHW_BOTTOM, 56.0);
        f.handle.set_temp_c(DHW_TOP, 58.0);

        let errors = f.tick(&off_modes(), 0).await;
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(!f.relay("burner"));
        assert!(f.plant.could_sleep());

        f.tick(&off_modes(), 1).await;
        assert!(!f.relay("circuit_pump"));
        assert!(!f.relay("dhw_pump"));
    }

    #[test_log::test(tokio::test)]
    async fn test_offline_parks_everything() {
        let mut f = fixture();
        f.handle.set_temp_c(OUTDOOR, -5.0);
        f.handle.set_temp_c(FEED, 30.0);
        f.handle.set_temp_c(BOILER_OUT, 30.0);
        f.handle.set_temp_c(DHW_BOTTOM, 40.0);
        f.handle.set_temp_c(DHW_TOP, 45.0);
        f.tick(&comfort_modes(), 0).await;
        f.tick(&comfort_modes(), 1).await;
        assert!(f.relay("burner"));

        f.plant.offline(&mut f.hw, Ticks::from_secs(2));
        f.hw.output(Ticks::from_secs(2)).await;
        assert!(!f.relay("burner"));
        assert!(!f.relay("circuit_pump"));
        assert!(!f.relay("dhw_pump"));
        assert!(!f.relay("valve_open"));
    }
}
