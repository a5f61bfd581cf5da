//! Whole-plant configuration. TOML at rest; temperatures are written in °C
//! and differences in kelvin, both converted to fixed point during assembly;
//! durations are plain seconds. Every struct serializes back out so a parsed
//! config can be dumped and re-parsed identically.

use crate::error::ControlError;
use crate::hw::Hardware;
use crate::hw::file::FileBackend;
use crate::measure::{DeltaK, Temp};
use crate::plant::Plant;
use crate::plant::bmodel::BuildingModel;
use crate::plant::boiler::{Boiler, BoilerParams, IdleMode};
use crate::plant::dhwt::{DhwPriority, Dhwt, DhwtParams};
use crate::plant::hcircuit::{BoostParams, CircuitParams, HCircuit};
use crate::plant::law::BilinearLaw;
use crate::plant::pump::{Pump, PumpHandle, PumpId};
use crate::plant::valve::{Valve, ValveId, ValveParams};
use crate::runtime::{RunMode, Runtime, SystemMode};
use crate::scheduler::Schedule;
use crate::storage::Store;
use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub backends: BackendsConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub pumps: Vec<PumpConfig>,
    #[serde(default)]
    pub valves: Vec<ValveConfig>,
    #[serde(default)]
    pub hcircuits: Vec<HCircuitConfig>,
    #[serde(default)]
    pub dhwts: Vec<DhwtConfig>,
    #[serde(default)]
    pub boilers: Vec<BoilerConfig>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BackendsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileBackendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpio: Option<GpioBackendConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBackendConfig {
    pub path: PathBuf,
    /// Sensor names, in channel order; names must match the file's keys.
    pub sensors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioBackendConfig {
    pub relays: Vec<GpioRelayConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioRelayConfig {
    pub name: String,
    pub pin: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub system_mode: SystemMode,
    #[serde(default = "default_manual_runmode")]
    pub manual_runmode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

fn default_manual_runmode() -> RunMode {
    RunMode::Frostfree
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub tid_outdoor: String,
    /// Building thermal time constant.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tau: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    pub name: String,
    pub rid: String,
    #[serde(default)]
    pub shared: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub cooldown: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveConfig {
    pub name: String,
    pub tid_mixed: String,
    pub rid_open: String,
    pub rid_close: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub travel_time: Duration,
    /// Kelvin.
    #[serde(default = "default_valve_deadzone")]
    pub deadzone: f64,
    #[serde(default = "default_valve_kp")]
    pub kp_permille_per_k: i32,
    #[serde(default = "default_valve_ki")]
    pub ki_permille_per_k: i32,
    #[serde(default = "default_valve_samples")]
    pub integral_samples: usize,
    #[serde(default = "default_valve_max_step")]
    pub max_step_permille: i32,
}

fn default_valve_deadzone() -> f64 {
    0.5
}

fn default_valve_kp() -> i32 {
    ValveParams::default().kp_permille_per_k
}

fn default_valve_ki() -> i32 {
    ValveParams::default().ki_permille_per_k
}

fn default_valve_samples() -> usize {
    ValveParams::default().integral_samples
}

fn default_valve_max_step() -> i32 {
    ValveParams::default().max_step_permille
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawConfig {
    pub tout1: f64,
    pub twater1: f64,
    pub tout2: f64,
    pub twater2: f64,
    #[serde(default = "default_nh100")]
    pub nh100: i32,
}

fn default_nh100() -> i32 {
    100
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostConfig {
    /// Kelvin added to the ambient target.
    pub delta: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_time: Duration,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HCircuitConfig {
    pub name: String,
    pub bmodel: String,
    pub tid_feed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_return: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_ambient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valve: Option<String>,
    pub t_comfort: f64,
    pub t_eco: f64,
    pub t_frostfree: f64,
    pub outhoff_comfort: f64,
    pub outhoff_eco: f64,
    pub outhoff_frostfree: f64,
    #[serde(default = "default_outhoff_hysteresis")]
    pub outhoff_hysteresis: f64,
    pub limit_wtmin: f64,
    pub limit_wtmax: f64,
    #[serde(default)]
    pub temp_inoffset: f64,
    /// Kelvin per hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wtemp_rorh: Option<f64>,
    #[serde(default)]
    pub floor_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<BoostConfig>,
    pub law: LawConfig,
}

fn default_outhoff_hysteresis() -> f64 {
    1.0
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhwtConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_bottom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_win: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid_selfheater: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_feed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_recycle: Option<String>,
    #[serde(default = "default_dhw_priority")]
    pub priority: DhwPriority,
    pub t_comfort: f64,
    pub t_eco: f64,
    pub t_frostfree: f64,
    #[serde(default = "default_t_legionella")]
    pub t_legionella: f64,
    #[serde(default = "default_dhw_hysteresis")]
    pub hysteresis: f64,
    #[serde(default)]
    pub temp_inoffset: f64,
    pub limit_tmin: f64,
    pub limit_tmax: f64,
    pub limit_wintmax: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub limit_chargetime: Duration,
    #[serde(default)]
    pub electric_failover: bool,
}

fn default_dhw_priority() -> DhwPriority {
    DhwPriority::Parallel
}

fn default_t_legionella() -> f64 {
    65.0
}

fn default_dhw_hysteresis() -> f64 {
    5.0
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoilerConfig {
    pub name: String,
    pub tid_boiler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid_return: Option<String>,
    pub rid_burner1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid_burner2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_load: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valve_return: Option<String>,
    #[serde(default = "default_boiler_hysteresis")]
    pub hysteresis: f64,
    pub limit_tmin: f64,
    pub limit_tmax: f64,
    pub limit_thardmax: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_treturnmin: Option<f64>,
    #[serde(default = "default_t_freeze")]
    pub t_freeze: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_burner_min_time")]
    pub burner_min_time: Duration,
    #[serde(default = "default_idle_mode")]
    pub idle_mode: IdleMode,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub consumer_sdelay: Duration,
}

fn default_boiler_hysteresis() -> f64 {
    8.0
}

fn default_t_freeze() -> f64 {
    5.0
}

fn default_burner_min_time() -> Duration {
    Duration::from_secs(120)
}

fn default_idle_mode() -> IdleMode {
    IdleMode::Frostonly
}

impl Config {
    pub fn from_str(s: &str) -> Result<Config, String> {
        toml::from_str(s).map_err(|e| format!("config parse error: {}", e))
    }

    pub fn dump(&self) -> Result<String, String> {
        toml::to_string(self).map_err(|e| format!("config dump error: {}", e))
    }

    /// Instantiates the backends and declares every named input and output.
    pub fn build_hardware(&self) -> Result<Hardware, ControlError> {
        let mut hw = Hardware::new();

        if let Some(file) = &self.backends.file {
            let backend = FileBackend::new(file.path.clone(), file.sensors.clone());
            let b = hw.add_backend(Box::new(backend));
            for (channel, name) in file.sensors.iter().enumerate() {
                hw.declare_input(name, b, channel)?;
            }
        }

        if let Some(gpio) = &self.backends.gpio {
            #[cfg(unix)]
            {
                let pins = gpio.relays.iter().map(|r| r.pin).collect();
                let b = hw.add_backend(Box::new(crate::hw::gpio::GpioBackend::new(pins)));
                for (channel, relay) in gpio.relays.iter().enumerate() {
                    hw.declare_output(&relay.name, b, channel)?;
                }
            }
            #[cfg(not(unix))]
            {
                let _ = gpio;
                return Err(ControlError::NotImplemented);
            }
        }

        Ok(hw)
    }

    /// Assembles the plant arenas, resolving every name to its id.
    pub fn build_plant(&self, hw: &Hardware) -> Result<Plant, ControlError> {
        let mut plant = Plant::new();

        let mut model_ids = HashMap::new();
        for m in &self.models {
            let outdoor = hw.input_ibn(&m.tid_outdoor)?;
            let id = plant.add_model(BuildingModel::new(
                m.name.clone(),
                outdoor,
                m.tau.as_secs(),
            ));
            model_ids.insert(m.name.clone(), id);
        }

        let mut pump_ids: HashMap<String, PumpId> = HashMap::new();
        for p in &self.pumps {
            let relay = hw.output_ibn(&p.rid)?;
            let id = plant.add_pump(Pump::new(
                p.name.clone(),
                relay,
                p.shared,
                p.cooldown.as_secs(),
            ));
            pump_ids.insert(p.name.clone(), id);
        }

        let mut valve_ids: HashMap<String, ValveId> = HashMap::new();
        for v in &self.valves {
            let sensor = hw.input_ibn(&v.tid_mixed)?;
            let open = hw.output_ibn(&v.rid_open)?;
            let close = hw.output_ibn(&v.rid_close)?;
            let id = plant.add_valve(Valve::new(
                v.name.clone(),
                sensor,
                open,
                close,
                ValveParams {
                    travel_time: v.travel_time.as_secs(),
                    kp_permille_per_k: v.kp_permille_per_k,
                    ki_permille_per_k: v.ki_permille_per_k,
                    integral_samples: v.integral_samples,
                    deadzone: DeltaK::from_kelvin(v.deadzone),
                    max_step_permille: v.max_step_permille,
                },
            ));
            valve_ids.insert(v.name.clone(), id);
        }

        fn acquire_pump(
            plant: &mut Plant,
            pump_ids: &HashMap<String, PumpId>,
            name: &str,
        ) -> Result<PumpHandle, ControlError> {
            let id = *pump_ids.get(name).ok_or(ControlError::NotFound)?;
            plant.pumps[id.0].acquire(id)
        }

        for c in &self.hcircuits {
            let bmodel = *model_ids.get(&c.bmodel).ok_or(ControlError::NotFound)?;
            let pump = c
                .pump
                .as_deref()
                .map(|name| acquire_pump(&mut plant, &pump_ids, name))
                .transpose()?;
            let valve = c
                .valve
                .as_deref()
                .map(|name| valve_ids.get(name).copied().ok_or(ControlError::NotFound))
                .transpose()?;
            let sensor_feed = hw.input_ibn(&c.tid_feed)?;
            let sensor_return = c
                .tid_return
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;
            let sensor_ambient = c
                .tid_ambient
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;

            let law = BilinearLaw::new(
                Temp::from_celsius(c.law.tout1),
                Temp::from_celsius(c.law.twater1),
                Temp::from_celsius(c.law.tout2),
                Temp::from_celsius(c.law.twater2),
                c.law.nh100,
            );
            let params = CircuitParams {
                t_comfort: Temp::from_celsius(c.t_comfort),
                t_eco: Temp::from_celsius(c.t_eco),
                t_frostfree: Temp::from_celsius(c.t_frostfree),
                outhoff_comfort: Temp::from_celsius(c.outhoff_comfort),
                outhoff_eco: Temp::from_celsius(c.outhoff_eco),
                outhoff_frostfree: Temp::from_celsius(c.outhoff_frostfree),
                outhoff_hysteresis: DeltaK::from_kelvin(c.outhoff_hysteresis),
                limit_wtmin: Temp::from_celsius(c.limit_wtmin),
                limit_wtmax: Temp::from_celsius(c.limit_wtmax),
                temp_inoffset: DeltaK::from_kelvin(c.temp_inoffset),
                wtemp_rorh: c.wtemp_rorh.map(DeltaK::from_kelvin),
                boost: c.boost.as_ref().map(|b| BoostParams {
                    delta: DeltaK::from_kelvin(b.delta),
                    max_time: b.max_time.as_secs(),
                }),
                floor_output: c.floor_output,
            };
            plant.add_circuit(HCircuit::new(
                c.name.clone(),
                bmodel,
                pump,
                valve,
                sensor_feed,
                sensor_return,
                sensor_ambient,
                law,
                params,
            ));
        }

        for d in &self.dhwts {
            let sensor_bottom = d
                .tid_bottom
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;
            let sensor_top = d
                .tid_top
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;
            let sensor_win = d
                .tid_win
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;
            let selfheater = d
                .rid_selfheater
                .as_deref()
                .map(|name| hw.output_ibn(name))
                .transpose()?;
            let feedpump = d
                .pump_feed
                .as_deref()
                .map(|name| acquire_pump(&mut plant, &pump_ids, name))
                .transpose()?;
            let recyclepump = d
                .pump_recycle
                .as_deref()
                .map(|name| acquire_pump(&mut plant, &pump_ids, name))
                .transpose()?;

            let params = DhwtParams {
                t_comfort: Temp::from_celsius(d.t_comfort),
                t_eco: Temp::from_celsius(d.t_eco),
                t_frostfree: Temp::from_celsius(d.t_frostfree),
                t_legionella: Temp::from_celsius(d.t_legionella),
                hysteresis: DeltaK::from_kelvin(d.hysteresis),
                temp_inoffset: DeltaK::from_kelvin(d.temp_inoffset),
                limit_tmin: Temp::from_celsius(d.limit_tmin),
                limit_tmax: Temp::from_celsius(d.limit_tmax),
                limit_wintmax: Temp::from_celsius(d.limit_wintmax),
                limit_chargetime: d.limit_chargetime.as_secs(),
                electric_failover: d.electric_failover,
            };
            plant.add_dhwt(Dhwt::new(
                d.name.clone(),
                sensor_bottom,
                sensor_top,
                sensor_win,
                selfheater,
                feedpump,
                recyclepump,
                d.priority,
                params,
            ));
        }

        for b in &self.boilers {
            let sensor_out = hw.input_ibn(&b.tid_boiler)?;
            let sensor_return = b
                .tid_return
                .as_deref()
                .map(|name| hw.input_ibn(name))
                .transpose()?;
            let burner1 = hw.output_ibn(&b.rid_burner1)?;
            let burner2 = b
                .rid_burner2
                .as_deref()
                .map(|name| hw.output_ibn(name))
                .transpose()?;
            let loadpump = b
                .pump_load
                .as_deref()
                .map(|name| acquire_pump(&mut plant, &pump_ids, name))
                .transpose()?;
            let retvalve = b
                .valve_return
                .as_deref()
                .map(|name| valve_ids.get(name).copied().ok_or(ControlError::NotFound))
                .transpose()?;

            let params = BoilerParams {
                hysteresis: DeltaK::from_kelvin(b.hysteresis),
                limit_tmin: Temp::from_celsius(b.limit_tmin),
                limit_tmax: Temp::from_celsius(b.limit_tmax),
                limit_thardmax: Temp::from_celsius(b.limit_thardmax),
                limit_treturnmin: b.limit_treturnmin.map(Temp::from_celsius),
                t_freeze: Temp::from_celsius(b.t_freeze),
                burner_min_time: b.burner_min_time.as_secs(),
                idle_mode: b.idle_mode,
                consumer_sdelay: b.consumer_sdelay.as_secs(),
            };
            plant.add_boiler(Boiler::new(
                b.name.clone(),
                sensor_out,
                sensor_return,
                burner1,
                burner2,
                loadpump,
                retvalve,
                params,
            ));
        }

        info!(target: "config", "plant assembled from configuration");
        Ok(plant)
    }

    pub fn build_runtime(&self) -> Result<Runtime, ControlError> {
        let schedule = match &self.runtime.schedule {
            Some(name) => Some(
                self.schedules
                    .iter()
                    .find(|s| &s.name == name)
                    .cloned()
                    .ok_or(ControlError::NotFound)?,
            ),
            None => None,
        };
        Ok(Runtime::new(
            self.runtime.system_mode,
            self.runtime.manual_runmode,
            schedule,
        ))
    }

    pub fn open_store(&self) -> Result<Store, ControlError> {
        Store::new(self.storage.path.clone())
    }
}
