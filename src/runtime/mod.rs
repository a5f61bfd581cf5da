//! System-level operating mode and its resolution into the run modes the
//! plant entities consume. The system mode is a single atomic word so the
//! signal/CLI side can flip it without taking any lock the core could hold.

use crate::scheduler::Schedule;
use crate::time_util::mytime::TimeProvider;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::{Display, EnumIter, EnumString, FromRepr};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SystemMode {
    Off,
    Auto,
    Comfort,
    Eco,
    Frostfree,
    Test,
    Dhwonly,
    Manual,
    Unknown,
    None,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunMode {
    Off,
    Auto,
    Comfort,
    Eco,
    Frostfree,
    Test,
    Dhwonly,
    Unknown,
}

/// Single-word shared mode cell. Writers are the signal handler and the
/// config loader; the core reads it once per tick.
#[derive(Debug)]
pub struct SharedSystemMode(AtomicU8);

impl SharedSystemMode {
    pub fn new(mode: SystemMode) -> Self {
        SharedSystemMode(AtomicU8::new(mode as u8))
    }

    pub fn get(&self) -> SystemMode {
        SystemMode::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(SystemMode::Unknown)
    }

    pub fn set(&self, mode: SystemMode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

/// What one tick of the plant should run at, after the system mode and the
/// schedule have been folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedModes {
    pub circuit: RunMode,
    pub dhwt: RunMode,
    /// Rising edge into a schedule entry that asks for a legionella charge.
    pub legionella_trigger: bool,
    pub recycle: bool,
}

#[derive(Debug)]
pub struct Runtime {
    mode: Arc<SharedSystemMode>,
    manual_runmode: RunMode,
    schedule: Option<Schedule>,
    /// Minute-of-week of the schedule entry applied last tick.
    active_entry: Option<u32>,
    warned_no_schedule: bool,
}

impl Runtime {
    pub fn new(initial: SystemMode, manual_runmode: RunMode, schedule: Option<Schedule>) -> Self {
        Runtime {
            mode: Arc::new(SharedSystemMode::new(initial)),
            manual_runmode,
            schedule,
            active_entry: None,
            warned_no_schedule: false,
        }
    }

    /// Handle for the signal/CLI side.
    pub fn mode_handle(&self) -> Arc<SharedSystemMode> {
        self.mode.clone()
    }

    pub fn system_mode(&self) -> SystemMode {
        self.mode.get()
    }

    pub fn resolve(&mut self, time: &impl TimeProvider) -> ResolvedModes {
        let fixed = |mode: RunMode| ResolvedModes {
            circuit: mode,
            dhwt: mode,
            legionella_trigger: false,
            recycle: false,
        };

        match self.mode.get() {
            SystemMode::Off => fixed(RunMode::Off),
            SystemMode::Comfort => fixed(RunMode::Comfort),
            SystemMode::Eco => fixed(RunMode::Eco),
            SystemMode::Frostfree => fixed(RunMode::Frostfree),
            SystemMode::Test => fixed(RunMode::Test),
            SystemMode::Dhwonly => ResolvedModes {
                // Circuits keep frost protection while only DHW is served.
                circuit: RunMode::Dhwonly,
                dhwt: RunMode::Comfort,
                legionella_trigger: false,
                recycle: false,
            },
            SystemMode::Manual => fixed(self.manual_runmode),
            SystemMode::Auto => self.resolve_auto(time),
            mode @ (SystemMode::Unknown | SystemMode::None) => {
                warn!(target: "runtime", "system mode {} treated as off", mode);
                fixed(RunMode::Off)
            }
        }
    }

    fn resolve_auto(&mut self, time: &impl TimeProvider) -> ResolvedModes {
        let schedule = match &self.schedule {
            Some(schedule) => schedule,
            None => {
                if !self.warned_no_schedule {
                    warn!(target: "runtime", "auto mode without a schedule, running frostfree");
                    self.warned_no_schedule = true;
                }
                return ResolvedModes {
                    circuit: RunMode::Frostfree,
                    dhwt: RunMode::Frostfree,
                    legionella_trigger: false,
                    recycle: false,
                };
            }
        };

        match schedule.current_entry(time.schedule_time()) {
            Some(entry) => {
                let key = entry.minute_of_week();
                // Legionella fires only when crossing into the entry.
                let entered = self.active_entry != Some(key);
                self.active_entry = Some(key);
                ResolvedModes {
                    circuit: entry.runmode,
                    dhwt: entry.dhwmode,
                    legionella_trigger: entered && entry.legionella,
                    recycle: entry.recycle,
                }
            }
            None => {
                self.active_entry = None;
                ResolvedModes {
                    circuit: RunMode::Frostfree,
                    dhwt: RunMode::Frostfree,
                    legionella_trigger: false,
                    recycle: false,
                }
            }
        }
    }
}
