//! Weekly schedule calendar. Each entry names the moment it takes effect
//! (weekday, hour, minute) and the run modes to apply from then on; lookup
//! returns the latest entry at or before now, wrapping around the week.

use crate::runtime::RunMode;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// 0 = Monday .. 6 = Sunday.
    pub wday: u8,
    pub hour: u8,
    pub min: u8,
    pub runmode: RunMode,
    pub dhwmode: RunMode,
    #[serde(default)]
    pub legionella: bool,
    #[serde(default)]
    pub recycle: bool,
}

impl ScheduleEntry {
    pub fn new(
        wday: u8,
        hour: u8,
        min: u8,
        runmode: RunMode,
        dhwmode: RunMode,
        legionella: bool,
        recycle: bool,
    ) -> Self {
        ScheduleEntry {
            wday,
            hour,
            min,
            runmode,
            dhwmode,
            legionella,
            recycle,
        }
    }

    pub fn minute_of_week(&self) -> u32 {
        self.wday as u32 * 24 * 60 + self.hour as u32 * 60 + self.min as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(name: String, entries: Vec<ScheduleEntry>) -> Self {
        Schedule { name, entries }
    }

    /// The entry in effect at `now`: the latest one at or before it, or the
    /// last of the previous week when `now` precedes every entry.
    pub fn current_entry(&self, now: NaiveDateTime) -> Option<&ScheduleEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let now_mow = now.weekday().num_days_from_monday() * 24 * 60
            + now.hour() * 60
            + now.minute();

        self.entries
            .iter()
            .filter(|e| e.minute_of_week() <= now_mow)
            .max_by_key(|e| e.minute_of_week())
            .or_else(|| self.entries.iter().max_by_key(|e| e.minute_of_week()))
    }
}
