//! Temperature backend fed by a JSON file that an external sampler rewrites
//! continuously. The file carries its own timestamps, so a sampler that died
//! is detected even though the file still parses.

use super::{HwBackend, HwError};
use crate::measure::Temp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, trace, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// How old the file is allowed to be before being considered invalid.
const MAX_FILE_AGE: i64 = 60;
/// How old a single reading is allowed to be before being rejected.
const MAX_READING_AGE: i64 = 90;

pub struct FileBackend {
    file: PathBuf,
    /// Channel index -> sensor name in the file.
    names: Vec<String>,
    last_data: Option<TempsFileData>,
    snapshot: Vec<Temp>,
}

impl FileBackend {
    pub fn new(file: PathBuf, names: Vec<String>) -> Self {
        let count = names.len();
        FileBackend {
            file,
            names,
            last_data: None,
            snapshot: vec![Temp::UNSET; count],
        }
    }

    fn read_temps_data(&self) -> Result<TempsFileData, String> {
        let s = fs::read_to_string(&self.file)
            .map_err(|e| format!("Failed to read {:?}: {}", self.file, e))?;

        serde_json::from_str(&s)
            .map_err(|e| format!("Failed to deserialize {:?}: {}", self.file, e))
    }
}

#[async_trait]
impl HwBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn online(&mut self) -> Result<(), HwError> {
        match self.read_temps_data() {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(target: "hw", "temps file not usable: {}", e);
                Err(HwError::Offline)
            }
        }
    }

    async fn input(&mut self) -> Result<(), HwError> {
        let data = match self.read_temps_data() {
            Ok(data) => {
                self.last_data = Some(data.clone());
                data
            }
            Err(e) => match &self.last_data {
                Some(previous) => {
                    warn!(target: "hw", "error reading current data: {}, using last valid", e);
                    previous.clone()
                }
                None => {
                    error!(target: "hw", "{} and no last data available", e);
                    return Err(HwError::Hardware);
                }
            },
        };

        let now = Utc::now();
        let file_age = (now - data.timestamp).num_seconds();
        if file_age > MAX_FILE_AGE {
            error!(
                target: "hw",
                "{:?} is {}s old - is it being updated?",
                self.file, file_age
            );
            return Err(HwError::Hardware);
        }

        for (channel, name) in self.names.iter().enumerate() {
            self.snapshot[channel] = match data.temps.get(name) {
                Some(reading) => {
                    let reading_age = (now - reading.timestamp).num_seconds();
                    if reading_age > MAX_READING_AGE {
                        error!(
                            target: "hw",
                            "rejecting {} reading, {}s old - treating it as having no value",
                            name, reading_age
                        );
                        Temp::INVALID
                    } else {
                        trace!(target: "hw", "{} = {} ({}s old)", name, reading.value, reading_age);
                        Temp::from_celsius(reading.value)
                    }
                }
                None => Temp::DISCON,
            };
        }
        Ok(())
    }

    fn input_value(&self, channel: usize) -> Result<Temp, HwError> {
        self.snapshot
            .get(channel)
            .copied()
            .ok_or(HwError::NotConfigured)
    }

    fn output_state_set(&mut self, _channel: usize, _on: bool) -> Result<(), HwError> {
        Err(HwError::NotImplemented)
    }

    fn output_state_get(&self, _channel: usize) -> Result<bool, HwError> {
        Err(HwError::NotImplemented)
    }

    async fn output(&mut self) -> Result<(), HwError> {
        Ok(())
    }

    async fn offline(&mut self) -> Result<(), HwError> {
        Ok(())
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct TempsFileData {
    timestamp: DateTime<Utc>,
    temps: HashMap<String, TimestampedTemperature>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct TimestampedTemperature {
    value: f64,
    timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    const EXAMPLE_DATA: &str = r#"
    {
        "temps": {
            "outdoor": {
                "timestamp": "2024-01-03T19:51:42Z",
                "value": -4.79
            },
            "boiler_out": {
                "timestamp": "2024-01-03T19:51:29Z",
                "value": 62.58
            }
        },
        "timestamp": "2024-01-03T19:51:42Z"
    }
    "#;

    #[test]
    fn test_deserialize() {
        let file_data: TempsFileData = serde_json::from_str(EXAMPLE_DATA).unwrap();
        assert_eq!(file_data.temps.len(), 2);
        assert_eq!(file_data.temps["outdoor"].value, -4.79);
        assert_eq!(file_data.temps["boiler_out"].value, 62.58);
    }
}
