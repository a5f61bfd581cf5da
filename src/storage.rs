//! Versioned blob store for warm restarts. One file per name under the
//! storage directory; a short magic header guards against foreign files and
//! a version word invalidates blobs written by an incompatible build.

use crate::error::ControlError;
use crate::hw::Hardware;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const MAGIC: &[u8; 8] = b"HEARTHD\0";
const HEADER_LEN: usize = MAGIC.len() + 4;

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: PathBuf) -> Result<Store, ControlError> {
        fs::create_dir_all(&dir).map_err(|e| {
            warn!(target: "storage", "cannot create {:?}: {}", dir, e);
            ControlError::Store
        })?;
        Ok(Store { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", name))
    }

    /// Writes via a temp file and rename so a crash never leaves a torn blob.
    pub fn dump(&self, name: &str, version: u32, bytes: &[u8]) -> Result<(), ControlError> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let write = || -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(MAGIC)?;
            f.write_all(&version.to_le_bytes())?;
            f.write_all(bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            warn!(target: "storage", "dump \"{}\" failed: {}", name, e);
            ControlError::Store
        })
    }

    /// Returns the stored version and payload. `NotFound` when the blob does
    /// not exist, `Mismatch` when it is not one of ours.
    pub fn fetch(&self, name: &str) -> Result<(u32, Vec<u8>), ControlError> {
        let path = self.path_for(name);
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ControlError::NotFound
            } else {
                warn!(target: "storage", "fetch \"{}\" failed: {}", name, e);
                ControlError::Store
            }
        })?;
        if raw.is_empty() {
            return Err(ControlError::Empty);
        }
        if raw.len() < HEADER_LEN {
            warn!(target: "storage", "blob \"{}\" is truncated", name);
            return Err(ControlError::Trunc);
        }
        if &raw[..MAGIC.len()] != MAGIC {
            warn!(target: "storage", "blob \"{}\" has a foreign header", name);
            return Err(ControlError::Mismatch);
        }
        let version = u32::from_le_bytes(raw[MAGIC.len()..HEADER_LEN].try_into().unwrap());
        Ok((version, raw[HEADER_LEN..].to_vec()))
    }
}

const RELAY_COUNTERS_VERSION: u32 = 1;
const RELAY_COUNTERS_BLOB: &str = "relay_counters";

#[derive(Serialize, Deserialize)]
struct RelayCounters {
    name: String,
    cycles: u32,
    on_secs: u64,
}

/// Persists cumulative relay runtime so wear statistics survive restarts.
pub fn save_relay_counters(store: &Store, hw: &Hardware) -> Result<(), ControlError> {
    let counters: Vec<RelayCounters> = hw
        .relay_names()
        .filter_map(|name| {
            let id = hw.output_ibn(name).ok()?;
            let (cycles, on_secs) = hw.relay_counters(id)?;
            Some(RelayCounters {
                name: name.to_owned(),
                cycles,
                on_secs,
            })
        })
        .collect();
    let bytes = serde_json::to_vec(&counters).map_err(|_| ControlError::Store)?;
    store.dump(RELAY_COUNTERS_BLOB, RELAY_COUNTERS_VERSION, &bytes)
}

/// Restores relay counters. Missing or mismatched blobs are discarded, not
/// errors: a cold start is always acceptable.
pub fn load_relay_counters(store: &Store, hw: &Hardware) {
    let (version, bytes) = match store.fetch(RELAY_COUNTERS_BLOB) {
        Ok(found) => found,
        Err(ControlError::NotFound) => return,
        Err(e) => {
            warn!(target: "storage", "relay counters unreadable: {}", e);
            return;
        }
    };
    if version != RELAY_COUNTERS_VERSION {
        warn!(
            target: "storage",
            "relay counters version {} != {}, discarding",
            version, RELAY_COUNTERS_VERSION
        );
        return;
    }
    let counters: Vec<RelayCounters> = match serde_json::from_slice(&bytes) {
        Ok(counters) => counters,
        Err(e) => {
            warn!(target: "storage", "relay counters corrupt: {}", e);
            return;
        }
    };
    for c in &counters {
        hw.restore_relay_counters(&c.name, c.cycles, c.on_secs);
    }
    info!(target: "storage", "restored counters for {} relay(s)", counters.len());
}
