//! Read-only device roster: which mesh a device lives in and how to name it
//! in logs/northbound events. Loaded once at startup from a TOML file,
//! grounded on the same `serde` + `toml` config-file idiom used for
//! [`crate::config::Config`] (`s2n-quic-qns` loads its scenario files the
//! same way: parse once, hand out an `Arc` to everything that needs it).

use crate::codec::Endpoint;
use crate::error::{Error, Kind};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRosterEntry {
    pub device_id: u16,
    pub mesh_id: [u8; 5],
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    device: Vec<DeviceRosterEntry>,
}

pub struct DeviceRoster {
    by_device_id: HashMap<u16, DeviceRosterEntry>,
}

impl DeviceRoster {
    pub fn empty() -> Self {
        Self { by_device_id: HashMap::new() }
    }

    pub fn from_map(by_device_id: HashMap<u16, DeviceRosterEntry>) -> Self {
        Self { by_device_id }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let parsed: RosterFile = toml::from_str(&text)?;
        let by_device_id = parsed
            .device
            .into_iter()
            .map(|entry| (entry.device_id, entry))
            .collect();
        Ok(Self { by_device_id })
    }

    pub fn lookup(&self, device_id: u16) -> Result<&DeviceRosterEntry, Error> {
        self.by_device_id.get(&device_id).ok_or_else(|| Kind::UnknownDevice.err())
    }

    pub fn mesh_id_for(&self, device_id: u16) -> Result<Endpoint, Error> {
        Ok(self.lookup(device_id)?.mesh_id)
    }

    pub fn len(&self) -> usize {
        self.by_device_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device_id.is_empty()
    }
}
