use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::registrar::IoDirection;

/// A machine or extension definition: the slot tree plus any slotless
/// (IO-only) devices, as loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDef {
    pub name: String,
    #[serde(default)]
    pub slots: Vec<PrimaryDef>,
    #[serde(default)]
    pub devices: Vec<DeviceDef>,
}

impl HardwareDef {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse hardware definition")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read hardware definition {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse hardware definition {}", path.display()))
    }
}

/// One primary slot node. `slot` is a slot token; `external` declares the
/// slot as a cartridge bay; declaring `secondaries` expands the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryDef {
    pub slot: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub secondaries: Vec<SecondaryDef>,
    #[serde(default)]
    pub devices: Vec<DeviceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryDef {
    pub slot: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub devices: Vec<DeviceDef>,
}

/// One device: what it is, which memory windows it covers, which IO ports
/// it listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub mem: Vec<MemRegionDef>,
    #[serde(default)]
    pub io: Vec<IoPortDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "device")]
pub enum DeviceKind {
    #[serde(rename = "ram")]
    Ram,
    #[serde(rename = "rom")]
    Rom(RomDef),
    #[serde(rename = "empty")]
    Empty,
}

/// ROM contents come either inline or from a file; inline wins when both
/// are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RomDef {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemRegionDef {
    pub base: u16,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IoPortDef {
    pub base: u8,
    #[serde(default = "default_num")]
    pub num: u16,
    #[serde(default, rename = "type")]
    pub direction: IoDirection,
}

fn default_num() -> u16 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_machine_definition() {
        let json = r#"{
            "name": "test-machine",
            "slots": [
                {
                    "slot": "3",
                    "secondaries": [
                        {
                            "slot": "0",
                            "devices": [
                                {
                                    "id": "main-ram",
                                    "device": "ram",
                                    "mem": [{ "base": 0, "size": 65536 }]
                                }
                            ]
                        },
                        { "slot": "2", "external": true }
                    ]
                }
            ],
            "devices": [
                {
                    "id": "probe",
                    "device": "empty",
                    "io": [{ "base": 152, "num": 2, "type": "O" }, { "base": 168 }]
                }
            ]
        }"#;
        let def = HardwareDef::from_json(json).unwrap();
        assert_eq!(def.name, "test-machine");

        let primary = &def.slots[0];
        assert_eq!(primary.slot, "3");
        assert!(!primary.external);
        assert_eq!(primary.secondaries.len(), 2);
        assert!(primary.secondaries[1].external);
        assert!(matches!(
            primary.secondaries[0].devices[0].kind,
            DeviceKind::Ram
        ));

        let io = &def.devices[0].io;
        assert_eq!(io[0].direction, IoDirection::Out);
        assert_eq!(io[0].num, 2);
        assert_eq!(io[1].num, 1);
        assert_eq!(io[1].direction, IoDirection::InOut);
    }

    #[test]
    fn rom_devices_carry_inline_images_or_paths() {
        let json = r#"{
            "name": "cart",
            "slots": [
                {
                    "slot": "any",
                    "devices": [
                        {
                            "id": "game",
                            "device": "rom",
                            "image": [1, 2, 3],
                            "mem": [{ "base": 16384, "size": 16384 }]
                        }
                    ]
                }
            ]
        }"#;
        let def = HardwareDef::from_json(json).unwrap();
        match &def.slots[0].devices[0].kind {
            DeviceKind::Rom(rom) => {
                assert_eq!(rom.image.as_deref(), Some(&[1, 2, 3][..]));
                assert!(rom.path.is_none());
            }
            other => panic!("expected a ROM device, got {:?}", other),
        }
    }
}
