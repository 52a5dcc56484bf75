pub mod bus;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod machine;
pub mod registrar;
pub mod registry;
pub mod slot;
pub mod slot_manager;

pub use bus::{Bus, DeviceId};
pub use config::HardwareDef;
pub use device::Device;
pub use error::SlotError;
pub use machine::{Machine, MachineBuilder};
pub use registry::ConfigId;
pub use slot::{SlotAddress, SlotSpec};
pub use slot_manager::{ExternalSlotInfo, SlotManager};

/// The classic layout: system ROM in slot 0, two cartridge bays, RAM in
/// slot 3.
pub fn canonical_machine(bios: &[u8]) -> anyhow::Result<Machine> {
    MachineBuilder::new("msx1")
        .rom_slot("0", bios, 0x0000, 0x8000)
        .external_slot("1")
        .external_slot("2")
        .ram_slot("3", 0x0000, 0x10000)
        .build()
}
