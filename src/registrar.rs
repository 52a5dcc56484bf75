use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    bus::{Bus, DeviceId},
    device::{Device, CACHE_LINE_SIZE},
    error::SlotError,
    registry::ConfigId,
    slot::{SlotAddress, SlotSpec},
    slot_manager::SlotManager,
};

/// Sides of the IO bus a device attaches to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoDirection {
    #[serde(rename = "I")]
    In,
    #[serde(rename = "O")]
    Out,
    #[default]
    #[serde(rename = "IO")]
    InOut,
}

impl IoDirection {
    pub fn reads(self) -> bool {
        matches!(self, IoDirection::In | IoDirection::InOut)
    }

    pub fn writes(self) -> bool {
        matches!(self, IoDirection::Out | IoDirection::InOut)
    }
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IoDirection::In => "I",
            IoDirection::Out => "O",
            IoDirection::InOut => "IO",
        };
        write!(f, "{}", label)
    }
}

/// A validated memory window: line aligned, non-empty, inside the 64K
/// address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    base: u16,
    size: u32,
}

impl MemRegion {
    pub fn new(base: u16, size: u32) -> Result<Self, SlotError> {
        let line = CACHE_LINE_SIZE as u32;
        if size == 0
            || size % line != 0
            || base as u32 % line != 0
            || base as u32 + size > 0x10000
        {
            return Err(SlotError::ConfigurationError(
                "Invalid memory specification".into(),
            ));
        }
        Ok(MemRegion { base, size })
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    fn end(&self) -> u32 {
        self.base as u32 + self.size
    }

    pub fn overlaps(&self, other: &MemRegion) -> bool {
        (self.base as u32) < other.end() && (other.base as u32) < self.end()
    }
}

/// A validated IO port claim: `num` consecutive ports starting at `base`,
/// staying within the 256-port space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPorts {
    base: u8,
    num: u16,
    direction: IoDirection,
}

impl IoPorts {
    pub fn new(base: u8, num: u16, direction: IoDirection) -> Result<Self, SlotError> {
        if num == 0 || base as u16 + num > 256 {
            return Err(SlotError::ConfigurationError(
                "Invalid IO port specification".into(),
            ));
        }
        Ok(IoPorts { base, num, direction })
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    pub fn ports(&self) -> impl Iterator<Item = u8> + '_ {
        (self.base as u16..self.base as u16 + self.num).map(|port| port as u8)
    }
}

/// One step of a device's slot ancestry, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLevel {
    Primary(SlotSpec),
    Secondary(SlotSpec),
}

/// Where a device ends up: the bus coordinate in the fully expanded view,
/// plus the coordinate to claim with the slot manager. The two differ for
/// a device in an unexpanded slot, whose claim has no secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSlot {
    pub claim: SlotAddress,
    pub primary: u8,
    pub secondary: u8,
}

/// Walks a device's ancestry to a concrete slot coordinate.
///
/// The nearest `Secondary` level supplies the secondary slot and must be a
/// literal number. The nearest `Primary` level supplies the primary slot
/// and ends the walk; a named or wildcard primary resolves through the
/// slot manager, and the descriptor's own coordinate then overrides any
/// declared secondary. No primary level at all is a configuration error.
pub fn resolve_slot(
    manager: &SlotManager,
    ancestry: &[SlotLevel],
) -> Result<ResolvedSlot, SlotError> {
    let mut declared_ss: Option<u8> = None;
    for level in ancestry {
        match level {
            SlotLevel::Secondary(spec) => {
                if declared_ss.is_some() {
                    continue;
                }
                match spec {
                    SlotSpec::Literal(ss) => declared_ss = Some(*ss),
                    other => {
                        return Err(SlotError::ConfigurationError(format!(
                            "Invalid secondary slot specification: \"{}\".",
                            other
                        )))
                    }
                }
            }
            SlotLevel::Primary(spec) => {
                let (claim, primary, secondary) = match spec {
                    SlotSpec::Literal(ps) => {
                        let claim = match declared_ss {
                            Some(ss) => SlotAddress::expanded(*ps, ss),
                            None => SlotAddress::unexpanded(*ps),
                        };
                        (claim, *ps, declared_ss.unwrap_or(0))
                    }
                    SlotSpec::Named(index) => {
                        let addr = manager.get_specific_slot(*index as usize)?;
                        (addr, addr.primary, addr.secondary.unwrap_or(0))
                    }
                    SlotSpec::Any => {
                        let addr = manager.get_any_free_slot()?;
                        (addr, addr.primary, addr.secondary.unwrap_or(0))
                    }
                    SlotSpec::Reserved(ps) => {
                        return Err(SlotError::ConfigurationError(format!(
                            "Reserved slot {} cannot hold a device",
                            ps
                        )))
                    }
                };
                return Ok(ResolvedSlot { claim, primary, secondary });
            }
        }
    }
    Err(SlotError::ConfigurationError(
        "Invalid memory specification".into(),
    ))
}

/// Everything needed to undo one device's registration.
#[derive(Debug)]
pub struct DeviceBinding {
    pub device: DeviceId,
    pub slot: Option<ResolvedSlot>,
    pub regions: Vec<MemRegion>,
    pub ports: Vec<IoPorts>,
}

/// Attaches a device to the bus under `config`'s ownership.
///
/// Every precondition is checked before the first mutation, so a failed
/// bind leaves bus and slot manager exactly as they were. A device with no
/// memory regions needs no slot at all and never touches the slot manager.
pub fn bind_device(
    bus: &mut Bus,
    manager: &mut SlotManager,
    config: ConfigId,
    device: Box<dyn Device>,
    ancestry: &[SlotLevel],
    regions: Vec<MemRegion>,
    ports: Vec<IoPorts>,
) -> Result<DeviceBinding, SlotError> {
    let slot = if regions.is_empty() {
        None
    } else {
        Some(resolve_slot(manager, ancestry)?)
    };

    for (index, region) in regions.iter().enumerate() {
        if regions[index + 1..].iter().any(|other| region.overlaps(other)) {
            return Err(SlotError::ConfigurationError(
                "Invalid memory specification".into(),
            ));
        }
    }
    if let Some(resolved) = &slot {
        for region in &regions {
            bus.check_mem_device(resolved.primary, resolved.secondary, region.base(), region.size())?;
        }
        manager.allocate_slot(resolved.claim, config)?;
    }

    let name = device.name().to_string();
    let id = bus.add_device(device);
    if let Some(resolved) = &slot {
        for region in &regions {
            bus.register_mem_device(id, resolved.primary, resolved.secondary, region.base(), region.size())?;
        }
        tracing::debug!(
            "[REGISTRAR] Bound {} to slot {}-{} for {}",
            name,
            resolved.primary,
            resolved.secondary,
            config
        );
    } else {
        tracing::debug!("[REGISTRAR] Bound {} for {}", name, config);
    }
    for io in &ports {
        for port in io.ports() {
            if io.direction().reads() {
                bus.register_in_port(id, port);
            }
            if io.direction().writes() {
                bus.register_out_port(id, port);
            }
        }
    }

    Ok(DeviceBinding { device: id, slot, regions, ports })
}

/// Reverses `bind_device` and hands the device back.
pub fn unbind_device(
    bus: &mut Bus,
    manager: &mut SlotManager,
    config: ConfigId,
    binding: DeviceBinding,
) -> Box<dyn Device> {
    for io in &binding.ports {
        for port in io.ports() {
            if io.direction().reads() {
                bus.unregister_in_port(binding.device, port);
            }
            if io.direction().writes() {
                bus.unregister_out_port(binding.device, port);
            }
        }
    }
    if let Some(resolved) = &binding.slot {
        for region in &binding.regions {
            bus.unregister_mem_device(
                binding.device,
                resolved.primary,
                resolved.secondary,
                region.base(),
                region.size(),
            );
        }
        manager.free_slot(resolved.claim, config);
    }
    bus.remove_device(binding.device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_must_be_aligned_and_in_range() {
        assert!(MemRegion::new(0x4000, 0x4000).is_ok());
        assert!(MemRegion::new(0x0000, 0x10000).is_ok());
        assert!(MemRegion::new(0x0100, 0x100).is_ok());
        assert!(MemRegion::new(0x4000, 0).is_err());
        assert!(MemRegion::new(0x4001, 0x100).is_err());
        assert!(MemRegion::new(0x0100, 0x50).is_err());
        assert!(MemRegion::new(0x4000, 0x123).is_err());
        assert!(MemRegion::new(0xFF00, 0x200).is_err());
    }

    #[test]
    fn regions_know_their_overlaps() {
        let a = MemRegion::new(0x4000, 0x4000).unwrap();
        let b = MemRegion::new(0x7F00, 0x100).unwrap();
        let c = MemRegion::new(0x8000, 0x4000).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!b.overlaps(&c));
    }

    #[test]
    fn port_claims_stay_inside_the_io_space() {
        assert!(IoPorts::new(0xFE, 2, IoDirection::InOut).is_ok());
        assert!(IoPorts::new(0xFE, 3, IoDirection::InOut).is_err());
        assert!(IoPorts::new(0x10, 0, IoDirection::In).is_err());
        let all = IoPorts::new(0x00, 256, IoDirection::Out).unwrap();
        assert_eq!(all.ports().count(), 256);
    }
}
