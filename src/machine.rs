use std::{cell::RefCell, fmt, fs, path::Path, rc::Rc};

use crate::{
    bus::Bus,
    config::{DeviceDef, DeviceKind, HardwareDef, MemRegionDef, PrimaryDef, RomDef, SecondaryDef},
    device::Device,
    devices::{Empty, Ram, Rom},
    error::SlotError,
    registrar::{self, DeviceBinding, IoPorts, MemRegion, SlotLevel},
    registry::{ConfigId, ConfigRegistry},
    slot::{SlotAddress, SlotSpec},
    slot_manager::{ExternalSlotInfo, SlotManager},
};

/// Everything one hardware definition contributed to the machine, in the
/// order it was set up. Unloading pops each list in reverse.
struct HardwareUnit {
    id: ConfigId,
    name: String,
    extension: bool,
    bindings: Vec<DeviceBinding>,
    created_slots: Vec<SlotAddress>,
    claimed_slots: Vec<SlotAddress>,
    allocated_primaries: Vec<u8>,
    expanded: Vec<u8>,
}

impl HardwareUnit {
    fn new(id: ConfigId, name: String, extension: bool) -> Self {
        HardwareUnit {
            id,
            name,
            extension,
            bindings: Vec::new(),
            created_slots: Vec::new(),
            claimed_slots: Vec::new(),
            allocated_primaries: Vec::new(),
            expanded: Vec::new(),
        }
    }
}

/// An assembled machine: the bus plus the slot bookkeeping for every
/// loaded hardware unit. The base definition loads first; extensions and
/// cartridges come and go afterwards through the insert/remove calls.
pub struct Machine {
    pub bus: Rc<RefCell<Bus>>,
    registry: Rc<RefCell<ConfigRegistry>>,
    slot_manager: SlotManager,
    units: Vec<HardwareUnit>,
}

impl Machine {
    pub fn new() -> Self {
        let registry = Rc::new(RefCell::new(ConfigRegistry::new()));
        Machine {
            bus: Rc::new(RefCell::new(Bus::new())),
            slot_manager: SlotManager::new(registry.clone()),
            registry,
            units: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Machine> {
        let def = HardwareDef::from_json(json)?;
        let mut machine = Machine::new();
        machine.load_unit(&def, false)?;
        Ok(machine)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Machine> {
        let def = HardwareDef::from_json_file(path)?;
        let mut machine = Machine::new();
        machine.load_unit(&def, false)?;
        Ok(machine)
    }

    // --- unit loading ---------------------------------------------------

    /// Loads one definition. On any failure everything the definition
    /// already set up is rolled back before the error is returned.
    fn load_unit(&mut self, def: &HardwareDef, extension: bool) -> anyhow::Result<()> {
        let id = self.registry.borrow_mut().register(&def.name);
        tracing::info!("[MACHINE] Loading {} as {}", def.name, id);
        let mut unit = HardwareUnit::new(id, def.name.clone(), extension);
        match self.load_slots(&mut unit, def) {
            Ok(()) => {
                self.units.push(unit);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("[MACHINE] Loading {} failed: {}", def.name, err);
                self.unload_unit(unit);
                Err(err)
            }
        }
    }

    fn load_slots(&mut self, unit: &mut HardwareUnit, def: &HardwareDef) -> anyhow::Result<()> {
        for primary in &def.slots {
            self.load_primary(unit, primary)?;
        }
        for device in &def.devices {
            self.bind_def_device(unit, device, &[])?;
        }
        Ok(())
    }

    fn load_primary(&mut self, unit: &mut HardwareUnit, def: &PrimaryDef) -> anyhow::Result<()> {
        let spec: SlotSpec = def.slot.parse()?;
        match spec {
            SlotSpec::Reserved(ps) => {
                if !def.secondaries.is_empty() || !def.devices.is_empty() {
                    return Err(SlotError::ConfigurationError(format!(
                        "Reserved slot {} cannot hold a device",
                        ps
                    ))
                    .into());
                }
                let addr = SlotAddress::unexpanded(ps);
                self.slot_manager.create_external_slot(addr)?;
                unit.created_slots.push(addr);
                Ok(())
            }
            SlotSpec::Literal(ps) => {
                if def.external {
                    if !def.secondaries.is_empty() {
                        return Err(SlotError::ConfigurationError(
                            "An external slot cannot declare secondary slots".into(),
                        )
                        .into());
                    }
                    let addr = SlotAddress::unexpanded(ps);
                    self.slot_manager.create_external_slot(addr)?;
                    unit.created_slots.push(addr);
                }
                if !def.secondaries.is_empty() {
                    self.bus.borrow_mut().set_expanded(ps);
                    unit.expanded.push(ps);
                    for secondary in &def.secondaries {
                        self.load_secondary(unit, secondary, ps)?;
                    }
                }
                let ancestry = [SlotLevel::Primary(SlotSpec::Literal(ps))];
                for device in &def.devices {
                    self.bind_def_device(unit, device, &ancestry)?;
                }
                Ok(())
            }
            SlotSpec::Named(_) | SlotSpec::Any => {
                if def.external {
                    return Err(SlotError::ConfigurationError(
                        "Only a numbered slot can be declared external".into(),
                    )
                    .into());
                }
                let addr = self.resolve_primary_node(unit, spec, !def.secondaries.is_empty())?;
                tracing::debug!("[MACHINE] Resolved slot {} to {}", def.slot, addr);
                if !def.secondaries.is_empty() {
                    self.bus.borrow_mut().set_expanded(addr.primary);
                    unit.expanded.push(addr.primary);
                    for secondary in &def.secondaries {
                        self.load_secondary(unit, secondary, addr.primary)?;
                    }
                }
                let ancestry = synthetic_ancestry(addr);
                for device in &def.devices {
                    self.bind_def_device(unit, device, &ancestry)?;
                }
                Ok(())
            }
        }
    }

    /// Resolves a named or wildcard primary node to a concrete coordinate,
    /// once for the whole unit, so sibling devices all land in the same
    /// slot. A unit that brings secondary slots needs a whole unexpanded
    /// primary to itself and claims it up front.
    fn resolve_primary_node(
        &mut self,
        unit: &mut HardwareUnit,
        spec: SlotSpec,
        wants_secondaries: bool,
    ) -> Result<SlotAddress, SlotError> {
        if !wants_secondaries {
            return match spec {
                SlotSpec::Named(index) => self.slot_manager.get_specific_slot(index as usize),
                SlotSpec::Any => self.slot_manager.get_any_free_slot(),
                _ => unreachable!(),
            };
        }
        match spec {
            SlotSpec::Any => {
                let ps = self.slot_manager.allocate_primary_slot(unit.id)?;
                unit.allocated_primaries.push(ps);
                Ok(SlotAddress::unexpanded(ps))
            }
            SlotSpec::Named(index) => {
                let addr = self.slot_manager.get_specific_slot(index as usize)?;
                if addr.secondary.is_some() {
                    return Err(SlotError::ConfigurationError(format!(
                        "Slot {} cannot be expanded",
                        addr
                    )));
                }
                self.slot_manager.allocate_slot(addr, unit.id)?;
                unit.claimed_slots.push(addr);
                Ok(addr)
            }
            _ => unreachable!(),
        }
    }

    fn load_secondary(
        &mut self,
        unit: &mut HardwareUnit,
        def: &SecondaryDef,
        ps: u8,
    ) -> anyhow::Result<()> {
        let spec: SlotSpec = def.slot.parse()?;
        let ss = match spec {
            SlotSpec::Literal(ss) => ss,
            other => {
                return Err(SlotError::ConfigurationError(format!(
                    "Invalid secondary slot specification: \"{}\".",
                    other
                ))
                .into())
            }
        };
        if def.external {
            let addr = SlotAddress::expanded(ps, ss);
            self.slot_manager.create_external_slot(addr)?;
            unit.created_slots.push(addr);
        }
        let ancestry = [
            SlotLevel::Secondary(SlotSpec::Literal(ss)),
            SlotLevel::Primary(SlotSpec::Literal(ps)),
        ];
        for device in &def.devices {
            self.bind_def_device(unit, device, &ancestry)?;
        }
        Ok(())
    }

    fn bind_def_device(
        &mut self,
        unit: &mut HardwareUnit,
        def: &DeviceDef,
        ancestry: &[SlotLevel],
    ) -> anyhow::Result<()> {
        let regions = def
            .mem
            .iter()
            .map(|region| MemRegion::new(region.base, region.size))
            .collect::<Result<Vec<_>, _>>()?;
        let ports = def
            .io
            .iter()
            .map(|io| IoPorts::new(io.base, io.num, io.direction))
            .collect::<Result<Vec<_>, _>>()?;
        let device = instantiate_device(def, &regions)?;
        let binding = registrar::bind_device(
            &mut self.bus.borrow_mut(),
            &mut self.slot_manager,
            unit.id,
            device,
            ancestry,
            regions,
            ports,
        )?;
        unit.bindings.push(binding);
        Ok(())
    }

    // --- unit removal ---------------------------------------------------

    /// Every external slot this unit created must be free or owned by the
    /// unit itself before it can go.
    fn check_removable(&self, unit: &HardwareUnit) -> Result<(), SlotError> {
        for &addr in &unit.created_slots {
            self.slot_manager.test_remove_external_slot(addr, unit.id)?;
        }
        Ok(())
    }

    fn unload_unit(&mut self, mut unit: HardwareUnit) {
        tracing::info!("[MACHINE] Unloading {}", unit.name);
        {
            let mut bus = self.bus.borrow_mut();
            while let Some(binding) = unit.bindings.pop() {
                registrar::unbind_device(&mut bus, &mut self.slot_manager, unit.id, binding);
            }
            while let Some(ps) = unit.expanded.pop() {
                bus.unset_expanded(ps);
            }
        }
        while let Some(addr) = unit.claimed_slots.pop() {
            self.slot_manager.free_slot(addr, unit.id);
        }
        while let Some(ps) = unit.allocated_primaries.pop() {
            self.slot_manager.free_primary_slot(ps, unit.id);
        }
        while let Some(addr) = unit.created_slots.pop() {
            if let Err(err) = self.slot_manager.remove_external_slot(addr) {
                panic!("external slot {} not removable during unload: {}", addr, err);
            }
        }
        self.registry.borrow_mut().unregister(unit.id);
    }

    // --- extensions and cartridges ---------------------------------------

    pub fn insert_extension(&mut self, def: &HardwareDef) -> anyhow::Result<()> {
        self.load_unit(def, true)
    }

    pub fn remove_extension(&mut self, name: &str) -> anyhow::Result<()> {
        let index = self
            .units
            .iter()
            .position(|unit| unit.extension && unit.name == name)
            .ok_or_else(|| {
                SlotError::ConfigurationError(format!("No such extension: {}", name))
            })?;
        self.check_removable(&self.units[index])?;
        let unit = self.units.remove(index);
        self.unload_unit(unit);
        Ok(())
    }

    /// Puts a plain ROM cartridge in a slot. `slot` is a letter name or
    /// `"any"`; inserting into an occupied named slot replaces whatever is
    /// there, like swapping physical cartridges.
    pub fn insert_cartridge(&mut self, slot: &str, image: &[u8], name: &str) -> anyhow::Result<()> {
        let spec: SlotSpec = slot.parse()?;
        let index = match spec {
            SlotSpec::Named(index) => Some(index as usize),
            SlotSpec::Any => None,
            _ => return Err(SlotError::InvalidSlotSpecification(slot.to_string()).into()),
        };
        if let Some(index) = index {
            if let Some(owner) = self.slot_manager.slot_owner(index)? {
                self.remove_occupant(owner)?;
            }
        }
        let def = cartridge_def(slot, image, name)?;
        self.load_unit(&def, true)
    }

    pub fn insert_cartridge_from_file(
        &mut self,
        slot: &str,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        let image = fs::read(path)
            .map_err(|err| anyhow::anyhow!("Failed to read ROM image {}: {}", path.display(), err))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("cartridge");
        self.insert_cartridge(slot, &image, name)
    }

    /// Takes the cartridge out of a named slot. An empty slot is fine.
    pub fn eject_cartridge(&mut self, slot: &str) -> anyhow::Result<()> {
        let spec: SlotSpec = slot.parse()?;
        let index = match spec {
            SlotSpec::Named(index) => index as usize,
            _ => return Err(SlotError::InvalidSlotSpecification(slot.to_string()).into()),
        };
        match self.slot_manager.slot_owner(index)? {
            Some(owner) => self.remove_occupant(owner),
            None => {
                tracing::info!("[MACHINE] Slot {} is already empty", slot);
                Ok(())
            }
        }
    }

    fn remove_occupant(&mut self, owner: ConfigId) -> anyhow::Result<()> {
        let position = self.units.iter().position(|unit| unit.id == owner);
        match position {
            Some(index) if self.units[index].extension => {
                self.check_removable(&self.units[index])?;
                let unit = self.units.remove(index);
                self.unload_unit(unit);
                Ok(())
            }
            _ => Err(SlotError::SlotInUse.into()),
        }
    }

    // --- queries ----------------------------------------------------------

    pub fn external_slots(&self) -> Vec<ExternalSlotInfo> {
        self.slot_manager.external_slots()
    }

    pub fn slot_info(&self, name: &str) -> Result<ExternalSlotInfo, SlotError> {
        self.slot_manager.slot_info(name)
    }

    pub fn extensions(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|unit| unit.extension)
            .map(|unit| unit.name.as_str())
            .collect()
    }

    // --- bus access --------------------------------------------------------

    pub fn read_byte(&mut self, address: u16) -> u8 {
        self.bus.borrow_mut().read_byte(address)
    }

    pub fn peek_byte(&self, address: u16) -> u8 {
        self.bus.borrow().peek_byte(address)
    }

    pub fn write_byte(&mut self, address: u16, value: u8) {
        self.bus.borrow_mut().write_byte(address, value);
    }

    pub fn read_word(&mut self, address: u16) -> u16 {
        self.bus.borrow_mut().read_word(address)
    }

    pub fn write_word(&mut self, address: u16, value: u16) {
        self.bus.borrow_mut().write_word(address, value);
    }

    pub fn input(&mut self, port: u8) -> u8 {
        self.bus.borrow_mut().input(port)
    }

    pub fn output(&mut self, port: u8, value: u8) {
        self.bus.borrow_mut().output(port, value);
    }

    pub fn primary_slot_config(&self) -> u8 {
        self.bus.borrow().primary_slot_config()
    }

    pub fn set_primary_slot_config(&mut self, value: u8) {
        self.bus.borrow_mut().set_primary_slot_config(value);
    }

    pub fn reset(&mut self) {
        tracing::info!("[MACHINE] Reset");
        self.bus.borrow_mut().reset();
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field(
                "units",
                &self.units.iter().map(|unit| unit.name.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        while let Some(unit) = self.units.pop() {
            self.unload_unit(unit);
        }
    }
}

fn synthetic_ancestry(addr: SlotAddress) -> Vec<SlotLevel> {
    let mut ancestry = Vec::new();
    if let Some(ss) = addr.secondary {
        ancestry.push(SlotLevel::Secondary(SlotSpec::Literal(ss)));
    }
    ancestry.push(SlotLevel::Primary(SlotSpec::Literal(addr.primary)));
    ancestry
}

fn instantiate_device(def: &DeviceDef, regions: &[MemRegion]) -> anyhow::Result<Box<dyn Device>> {
    match &def.kind {
        DeviceKind::Ram => {
            let region = single_region(def, regions)?;
            Ok(Box::new(Ram::new(
                &def.id,
                region.base(),
                region.size() as usize,
            )))
        }
        DeviceKind::Rom(rom) => {
            let region = single_region(def, regions)?;
            let image = rom_image(rom, &def.id)?;
            Ok(Box::new(Rom::new(
                &def.id,
                region.base(),
                region.size() as usize,
                &image,
            )))
        }
        DeviceKind::Empty => Ok(Box::new(Empty::new(&def.id))),
    }
}

fn single_region<'a>(def: &DeviceDef, regions: &'a [MemRegion]) -> Result<&'a MemRegion, SlotError> {
    match regions {
        [region] if region.size().is_power_of_two() => Ok(region),
        _ => Err(SlotError::ConfigurationError(format!(
            "Device {} needs exactly one power-of-two memory region",
            def.id
        ))),
    }
}

fn rom_image(rom: &RomDef, id: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(image) = &rom.image {
        if image.is_empty() {
            anyhow::bail!("ROM image for {} is empty", id);
        }
        return Ok(image.clone());
    }
    if let Some(path) = &rom.path {
        let image = fs::read(path)
            .map_err(|err| anyhow::anyhow!("Failed to read ROM image {}: {}", path, err))?;
        if image.is_empty() {
            anyhow::bail!("ROM image {} is empty", path);
        }
        return Ok(image);
    }
    anyhow::bail!("ROM device {} has neither an image nor a path", id)
}

fn cartridge_def(slot: &str, image: &[u8], name: &str) -> anyhow::Result<HardwareDef> {
    if image.is_empty() {
        anyhow::bail!("ROM image for {} is empty", name);
    }
    let size: u32 = if image.len() <= 0x4000 {
        0x4000
    } else if image.len() <= 0x8000 {
        0x8000
    } else {
        anyhow::bail!(
            "ROM image for {} is {} bytes; plain cartridges hold at most 32K",
            name,
            image.len()
        );
    };
    Ok(HardwareDef {
        name: name.to_string(),
        slots: vec![PrimaryDef {
            slot: slot.to_string(),
            external: false,
            secondaries: Vec::new(),
            devices: vec![DeviceDef {
                id: name.to_string(),
                kind: DeviceKind::Rom(RomDef {
                    path: None,
                    image: Some(image.to_vec()),
                }),
                mem: vec![MemRegionDef { base: 0x4000, size }],
                io: Vec::new(),
            }],
        }],
        devices: Vec::new(),
    })
}

/// Builds the base machine definition a slot at a time, in the classic
/// layout: system ROM low, RAM high, cartridge bays in between.
#[derive(Default)]
pub struct MachineBuilder {
    name: String,
    slots: Vec<PrimaryDef>,
}

impl MachineBuilder {
    pub fn new(name: &str) -> Self {
        MachineBuilder {
            name: name.to_string(),
            slots: Vec::new(),
        }
    }

    pub fn ram_slot(&mut self, slot: &str, base: u16, size: u32) -> &mut Self {
        self.slots.push(PrimaryDef {
            slot: slot.to_string(),
            external: false,
            secondaries: Vec::new(),
            devices: vec![DeviceDef {
                id: format!("ram-{}", slot),
                kind: DeviceKind::Ram,
                mem: vec![MemRegionDef { base, size }],
                io: Vec::new(),
            }],
        });
        self
    }

    pub fn rom_slot(&mut self, slot: &str, image: &[u8], base: u16, size: u32) -> &mut Self {
        self.slots.push(PrimaryDef {
            slot: slot.to_string(),
            external: false,
            secondaries: Vec::new(),
            devices: vec![DeviceDef {
                id: format!("rom-{}", slot),
                kind: DeviceKind::Rom(RomDef {
                    path: None,
                    image: Some(image.to_vec()),
                }),
                mem: vec![MemRegionDef { base, size }],
                io: Vec::new(),
            }],
        });
        self
    }

    pub fn empty_slot(&mut self, slot: &str) -> &mut Self {
        self.slots.push(PrimaryDef {
            slot: slot.to_string(),
            external: false,
            secondaries: Vec::new(),
            devices: vec![DeviceDef {
                id: format!("empty-{}", slot),
                kind: DeviceKind::Empty,
                mem: vec![MemRegionDef { base: 0x0000, size: 0x10000 }],
                io: Vec::new(),
            }],
        });
        self
    }

    pub fn external_slot(&mut self, slot: &str) -> &mut Self {
        self.slots.push(PrimaryDef {
            slot: slot.to_string(),
            external: true,
            secondaries: Vec::new(),
            devices: Vec::new(),
        });
        self
    }

    pub fn build(&self) -> anyhow::Result<Machine> {
        let def = HardwareDef {
            name: self.name.clone(),
            slots: self.slots.clone(),
            devices: Vec::new(),
        };
        let mut machine = Machine::new();
        machine.load_unit(&def, false)?;
        Ok(machine)
    }
}
