use crate::{
    device::{unmapped_line, Device, CACHE_LINE_BITS, CACHE_LINE_COUNT, CACHE_LINE_HIGH, CACHE_LINE_LOW},
    error::SlotError,
};

/// Handle to a device registered with the bus. Stays valid until the
/// device is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// The memory and IO interconnect.
///
/// Memory is routed in two steps: the primary slot config register picks a
/// primary slot per 16K page, and for an expanded primary that slot's
/// sub-slot register picks the secondary slot. The selected (primary,
/// secondary) pair then resolves through a per-cache-line device map.
/// Address 0xFFFF doubles as the sub-slot register of whichever expanded
/// primary is visible in page 3, reading back inverted.
///
/// IO ports carry lists of devices: input reads combine by AND, as on the
/// open-collector bus, and output writes fan out to every listener.
pub struct Bus {
    devices: Vec<Option<Box<dyn Device>>>,
    mem_layout: [[[Option<DeviceId>; CACHE_LINE_COUNT]; 4]; 4],
    io_in: [Vec<DeviceId>; 256],
    io_out: [Vec<DeviceId>; 256],
    primary_slot_config: u8,
    sub_slot_register: [u8; 4],
    expanded: [u8; 4],
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            devices: Vec::new(),
            mem_layout: [[[None; CACHE_LINE_COUNT]; 4]; 4],
            io_in: std::array::from_fn(|_| Vec::new()),
            io_out: std::array::from_fn(|_| Vec::new()),
            primary_slot_config: 0,
            sub_slot_register: [0; 4],
            expanded: [0; 4],
        }
    }

    // --- devices -------------------------------------------------------

    pub fn add_device(&mut self, device: Box<dyn Device>) -> DeviceId {
        tracing::debug!("[BUS] Added device {}", device.name());
        for (index, entry) in self.devices.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(device);
                return DeviceId(index as u32);
            }
        }
        self.devices.push(Some(device));
        DeviceId((self.devices.len() - 1) as u32)
    }

    /// Removes a device. All of its memory and IO registrations must be
    /// gone first.
    pub fn remove_device(&mut self, id: DeviceId) -> Box<dyn Device> {
        debug_assert!(!self.is_bound(id), "device removed while still mapped");
        let device = self.devices[id.index()].take().expect("stale device id");
        tracing::debug!("[BUS] Removed device {}", device.name());
        device
    }

    pub fn device(&self, id: DeviceId) -> &dyn Device {
        self.devices[id.index()].as_deref().expect("stale device id")
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut (dyn Device + 'static) {
        self.devices[id.index()].as_deref_mut().expect("stale device id")
    }

    fn is_bound(&self, id: DeviceId) -> bool {
        let mem = self
            .mem_layout
            .iter()
            .flatten()
            .flatten()
            .any(|&cell| cell == Some(id));
        let io = self
            .io_in
            .iter()
            .chain(self.io_out.iter())
            .any(|list| list.contains(&id));
        mem || io
    }

    // --- slot expansion ------------------------------------------------

    /// Marks a primary slot expanded. Calls stack; the slot stays expanded
    /// until every caller has undone its own.
    pub fn set_expanded(&mut self, ps: u8) {
        let ps = ps as usize;
        assert!(ps < 4);
        if self.expanded[ps] == 0 {
            tracing::debug!("[BUS] Primary slot {} expanded", ps);
        }
        self.expanded[ps] += 1;
    }

    pub fn unset_expanded(&mut self, ps: u8) {
        let ps = ps as usize;
        assert!(ps < 4);
        assert!(self.expanded[ps] > 0);
        self.expanded[ps] -= 1;
        if self.expanded[ps] == 0 {
            debug_assert!(
                !self.has_secondary_devices(ps),
                "primary slot {} unexpanded with secondary devices still mapped",
                ps
            );
            tracing::debug!("[BUS] Primary slot {} no longer expanded", ps);
        }
    }

    pub fn is_expanded(&self, ps: u8) -> bool {
        self.expanded[ps as usize] > 0
    }

    fn has_secondary_devices(&self, ps: usize) -> bool {
        self.mem_layout[ps][1..].iter().flatten().any(Option::is_some)
    }

    // --- memory registration -------------------------------------------

    /// Read-only version of `register_mem_device`, for callers that must
    /// know registration will succeed before committing other state.
    pub fn check_mem_device(&self, ps: u8, ss: u8, base: u16, size: u32) -> Result<(), SlotError> {
        debug_assert!(ps < 4 && ss < 4);
        if ss != 0 && !self.is_expanded(ps) {
            return Err(SlotError::ConfigurationError(format!(
                "Invalid secondary slot specification: \"{}\".",
                ss
            )));
        }
        let first = (base >> CACHE_LINE_BITS) as usize;
        let count = (size >> CACHE_LINE_BITS) as usize;
        for line in first..first + count {
            if let Some(id) = self.mem_layout[ps as usize][ss as usize][line] {
                return Err(SlotError::ConfigurationError(format!(
                    "Memory range {:#06X}-{:#06X} in slot {}-{} already in use by {}",
                    base,
                    base as u32 + size - 1,
                    ps,
                    ss,
                    self.device(id).name()
                )));
            }
        }
        Ok(())
    }

    /// Maps a device's cache lines at (ps, ss). The region must be line
    /// aligned, must not overlap an existing registration, and a nonzero
    /// ss requires the primary slot to be expanded.
    pub fn register_mem_device(
        &mut self,
        id: DeviceId,
        ps: u8,
        ss: u8,
        base: u16,
        size: u32,
    ) -> Result<(), SlotError> {
        self.check_mem_device(ps, ss, base, size)?;
        let first = (base >> CACHE_LINE_BITS) as usize;
        let count = (size >> CACHE_LINE_BITS) as usize;
        for line in first..first + count {
            self.mem_layout[ps as usize][ss as usize][line] = Some(id);
        }
        tracing::debug!(
            "[BUS] Mapped {} at slot {}-{} {:#06X} size {:#06X}",
            self.device(id).name(),
            ps,
            ss,
            base,
            size
        );
        Ok(())
    }

    pub fn unregister_mem_device(&mut self, id: DeviceId, ps: u8, ss: u8, base: u16, size: u32) {
        let first = (base >> CACHE_LINE_BITS) as usize;
        let count = (size >> CACHE_LINE_BITS) as usize;
        for line in first..first + count {
            let cell = &mut self.mem_layout[ps as usize][ss as usize][line];
            debug_assert_eq!(*cell, Some(id));
            *cell = None;
        }
        tracing::debug!(
            "[BUS] Unmapped {} from slot {}-{} {:#06X} size {:#06X}",
            self.device(id).name(),
            ps,
            ss,
            base,
            size
        );
    }

    // --- IO registration -----------------------------------------------

    pub fn register_in_port(&mut self, id: DeviceId, port: u8) {
        self.io_in[port as usize].push(id);
        tracing::trace!("[BUS] {} reads port {:#04X}", self.device(id).name(), port);
    }

    pub fn register_out_port(&mut self, id: DeviceId, port: u8) {
        self.io_out[port as usize].push(id);
        tracing::trace!("[BUS] {} writes port {:#04X}", self.device(id).name(), port);
    }

    pub fn unregister_in_port(&mut self, id: DeviceId, port: u8) {
        self.io_in[port as usize].retain(|&entry| entry != id);
    }

    pub fn unregister_out_port(&mut self, id: DeviceId, port: u8) {
        self.io_out[port as usize].retain(|&entry| entry != id);
    }

    // --- slot selection ------------------------------------------------

    pub fn primary_slot_config(&self) -> u8 {
        self.primary_slot_config
    }

    pub fn set_primary_slot_config(&mut self, value: u8) {
        tracing::trace!("[BUS] Primary slot config = {:#04X}", value);
        self.primary_slot_config = value;
    }

    pub fn sub_slot_register(&self, ps: u8) -> u8 {
        self.sub_slot_register[ps as usize]
    }

    /// (primary, secondary) slot visible in `page`. An unexpanded primary
    /// always resolves to secondary slot 0.
    fn visible_slot(&self, page: u8) -> (usize, usize) {
        let ps = ((self.primary_slot_config >> (2 * page)) & 0x03) as usize;
        let ss = if self.expanded[ps] > 0 {
            ((self.sub_slot_register[ps] >> (2 * page)) & 0x03) as usize
        } else {
            0
        };
        (ps, ss)
    }

    fn visible_device(&self, address: u16) -> Option<DeviceId> {
        let (ps, ss) = self.visible_slot((address >> 14) as u8);
        self.mem_layout[ps][ss][(address >> CACHE_LINE_BITS) as usize]
    }

    /// Primary slot whose sub-slot register is reachable at 0xFFFF, if the
    /// access goes to the register rather than to memory.
    fn subslot_access(&self, address: u16) -> Option<usize> {
        if address != 0xFFFF {
            return None;
        }
        let ps = ((self.primary_slot_config >> 6) & 0x03) as usize;
        if self.expanded[ps] > 0 {
            Some(ps)
        } else {
            None
        }
    }

    // --- memory access --------------------------------------------------

    pub fn read_byte(&mut self, address: u16) -> u8 {
        if let Some(ps) = self.subslot_access(address) {
            return !self.sub_slot_register[ps];
        }
        match self.visible_device(address) {
            Some(id) => self.device_mut(id).read_mem(address),
            None => 0xFF,
        }
    }

    /// Side-effect free read, same routing as `read_byte`.
    pub fn peek_byte(&self, address: u16) -> u8 {
        if let Some(ps) = self.subslot_access(address) {
            return !self.sub_slot_register[ps];
        }
        match self.visible_device(address) {
            Some(id) => self.device(id).peek_mem(address),
            None => 0xFF,
        }
    }

    pub fn write_byte(&mut self, address: u16, value: u8) {
        if let Some(ps) = self.subslot_access(address) {
            tracing::trace!("[BUS] Sub-slot register {} = {:#04X}", ps, value);
            self.sub_slot_register[ps] = value;
            return;
        }
        if let Some(id) = self.visible_device(address) {
            self.device_mut(id).write_mem(address, value);
        }
    }

    pub fn read_word(&mut self, address: u16) -> u16 {
        let low_byte = self.read_byte(address) as u16;
        let high_byte = self.read_byte(address.wrapping_add(1)) as u16;
        (high_byte << 8) | low_byte
    }

    pub fn write_word(&mut self, address: u16, value: u16) {
        let low_byte = (value & 0x00FF) as u8;
        let high_byte = ((value & 0xFF00) >> 8) as u8;
        self.write_byte(address, low_byte);
        self.write_byte(address.wrapping_add(1), high_byte);
    }

    /// Cacheable view of the line at `start`, which must be line aligned.
    ///
    /// The 0xFF00 line is never cacheable while the page-3 primary slot is
    /// expanded, so the 0xFFFF register intercept cannot be bypassed.
    /// A line with no device behind it serves the shared all-ones block.
    pub fn read_cache_line(&self, start: u16) -> Option<&[u8]> {
        debug_assert_eq!(start & CACHE_LINE_LOW, 0);
        if self.line_intercepted(start) {
            return None;
        }
        match self.visible_device(start) {
            Some(id) => self.device(id).read_cache_line(start),
            None => Some(unmapped_line(start)),
        }
    }

    pub fn write_cache_line(&mut self, start: u16) -> Option<&mut [u8]> {
        debug_assert_eq!(start & CACHE_LINE_LOW, 0);
        if self.line_intercepted(start) {
            return None;
        }
        let id = self.visible_device(start)?;
        self.device_mut(id).write_cache_line(start)
    }

    fn line_intercepted(&self, start: u16) -> bool {
        if start & CACHE_LINE_HIGH != 0xFF00 {
            return false;
        }
        let ps = ((self.primary_slot_config >> 6) & 0x03) as usize;
        self.expanded[ps] > 0
    }

    // --- IO access ------------------------------------------------------

    pub fn input(&mut self, port: u8) -> u8 {
        let ids = self.io_in[port as usize].clone();
        if ids.is_empty() {
            tracing::trace!("[BUS] Read from unmapped port {:#04X}", port);
            return 0xFF;
        }
        let mut value = 0xFF;
        for id in ids {
            value &= self.device_mut(id).read_io(port);
        }
        value
    }

    pub fn peek_input(&self, port: u8) -> u8 {
        self.io_in[port as usize]
            .iter()
            .fold(0xFF, |value, &id| value & self.device(id).peek_io(port))
    }

    pub fn output(&mut self, port: u8, value: u8) {
        let ids = self.io_out[port as usize].clone();
        if ids.is_empty() {
            tracing::trace!("[BUS] Write to unmapped port {:#04X} = {:#04X}", port, value);
            return;
        }
        for id in ids {
            self.device_mut(id).write_io(port, value);
        }
    }

    // --- reset ----------------------------------------------------------

    /// Back to the power-on slot selection. Device mappings and expansion
    /// state are configuration and survive a reset.
    pub fn reset(&mut self) {
        self.primary_slot_config = 0;
        self.sub_slot_register = [0; 4];
        for device in self.devices.iter_mut().flatten() {
            device.reset();
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Bus::new()
    }
}
