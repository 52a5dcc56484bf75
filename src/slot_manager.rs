use std::{cell::RefCell, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{
    error::SlotError,
    registry::{ConfigId, ConfigRegistry},
    slot::SlotAddress,
};

/// Upper bound on external slot descriptors, one per letter name a..p.
pub const MAX_SLOTS: usize = 16;

#[derive(Debug, Default, Clone)]
struct SlotEntry {
    exists: bool,
    addr: SlotAddress,
    owner: Option<ConfigId>,
    use_count: u32,
}

impl SlotEntry {
    /// Owned by someone other than `allowed`. Checks the use-count/owner
    /// invariant on every call.
    fn used(&self, allowed: Option<ConfigId>) -> bool {
        debug_assert_eq!(self.use_count == 0, self.owner.is_none());
        match self.owner {
            Some(owner) => Some(owner) != allowed,
            None => false,
        }
    }
}

fn slot_letter(index: usize) -> char {
    (b'a' + index as u8) as char
}

pub(crate) fn slot_name(index: usize) -> String {
    format!("cart{}", slot_letter(index))
}

/// Report on one external slot, as returned by the administrative queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSlotInfo {
    pub name: String,
    pub slot: SlotAddress,
    pub occupant: Option<String>,
}

/// Tracks which slot coordinates exist as external (cartridge) slots and
/// who owns them.
///
/// The descriptor table is a fixed array scanned linearly; the scan order
/// decides which descriptor a new external slot lands in (lowest free
/// index, which also fixes its letter name) and which slot
/// `allocate_primary_slot` hands out first.
pub struct SlotManager {
    slots: [SlotEntry; MAX_SLOTS],
    registry: Rc<RefCell<ConfigRegistry>>,
}

impl SlotManager {
    pub fn new(registry: Rc<RefCell<ConfigRegistry>>) -> Self {
        SlotManager {
            slots: Default::default(),
            registry,
        }
    }

    /// Turns `addr` into an external slot, claiming the lowest free
    /// descriptor and with it the next letter name.
    ///
    /// Panics when all `MAX_SLOTS` descriptors are taken; a machine
    /// definition cannot legitimately declare more external slots than
    /// there are letter names.
    pub fn create_external_slot(&mut self, addr: SlotAddress) -> Result<(), SlotError> {
        if self.is_external_slot(addr, false) {
            return Err(SlotError::SlotAlreadyExternal);
        }
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if !entry.exists {
                entry.exists = true;
                entry.addr = addr;
                tracing::info!("[SLOT] Added external slot {} at {}", slot_name(index), addr);
                return Ok(());
            }
        }
        panic!("All {} external slot descriptors in use", MAX_SLOTS);
    }

    /// Releases the external slot at `addr`.
    ///
    /// Panics if `addr` was never created external (see [`Self::get_slot`]).
    pub fn remove_external_slot(&mut self, addr: SlotAddress) -> Result<(), SlotError> {
        let index = self.get_slot(addr);
        if self.slots[index].used(None) {
            return Err(SlotError::SlotInUse);
        }
        tracing::info!("[SLOT] Removed external slot {} at {}", slot_name(index), addr);
        self.slots[index] = SlotEntry::default();
        Ok(())
    }

    /// Read-only pre-check for `remove_external_slot`: fails if the slot is
    /// owned by anyone other than `allowed`.
    pub fn test_remove_external_slot(
        &self,
        addr: SlotAddress,
        allowed: ConfigId,
    ) -> Result<(), SlotError> {
        let index = self.get_slot(addr);
        if self.slots[index].used(Some(allowed)) {
            return Err(SlotError::SlotInUse);
        }
        Ok(())
    }

    /// Descriptor index of the external slot at `addr`.
    ///
    /// Panics if no such external slot exists; callers check
    /// `is_external_slot` first.
    pub fn get_slot(&self, addr: SlotAddress) -> usize {
        for (index, entry) in self.slots.iter().enumerate() {
            if entry.exists && entry.addr == addr {
                return index;
            }
        }
        panic!("Slot {} was not created as an external slot", addr);
    }

    /// Whether `addr` is an external slot. With `convert_unexpanded` set,
    /// a slot created unexpanded also matches a query for secondary slot 0:
    /// under the fully expanded view an unexpanded primary is addressed as
    /// its own secondary slot 0. The converted entry then no longer matches
    /// an unexpanded query.
    pub fn is_external_slot(&self, addr: SlotAddress, convert_unexpanded: bool) -> bool {
        self.slots.iter().any(|entry| {
            let entry_ss = if convert_unexpanded && entry.addr.secondary.is_none() {
                Some(0)
            } else {
                entry.addr.secondary
            };
            entry.exists && entry.addr.primary == addr.primary && entry_ss == addr.secondary
        })
    }

    /// Coordinate of the named external slot `index` (0 = "carta"), for a
    /// caller that wants to bind to that specific slot.
    pub fn get_specific_slot(&self, index: usize) -> Result<SlotAddress, SlotError> {
        assert!(index < MAX_SLOTS);
        let entry = &self.slots[index];
        if !entry.exists {
            return Err(SlotError::SlotNotFound(slot_letter(index).to_string()));
        }
        if entry.used(None) {
            return Err(SlotError::SlotInUse);
        }
        Ok(entry.addr)
    }

    /// Free external slot with the smallest coordinate, unexpanded sorting
    /// before secondary slot 0.
    pub fn get_any_free_slot(&self) -> Result<SlotAddress, SlotError> {
        self.slots
            .iter()
            .filter(|entry| entry.exists && !entry.used(None))
            .map(|entry| entry.addr)
            .min()
            .ok_or(SlotError::SlotExhausted)
    }

    /// Claims a whole free unexpanded external slot for `config` and
    /// returns its primary slot number. First match in table order wins.
    pub fn allocate_primary_slot(&mut self, config: ConfigId) -> Result<u8, SlotError> {
        for (index, entry) in self.slots.iter_mut().enumerate() {
            if entry.exists && entry.addr.secondary.is_none() && !entry.used(None) {
                entry.owner = Some(config);
                entry.use_count = 1;
                tracing::debug!(
                    "[SLOT] Allocated primary slot {} ({}) to {}",
                    entry.addr.primary,
                    slot_name(index),
                    config
                );
                return Ok(entry.addr.primary);
            }
        }
        Err(SlotError::SlotExhausted)
    }

    /// Releases a slot claimed with `allocate_primary_slot`. The slot must
    /// be owned by exactly `config` with a use count of one.
    pub fn free_primary_slot(&mut self, ps: u8, config: ConfigId) {
        let index = self.get_slot(SlotAddress::unexpanded(ps));
        let entry = &mut self.slots[index];
        assert_eq!(
            entry.owner,
            Some(config),
            "primary slot {} freed by a config that does not own it",
            ps
        );
        assert_eq!(entry.use_count, 1, "primary slot {} still shared", ps);
        entry.owner = None;
        entry.use_count = 0;
    }

    /// Refcounted claim on `addr` for `config`. The first claim takes
    /// ownership; further claims by the same config stack. A claim on a
    /// slot owned by another config fails and changes nothing.
    ///
    /// A coordinate that is not an external slot is outside arbitration;
    /// claiming it is deliberately a no-op.
    pub fn allocate_slot(&mut self, addr: SlotAddress, config: ConfigId) -> Result<(), SlotError> {
        for entry in self.slots.iter_mut() {
            if !entry.exists || entry.addr != addr {
                continue;
            }
            match entry.owner {
                None => {
                    entry.owner = Some(config);
                    entry.use_count = 1;
                }
                Some(owner) if owner == config => entry.use_count += 1,
                Some(owner) => {
                    let name = self
                        .registry
                        .borrow()
                        .name(owner)
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(SlotError::OwnershipConflict { slot: addr, owner: name });
                }
            }
            tracing::debug!(
                "[SLOT] Slot {} allocated to {}, use count {}",
                addr,
                config,
                entry.use_count
            );
            return Ok(());
        }
        tracing::trace!("[SLOT] Slot {} is not external, allocate ignored", addr);
        Ok(())
    }

    /// Drops one claim on `addr`, clearing the owner when the count reaches
    /// zero. Freeing a slot not owned by `config` is an invariant violation.
    pub fn free_slot(&mut self, addr: SlotAddress, config: ConfigId) {
        for entry in self.slots.iter_mut() {
            if !entry.exists || entry.addr != addr {
                continue;
            }
            assert_eq!(
                entry.owner,
                Some(config),
                "slot {} freed by a config that does not own it",
                addr
            );
            assert!(entry.use_count > 0);
            entry.use_count -= 1;
            if entry.use_count == 0 {
                entry.owner = None;
            }
            tracing::debug!(
                "[SLOT] Slot {} freed by {}, use count {}",
                addr,
                config,
                entry.use_count
            );
            return;
        }
        tracing::trace!("[SLOT] Slot {} is not external, free ignored", addr);
    }

    /// Owner of the named external slot `index`, or `None` when empty.
    pub fn slot_owner(&self, index: usize) -> Result<Option<ConfigId>, SlotError> {
        assert!(index < MAX_SLOTS);
        let entry = &self.slots[index];
        if !entry.exists {
            return Err(SlotError::SlotNotFound(slot_letter(index).to_string()));
        }
        Ok(entry.owner)
    }

    /// All currently existing external slots, in descriptor order.
    pub fn external_slots(&self) -> Vec<ExternalSlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.exists)
            .map(|(index, entry)| self.entry_info(index, entry))
            .collect()
    }

    /// Report on the external slot with the given letter name ("carta"..).
    pub fn slot_info(&self, name: &str) -> Result<ExternalSlotInfo, SlotError> {
        self.slots
            .iter()
            .enumerate()
            .find(|(index, entry)| entry.exists && slot_name(*index) == name)
            .map(|(index, entry)| self.entry_info(index, entry))
            .ok_or_else(|| SlotError::SlotNotFound(name.to_string()))
    }

    fn entry_info(&self, index: usize, entry: &SlotEntry) -> ExternalSlotInfo {
        let occupant = entry
            .owner
            .and_then(|owner| self.registry.borrow().name(owner).map(str::to_string));
        ExternalSlotInfo {
            name: slot_name(index),
            slot: entry.addr,
            occupant,
        }
    }
}

impl Drop for SlotManager {
    fn drop(&mut self) {
        for (index, entry) in self.slots.iter().enumerate() {
            debug_assert!(
                !entry.used(None),
                "external slot {} still allocated at teardown",
                slot_name(index)
            );
            debug_assert!(
                !entry.exists,
                "external slot {} still present at teardown",
                slot_name(index)
            );
        }
    }
}
