use thiserror::Error;

use crate::slot::SlotAddress;

/// Errors surfaced by slot arbitration and device binding.
///
/// These cover operator and configuration mistakes, which callers are
/// expected to report and recover from. Internal consistency violations
/// (owner/count mismatches, teardown with live slots) are not errors but
/// panics: continuing past them would corrupt the address-space model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Invalid slot specification: {0}")]
    InvalidSlotSpecification(String),

    #[error("Slot is already an external slot.")]
    SlotAlreadyExternal,

    #[error("Slot still in use.")]
    SlotInUse,

    #[error("slot-{0} not defined.")]
    SlotNotFound(String),

    #[error("Not enough free cartridge slots")]
    SlotExhausted,

    #[error("Slot {slot} already in use by {owner}.")]
    OwnershipConflict { slot: SlotAddress, owner: String },

    #[error("{0}")]
    ConfigurationError(String),
}
