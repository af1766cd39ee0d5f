use thiserror::Error;

use super::vm::VmError;

/// Everything the allocator can report.
///
/// Tier-level exhaustion (a full pool or arena) never shows up here: the
/// router recovers from it by growing. Only reservation-wide exhaustion and
/// misuse reach the caller.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("zero-size allocation request")]
    ZeroSizeRequest,

    /// The fixed reservation cannot back one more page, arena or large block.
    #[error("reservation exhausted: requested {requested} bytes, {available} available")]
    OutOfReservation { requested: usize, available: usize },

    /// The pointer is not owned by any tier of this allocator.
    #[error("pointer {addr:#x} is not owned by this allocator")]
    ForeignPointer { addr: usize },

    /// The pointer is owned by a tier but its block is already free.
    #[error("double free of pointer {addr:#x}")]
    DoubleFree { addr: usize },

    #[error("allocator used before init")]
    NotInitialized,

    #[error("allocator already initialized")]
    AlreadyInitialized,

    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl AllocError {
    /// True for failures that only freeing memory can resolve.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, AllocError::OutOfReservation { .. })
    }
}
