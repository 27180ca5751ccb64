//! Error kinds shared across the allocator, placement and state-machine
//! layers (spec.md §7).

use thiserror::Error;

/// Normalized bridge failure, as returned by every [`crate::bridge::Bridge`]
/// call. The bridge layer is responsible for mapping whatever the concrete
/// hardware control surface returns onto one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The referenced object is gone. During a free, this is success.
    #[error("not found")]
    NotFound,
    /// The operation is invalid for the object's current state. Retriable
    /// unless the object is being destroyed.
    #[error("invalid state")]
    InvalidState,
    /// The object moved to an error state while booting.
    #[error("boot error")]
    BootError,
    /// The bridge's view of hardware is transiently inconsistent.
    #[error("inconsistent data")]
    InconsistentData,
    /// The bridge is unreachable.
    #[error("connection error")]
    ConnectionError,
    /// An object with this identity already exists.
    #[error("already defined")]
    AlreadyDefined,
    /// Unrecoverable failure inside the bridge.
    #[error("internal error")]
    InternalError,
    /// Programming error by the caller; abort the operation.
    #[error("invalid input")]
    InvalidInput,
    /// Transient; retry immediately after a short sleep.
    #[error("busy")]
    Busy,
}

impl BridgeError {
    /// Whether the block-state layer may retry this call on its own,
    /// without surfacing the failure to the scheduler (spec.md §7).
    pub fn locally_retriable_during_free(&self) -> bool {
        matches!(self, Self::NotFound | Self::InvalidState | Self::Busy)
    }
}

/// Errors surfaced by the allocator, placement policy and state machine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no rectangular or small-block placement satisfies the request")]
    NoSpace,
    #[error("requested passthrough in a dimension configured as deny-pass")]
    PassthroughDenied,
    #[error("submitting user/group is not permitted to use image {0:?}")]
    Permission(String),
    #[error("small-block request counts do not exactly tile one midplane")]
    InvalidInput,
    #[error("bridge call failed: {0}")]
    Bridge(#[from] BridgeError),
    #[error("block {0} not present in any tracked list")]
    UnknownBlock(String),
    #[error("snapshot is malformed or from an incompatible protocol version")]
    Snapshot(#[from] serde_json::Error),
    #[error("snapshot header {0:?} does not match the expected magic/version")]
    IncompatibleSnapshot(String),
    #[error("i/o failure while reading or writing persisted state: {0}")]
    Io(#[from] std::io::Error),
    #[error("attempted to leave an allocation scope that was never entered, or left out of order")]
    ScopeMisuse,
}

pub type Result<T> = std::result::Result<T, CoreError>;
