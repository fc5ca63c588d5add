use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the classification engine and its lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No classifier kind with this name is registered.
    #[error("unknown classifier kind: {0}")]
    KindNotFound(String),
    /// A classifier kind with this name is already registered.
    #[error("classifier kind already registered: {0}")]
    DuplicateKind(String),
    /// The operation must be replayed from the top. Returned after a kind was
    /// loaded on demand, or when a chain is flushing.
    #[error("state changed, replay the operation")]
    Retry,
    /// No chain with this index exists in the block.
    #[error("chain {0} not found")]
    ChainNotFound(u32),
    /// A chain with this index already exists and is directly held.
    #[error("chain {0} already exists")]
    ChainExists(u32),
    /// No block with this index exists in the namespace.
    #[error("block {0} not found")]
    BlockNotFound(u32),
    /// No filter node at the requested priority.
    #[error("filter not found")]
    FilterNotFound,
    /// The priority slot is taken by a node with a different protocol.
    #[error("priority {0:#x} in use by protocol {1}")]
    PrioConflict(u32, crate::classify::Protocol),
    /// The priority slot is taken by a node of a different classifier kind.
    #[error("priority {0:#x} in use by kind {1}")]
    KindConflict(u32, String),
    /// The auto-allocated priority space is used up.
    #[error("priority space exhausted")]
    Exhausted,
    /// An indirect callback is already registered for this (device, ident).
    #[error("indirect callback already registered")]
    CallbackExists,
    /// No indirect callback registered for this (device, ident).
    #[error("indirect callback not registered")]
    CallbackNotFound,
    /// Malformed request.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The resource is held by another user.
    #[error("resource busy: {0}")]
    Busy(&'static str),
    /// The kind or device cannot support the requested operation.
    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Whether the caller should re-acquire its serialization and replay the
    /// whole operation instead of reporting the error.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Retry)
    }
}
