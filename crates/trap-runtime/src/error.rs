//! Error types for the trap runtime crate
//!
//! Only setup and bookkeeping operations return errors. The fault path itself
//! never does: its outcomes are [`Disposition`](crate::Disposition) values.

use thiserror::Error;

/// Runtime errors
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("failed to set up signal handler: {reason}")]
    SignalSetupError { reason: String },

    #[error("trap handlers are already installed in this process")]
    AlreadyInstalled,

    #[error(
        "signal {signal} already has a foreign handler at {handler:#x} and signal chaining is disabled"
    )]
    ConflictingHandler { signal: i32, handler: usize },

    #[error("failed to map memory for {what}: {reason}")]
    MapError { what: &'static str, reason: String },

    #[error("failed to change protection of {len} bytes at {addr:#x}: {reason}")]
    ProtectionError {
        addr: usize,
        len: usize,
        reason: String,
    },

    #[error("invalid trap runtime configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("operation is only permitted while the world is stopped at a safepoint")]
    NotAtSafepoint,

    #[error("stack guard zones cannot be re-enabled while a fault is being handled")]
    ReguardInsideHandler,

    #[error("current thread is already attached to the trap runtime")]
    ThreadAlreadyAttached,

    #[error("failed to query the current thread's stack: {reason}")]
    StackQueryError { reason: String },
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
