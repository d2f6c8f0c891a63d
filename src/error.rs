use thiserror::Error;

/// Error taxonomy shared by the allocator and the epoch aggregator.
///
/// Mirrors the propagation policy described for this crate: `Corrupt`
/// aborts the current operation without attempting self-repair,
/// `Nonexist` is caught at iterator boundaries before it ever reaches a
/// caller of `aggregate`/`discard`/`reserve`, and `TxAbort` requires the
/// caller to still unwind in-memory reservation state via `cancel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// `reserve` could not satisfy the request even via a vector fallback.
    #[error("out of space: requested {requested} blocks")]
    OutOfSpace { requested: u32 },

    /// Bad input: null OID where not allowed, inverted epoch range, or a
    /// corrupted record that fails validation before any mutation occurs.
    #[error("invalid input: {0}")]
    Invalid(&'static str),

    /// Overlap or duplicate detected in a free index, or a record failed
    /// `verify_free_entry`/`verify_vec_entry`-equivalent validation.
    #[error("corrupt free-extent state: {0}")]
    Corrupt(String),

    /// A probed key was not present. Caught at iterator boundaries and
    /// normally converted into "end of level" or "not-found success";
    /// this variant exists so `OrderedMap` implementations have a way to
    /// report it before that conversion happens.
    #[error("key not found")]
    Nonexist,

    /// In-memory allocation failed.
    #[error("out of memory")]
    Nomem,

    /// The underlying transaction was rolled back. The caller must still
    /// call `cancel` to unwind in-memory reservation state.
    #[error("transaction aborted")]
    TxAbort,

    /// Unsupported feature, e.g. vectorized reservation where it isn't
    /// allowed.
    #[error("unsupported operation: {0}")]
    Nosys(&'static str),
}

pub type CoreResult<T> = Result<T, CoreError>;
