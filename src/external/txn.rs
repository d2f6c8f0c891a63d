//! The transactional persistent-memory primitive consumed by this crate
//! (component C2): `begin/add/commit/abort` with end-of-transaction
//! callbacks.

/// Transaction lifecycle stage, mirroring `pmemobj_tx_stage()`'s
/// `TX_STAGE_NONE` et al. Only `None` matters to this crate: end
/// callbacks registered at that stage are the only cross-scope coupling
/// the quarantine pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    None,
    Working,
    Committed,
    Aborted,
}

/// A callback registered to run once a transaction reaches a given
/// stage. Must not run on abort.
pub type EndCallback = Box<dyn FnOnce() + Send>;

/// Transactional primitive consumed by `publish`/`free`/the aggregator's
/// delete steps. All mutation through this crate happens inside a
/// transaction obtained from an implementor of this trait.
pub trait TransactionManager {
    type Handle;

    fn begin(&self) -> Self::Handle;

    /// Commit the transaction. End callbacks registered at
    /// `TxStage::None` run after this returns `Ok`.
    fn commit(&self, handle: Self::Handle) -> Result<(), crate::CoreError>;

    /// Abort the transaction. Registered end callbacks must not run.
    fn abort(&self, handle: Self::Handle);

    /// Journal a byte range for crash-consistent write-back.
    fn add(&self, handle: &Self::Handle, ptr: usize, size: usize);

    /// Register a callback for the given stage. Idempotent within one
    /// transaction: registering the same logical callback twice before a
    /// drain must not run it twice.
    fn add_end_callback(&self, handle: &Self::Handle, stage: TxStage, cb: EndCallback);

    fn stage(&self, handle: &Self::Handle) -> TxStage;
}
