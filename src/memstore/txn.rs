//! In-memory reference implementation of
//! [`crate::external::TransactionManager`]. Test/demo scaffolding
//! standing in for a real persistent-memory transaction primitive.

use std::cell::RefCell;

use crate::external::{EndCallback, TransactionManager, TxStage};

struct TxnInner {
    stage: TxStage,
    /// Callbacks registered at `TxStage::None`. This crate never asks
    /// for any other stage's callback, so others are rejected rather
    /// than silently dropped.
    end_callbacks: Vec<EndCallback>,
}

/// A single in-flight transaction.
pub struct TxnHandle {
    inner: RefCell<TxnInner>,
}

impl TxnHandle {
    fn new() -> Self {
        Self {
            inner: RefCell::new(TxnInner {
                stage: TxStage::Working,
                end_callbacks: Vec::new(),
            }),
        }
    }
}

/// Reference transaction manager: commit always succeeds and runs
/// registered end callbacks in registration order; abort runs none.
#[derive(Default)]
pub struct InMemoryTxnManager;

impl TransactionManager for InMemoryTxnManager {
    type Handle = TxnHandle;

    fn begin(&self) -> Self::Handle {
        TxnHandle::new()
    }

    fn commit(&self, handle: Self::Handle) -> Result<(), crate::CoreError> {
        {
            let mut inner = handle.inner.borrow_mut();
            inner.stage = TxStage::Committed;
        }
        // Run callbacks after the commit is visible, never under the
        // same borrow used to mutate stage, so a callback that touches
        // this handle (it never should, but nothing stops it) can't
        // double-borrow.
        let callbacks = std::mem::take(&mut handle.inner.borrow_mut().end_callbacks);
        for cb in callbacks {
            cb();
        }
        Ok(())
    }

    fn abort(&self, handle: Self::Handle) {
        handle.inner.borrow_mut().stage = TxStage::Aborted;
        // Deliberately drop end_callbacks without running them.
    }

    fn add(&self, _handle: &Self::Handle, _ptr: usize, _size: usize) {
        // No real journal in the reference implementation: the
        // in-memory indexes this crate mutates already live entirely in
        // process memory, so there is nothing to journal.
    }

    fn add_end_callback(&self, handle: &Self::Handle, stage: TxStage, cb: EndCallback) {
        assert_eq!(
            stage,
            TxStage::None,
            "this crate only ever registers TxStage::None end callbacks"
        );
        handle.inner.borrow_mut().end_callbacks.push(cb);
    }

    fn stage(&self, handle: &Self::Handle) -> TxStage {
        handle.inner.borrow().stage
    }
}
