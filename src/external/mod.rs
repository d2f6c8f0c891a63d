//! Traits for the four external collaborators this crate consumes
//! rather than implements: the ordered map (C1), the transaction
//! primitive (C2), the object cache, and the blob device. See spec.md
//! §4.6.

mod blob_device;
mod object_cache;
mod ordered_map;
mod txn;

pub use blob_device::{BlobDevice, RecordingBlobDevice};
pub use object_cache::{NullObjectCache, NullHandle, ObjectCache};
pub use ordered_map::{OrderedMap, ProbeOp};
pub use txn::{EndCallback, TransactionManager, TxStage};
