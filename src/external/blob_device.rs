//! Blob device unmap callback consumed by the quarantine/migrate
//! pipeline (component C5).

use async_trait::async_trait;

/// Device-level discard (TRIM) of a byte range. May yield; callers must
/// only invoke it after the extent has been removed from every
/// allocator-visible index, and must treat it as safe to run
/// concurrently with reservations for that reason.
#[async_trait]
pub trait BlobDevice: Send + Sync {
    async fn unmap(&self, byte_off: u64, byte_cnt: u64) -> Result<(), crate::CoreError>;
}

/// Reference device that records unmap calls instead of touching real
/// storage. Used by tests and by the `maintenance` CLI's demo mode.
#[derive(Default)]
pub struct RecordingBlobDevice {
    pub calls: parking_lot::Mutex<Vec<(u64, u64)>>,
}

#[async_trait]
impl BlobDevice for RecordingBlobDevice {
    async fn unmap(&self, byte_off: u64, byte_cnt: u64) -> Result<(), crate::CoreError> {
        self.calls.lock().push((byte_off, byte_cnt));
        Ok(())
    }
}
