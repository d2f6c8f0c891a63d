//! Environment-driven configuration, resolved once before a [`crate::Vea`]
//! is constructed. Generalizes the teacher crate's `OpenOptions` (which
//! only covers on-disk size) to the allocator's own tunables.

use std::env;

/// Default interval between quarantine drains, in milliseconds.
pub const DEFAULT_MIGRATE_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VeaConfig {
    /// Minimum time a freed extent must sit in the aggregate LRU before
    /// `migrate` will drain it. Overridable via `MIGRATE_INTERVAL_MS`.
    pub migrate_interval_ms: u64,
    /// Extents with `blk_cnt` above this threshold (in blocks) are tracked
    /// in the max-heap rather than a size-class LRU. Overridable via
    /// `LARGE_EXT_MB`, expressed in MiB and converted using `blk_sz`.
    pub large_thresh_blocks: u32,
}

impl VeaConfig {
    /// Build a config from the environment, falling back to the stated
    /// defaults (`MIGRATE_INTERVAL_MS`, `LARGE_EXT_MB` per spec.md §6).
    pub fn from_env(blk_sz: u32) -> Self {
        let migrate_interval_ms = env::var("MIGRATE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIGRATE_INTERVAL_MS);

        let large_ext_mb: u32 = env::var("LARGE_EXT_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::extent::DEFAULT_LARGE_EXT_MB);

        let large_thresh_blocks = ((large_ext_mb as u64 * 1024 * 1024) / blk_sz as u64) as u32;

        Self {
            migrate_interval_ms,
            large_thresh_blocks,
        }
    }

    /// Build a config directly, bypassing the environment. Used in tests.
    pub fn fixed(migrate_interval_ms: u64, large_thresh_blocks: u32) -> Self {
        Self {
            migrate_interval_ms,
            large_thresh_blocks,
        }
    }
}

impl Default for VeaConfig {
    fn default() -> Self {
        Self::from_env(4096)
    }
}
