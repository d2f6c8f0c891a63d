//! Quarantine and unmap (component C5): freeing an extent transactionally
//! writes it to the persistent free map and the in-memory aggregate LRU;
//! draining the quarantine later (`migrate`) is what makes it reusable
//! again, with an optional device unmap in between.
//!
//! Grounded on `original_source/src/vos/vea/vea_free.c`'s
//! `aggregated_free`/`migrate_end_cb`/`migrate_free_exts`.

use tracing::{instrument, trace, warn};

use crate::clock::Clock;
use crate::config::VeaConfig;
use crate::error::CoreResult;
use crate::external::{BlobDevice, OrderedMap};
use crate::extent::{FreeExtent, FreeFlags};

use super::free_class::{aggregated_free, compound_free, persistent_free, AggregateIndex, FreeIndex};

/// `free(blk_off, blk_cnt)` steps 1-2 (spec.md §4.3): must run inside
/// the caller's transaction. Step 3 (registering `migrate_end_cb`) is
/// the caller's responsibility since only the caller holds the
/// transaction handle and knows whether a callback is already pending.
pub fn free_into_quarantine<P>(
    persist: &mut P,
    agg: &mut AggregateIndex,
    clock: &dyn Clock,
    ext: FreeExtent,
) -> CoreResult<()>
where
    P: OrderedMap<Key = u64, Value = FreeExtent>,
{
    persistent_free(persist, ext)?;
    aggregated_free(agg, clock, ext)?;
    Ok(())
}

/// Drain the quarantine of everything past `MIGRATE_INTERVAL`, unmapping
/// each one (if a device is configured) before it becomes reusable
/// again. Shared by the post-commit end callback and forced migration
/// outside a transaction (spec.md §4.3's "Forced migration").
///
/// `last_migrate_ms` is updated before any unmap runs: an unmap that
/// yields must not block a second, concurrently scheduled migrate from
/// also proceeding, since every entry handled here has already left
/// every allocator-visible index before the yield point.
#[instrument(skip(agg, index, clock, cfg, device), fields(blk_sz))]
pub async fn migrate(
    agg: &mut AggregateIndex,
    index: &mut FreeIndex,
    clock: &dyn Clock,
    cfg: &VeaConfig,
    blk_sz: u32,
    device: Option<&dyn BlobDevice>,
) -> CoreResult<()> {
    let now = clock.now_ms();
    if now < agg.last_migrate_ms().saturating_add(cfg.migrate_interval_ms) {
        trace!(now, last_migrate_ms = agg.last_migrate_ms(), "migrate: interval not elapsed");
        return Ok(());
    }

    let expired = agg.drain_expired(now, cfg.migrate_interval_ms);
    agg.set_last_migrate_ms(now);
    if expired.is_empty() {
        return Ok(());
    }
    trace!(count = expired.len(), "migrate: draining quarantine");

    for ext in expired {
        if let Some(device) = device {
            let byte_off = ext.blk_off * blk_sz as u64;
            let byte_cnt = ext.blk_cnt as u64 * blk_sz as u64;
            if let Err(err) = device.unmap(byte_off, byte_cnt).await {
                warn!(?err, off = ext.blk_off, cnt = ext.blk_cnt, "unmap failed, extent stays quarantined");
                // Put it back so a later migrate retries it rather than
                // leaking the range.
                aggregated_free(agg, clock, ext)?;
                continue;
            }
        }
        compound_free(index, clock, ext, FreeFlags::GEN_AGE)?;
    }
    Ok(())
}
