//! Epoch aggregator (component C6): recursively walks OBJ → DKEY → AKEY
//! → VALUE, collapsing shadowed value versions within an epoch range,
//! bounded by a caller-supplied credit budget and resumable via an
//! [`anchor::Anchor`].
//!
//! Grounded on `original_source/src/vos/vos_purge.c`'s `epoch_aggregate`
//! and the surrounding `purge_ctx_*`/`purge_oid_is_aggregated` helpers.
//! The four-level hierarchy is expressed against the same `OrderedMap`
//! trait used for the free-extent indexes, keyed by composite tuples
//! rather than a real nested-tree handle — see DESIGN.md for why dkeys
//! and akeys are modeled as plain `u64`s here rather than opaque byte
//! strings.

pub mod anchor;
pub mod discard;

use tracing::{instrument, trace};

use crate::error::{CoreError, CoreResult};
use crate::external::{ObjectCache, OrderedMap, ProbeOp};
use crate::extent::Epoch;

pub use anchor::{Anchor, AkeyKey, DkeyKey, ObjId, ValueKey, AKey, DKey};

/// Per-object metadata record (the OBJ tree's value type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjMeta {
    pub purged_epoch: Epoch,
}

/// A stored value version. The epoch is carried in the key; the value
/// only needs the writer cookie discard keys off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRecord {
    pub cookie: crate::extent::Cookie,
}

/// Container-wide bookkeeping: the high-water mark aggregation has
/// already reached, and (for discard's short-circuit) the highest
/// epoch ever written under each cookie. Modeled as a plain in-memory
/// struct rather than a tree-backed external collaborator, since its
/// shape (one counter, one small map) doesn't need probe/fetch/delete
/// semantics (see DESIGN.md).
#[derive(Debug, Clone, Default)]
pub struct ContainerMeta {
    pub purged_epoch: Epoch,
    pub cookie_max_epoch: std::collections::BTreeMap<crate::extent::Cookie, Epoch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochMode {
    Eq,
    Rr,
    Ge,
}

impl EpochMode {
    fn from_range(epr_lo: Epoch, epr_hi: Epoch) -> Self {
        if epr_lo == epr_hi {
            EpochMode::Eq
        } else if epr_hi < crate::extent::EPOCH_MAX {
            EpochMode::Rr
        } else {
            EpochMode::Ge
        }
    }
}

fn in_dkey_scope(oid: ObjId, key: &DkeyKey) -> bool {
    key.0 == oid
}

fn in_akey_scope(oid: ObjId, dkey: DKey, key: &AkeyKey) -> bool {
    key.0 == oid && key.1 == dkey
}

fn in_value_scope(oid: ObjId, dkey: DKey, akey: AKey, epr_hi: Epoch, key: &ValueKey) -> bool {
    key.0 == oid && key.1 == dkey && key.2 == akey && key.3 <= epr_hi
}

fn akey_scope_is_empty<AT>(akey_tree: &AT, oid: ObjId, dkey: DKey) -> bool
where
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
{
    match akey_tree.probe(ProbeOp::Ge((oid, dkey, AKey::MIN))) {
        Some(c) => match akey_tree.fetch(&c) {
            Some((k, _)) => !in_akey_scope(oid, dkey, &k),
            None => true,
        },
        None => true,
    }
}

fn value_scope_is_empty<VT>(value_tree: &VT, oid: ObjId, dkey: DKey, akey: AKey) -> bool
where
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    match value_tree.probe(ProbeOp::Ge((oid, dkey, akey, 0))) {
        Some(c) => match value_tree.fetch(&c) {
            Some((k, _)) => !(k.0 == oid && k.1 == dkey && k.2 == akey),
            None => true,
        },
        None => true,
    }
}

/// `aggregate(coh, oid, epr_lo, epr_hi, credits, anchor) -> (finished,
/// credits_left)` (spec.md §4.4). `oid = None` is the null-OID
/// short-circuit: mark the whole container aggregated up to `epr_hi`.
#[instrument(skip(obj_tree, dkey_tree, akey_tree, value_tree, object_cache, container, anchor))]
#[allow(clippy::too_many_arguments)]
pub fn aggregate<OT, DT, AT, VT, OC>(
    obj_tree: &mut OT,
    dkey_tree: &mut DT,
    akey_tree: &mut AT,
    value_tree: &mut VT,
    object_cache: &mut OC,
    container: &mut ContainerMeta,
    coh: u64,
    oid: Option<ObjId>,
    epr_lo: Epoch,
    epr_hi: Epoch,
    credits: &mut u32,
    anchor: &mut Anchor,
) -> CoreResult<bool>
where
    OT: OrderedMap<Key = ObjId, Value = ObjMeta>,
    DT: OrderedMap<Key = DkeyKey, Value = ()>,
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
    OC: ObjectCache,
{
    let Some(oid) = oid else {
        container.purged_epoch = container.purged_epoch.max(epr_hi);
        trace!(epr_hi, "aggregate: null oid, marking container aggregated");
        return Ok(true);
    };
    if epr_hi < epr_lo {
        return Err(CoreError::Invalid("aggregate: epr_hi < epr_lo"));
    }
    anchor.reset_for_oid(oid);
    if anchor.oid_is_complete(oid) {
        return Ok(true);
    }
    if container.purged_epoch >= epr_hi {
        return Ok(true);
    }

    let mode = EpochMode::from_range(epr_lo, epr_hi);
    let handle = object_cache.hold(coh, oid, epr_hi, true);

    let finished = aggregate_dkey(
        dkey_tree, akey_tree, value_tree, oid, epr_lo, epr_hi, mode, credits, anchor,
    );

    object_cache.evict(&handle);
    object_cache.release(handle);

    let finished = finished?;
    if finished {
        anchor.obj.complete = true;
        anchor.obj.set = false;
        if let Some(meta_cursor) = obj_tree.probe(ProbeOp::Eq(oid)) {
            if let Some((_, mut meta)) = obj_tree.fetch(&meta_cursor) {
                meta.purged_epoch = meta.purged_epoch.max(epr_hi);
                obj_tree.update(oid, meta);
            }
        } else {
            obj_tree.update(oid, ObjMeta { purged_epoch: epr_hi });
        }
    }
    Ok(finished)
}

#[allow(clippy::too_many_arguments)]
fn aggregate_dkey<DT, AT, VT>(
    dkey_tree: &mut DT,
    akey_tree: &mut AT,
    value_tree: &mut VT,
    oid: ObjId,
    epr_lo: Epoch,
    epr_hi: Epoch,
    mode: EpochMode,
    credits: &mut u32,
    anchor: &mut Anchor,
) -> CoreResult<bool>
where
    DT: OrderedMap<Key = DkeyKey, Value = ()>,
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    // `probe_from` is the exact key to resume at, not "one past the last
    // key visited": a pause can land either between two dkeys (resume at
    // the next one) or mid-way through one dkey's own akey/value subtree
    // (resume at that same dkey, so the nested levels' own saved anchors
    // pick the walk back up where they left off). Advancing past a dkey
    // only happens once its subtree actually reports finished.
    let mut probe_from = anchor.dkey.cursor.unwrap_or((oid, DKey::MIN));
    loop {
        if *credits == 0 {
            anchor.dkey.cursor = Some(probe_from);
            anchor.dkey.set = true;
            return Ok(false);
        }

        let Some(cursor) = dkey_tree.probe(ProbeOp::Ge(probe_from)) else {
            anchor.dkey.cursor = None;
            anchor.dkey.set = false;
            anchor.dkey.complete = true;
            return Ok(true);
        };
        let Some((key, _)) = dkey_tree.fetch(&cursor) else {
            anchor.dkey.cursor = None;
            anchor.dkey.set = false;
            anchor.dkey.complete = true;
            return Ok(true);
        };
        if !in_dkey_scope(oid, &key) {
            anchor.dkey.cursor = None;
            anchor.dkey.set = false;
            anchor.dkey.complete = true;
            return Ok(true);
        }
        *credits -= 1;

        let sub_finished = aggregate_akey(
            akey_tree, value_tree, oid, key.1, epr_lo, epr_hi, mode, credits, anchor,
        )?;

        if sub_finished {
            if akey_scope_is_empty(akey_tree, oid, key.1) {
                if let Some(c) = dkey_tree.probe(ProbeOp::Eq(key)) {
                    dkey_tree.delete(&c);
                }
            }
            // This dkey's subtree is done; advance past it and clear the
            // child anchors, which belonged to the dkey just finished.
            probe_from = anchor::dkey_key_succ(key);
            anchor.akey = anchor::LevelState::default();
            anchor.value = anchor::LevelState::default();
            anchor.value_max = anchor::LevelState::default();
        } else {
            probe_from = key;
        }

        if *credits == 0 {
            anchor.dkey.cursor = Some(probe_from);
            anchor.dkey.set = true;
            return Ok(false);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn aggregate_akey<AT, VT>(
    akey_tree: &mut AT,
    value_tree: &mut VT,
    oid: ObjId,
    dkey: DKey,
    epr_lo: Epoch,
    epr_hi: Epoch,
    mode: EpochMode,
    credits: &mut u32,
    anchor: &mut Anchor,
) -> CoreResult<bool>
where
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    // Same resume-at-the-same-key-if-unfinished discipline as
    // `aggregate_dkey`; see its comment.
    let mut probe_from = anchor.akey.cursor.unwrap_or((oid, dkey, AKey::MIN));
    loop {
        if *credits == 0 {
            anchor.akey.cursor = Some(probe_from);
            anchor.akey.set = true;
            return Ok(false);
        }

        let Some(cursor) = akey_tree.probe(ProbeOp::Ge(probe_from)) else {
            anchor.akey.cursor = None;
            anchor.akey.set = false;
            anchor.akey.complete = true;
            return Ok(true);
        };
        let Some((key, _)) = akey_tree.fetch(&cursor) else {
            anchor.akey.cursor = None;
            anchor.akey.set = false;
            anchor.akey.complete = true;
            return Ok(true);
        };
        if !in_akey_scope(oid, dkey, &key) {
            anchor.akey.cursor = None;
            anchor.akey.set = false;
            anchor.akey.complete = true;
            return Ok(true);
        }
        *credits -= 1;

        let sub_finished = aggregate_value(value_tree, oid, dkey, key.2, epr_lo, epr_hi, mode, credits, anchor)?;

        if sub_finished {
            if value_scope_is_empty(value_tree, oid, dkey, key.2) {
                if let Some(c) = akey_tree.probe(ProbeOp::Eq(key)) {
                    akey_tree.delete(&c);
                }
            }
            probe_from = anchor::akey_key_succ(key);
            anchor.value = anchor::LevelState::default();
            anchor.value_max = anchor::LevelState::default();
        } else {
            probe_from = key;
        }

        if *credits == 0 {
            anchor.akey.cursor = Some(probe_from);
            anchor.akey.set = true;
            return Ok(false);
        }
    }
}

/// The value-level loop: collapse every version strictly older than
/// the newest one within `[epr_lo, epr_hi]`.
///
/// The source pairs a main iterator with a second "max" iterator that
/// tracks the highest epoch seen so far, to tell a safe-to-collapse
/// shadow apart from the newest version regardless of on-media
/// ordering. This implementation achieves the same result with a
/// single forward lookahead probe per entry rather than a persisted
/// second cursor (see DESIGN.md); `mode` distinguishes EQ/RR/GE only in
/// how the scan window is bounded, not in traversal direction, since
/// `OrderedMap` (component C1) exposes only forward iteration.
#[allow(clippy::too_many_arguments)]
fn aggregate_value<VT>(
    value_tree: &mut VT,
    oid: ObjId,
    dkey: DKey,
    akey: AKey,
    epr_lo: Epoch,
    epr_hi: Epoch,
    mode: EpochMode,
    credits: &mut u32,
    anchor: &mut Anchor,
) -> CoreResult<bool>
where
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    loop {
        if *credits == 0 {
            anchor.value.set = true;
            return Ok(false);
        }

        let probe_from = anchor
            .value
            .cursor
            .map(anchor::value_key_succ)
            .unwrap_or((oid, dkey, akey, epr_lo));
        let Some(cursor) = value_tree.probe(ProbeOp::Ge(probe_from)) else {
            anchor.value.set = false;
            anchor.value.complete = true;
            return Ok(true);
        };
        let Some((key, _)) = value_tree.fetch(&cursor) else {
            anchor.value.set = false;
            anchor.value.complete = true;
            return Ok(true);
        };
        if !in_value_scope(oid, dkey, akey, epr_hi, &key) {
            anchor.value.set = false;
            anchor.value.complete = true;
            return Ok(true);
        }
        if mode == EpochMode::Eq && key.3 != epr_lo {
            anchor.value.set = false;
            anchor.value.complete = true;
            return Ok(true);
        }
        *credits -= 1;

        let has_newer = value_tree
            .probe(ProbeOp::Ge(anchor::value_key_succ(key)))
            .and_then(|c| value_tree.fetch(&c))
            .is_some_and(|(k, _)| in_value_scope(oid, dkey, akey, epr_hi, &k));

        if has_newer {
            if let Some(c) = value_tree.probe(ProbeOp::Eq(key)) {
                value_tree.delete(&c);
            }
        }
        anchor.value.cursor = Some(key);

        if mode == EpochMode::Eq {
            // EQ scope only ever contains one epoch worth of entries.
            anchor.value.set = false;
            anchor.value.complete = true;
            return Ok(true);
        }
        if *credits == 0 {
            anchor.value.set = true;
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NullObjectCache;
    use crate::memstore::BTreeOrderedMap;

    const OID: ObjId = 7;

    /// Five dkeys, one akey each, two value versions each (epoch 10 and
    /// epoch 20, distinct cookies).
    fn populated_object() -> (
        BTreeOrderedMap<ObjId, ObjMeta>,
        BTreeOrderedMap<DkeyKey, ()>,
        BTreeOrderedMap<AkeyKey, ()>,
        BTreeOrderedMap<ValueKey, ValueRecord>,
    ) {
        let obj_tree = BTreeOrderedMap::new();
        let mut dkey_tree = BTreeOrderedMap::new();
        let mut akey_tree = BTreeOrderedMap::new();
        let mut value_tree = BTreeOrderedMap::new();
        for d in 0..5u64 {
            dkey_tree.update((OID, d), ());
            akey_tree.update((OID, d, 0), ());
            value_tree.update((OID, d, 0, 10), ValueRecord { cookie: 1 });
            value_tree.update((OID, d, 0, 20), ValueRecord { cookie: 2 });
        }
        (obj_tree, dkey_tree, akey_tree, value_tree)
    }

    #[test]
    fn aggregate_pauses_mid_subtree_and_resumes_without_dropping_work() {
        let (mut obj_tree, mut dkey_tree, mut akey_tree, mut value_tree) = populated_object();
        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        let mut anchor = Anchor::default();

        let mut credits = 3;
        let finished = aggregate(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &mut container, 1, Some(OID), 0, 20, &mut credits, &mut anchor,
        )
        .unwrap();
        assert!(!finished);
        assert_eq!(credits, 0);
        // Exactly d0's eLO (epoch 10) was shadowed and collapsed so far.
        assert!(value_tree.fetch(&(OID, 0, 0, 10)).is_none());
        assert!(value_tree.fetch(&(OID, 0, 0, 20)).is_some());
        assert!(value_tree.fetch(&(OID, 1, 0, 10)).is_some());
        assert_eq!(value_tree.len(), 9);

        let mut credits = 100;
        let finished = aggregate(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &mut container, 1, Some(OID), 0, 20, &mut credits, &mut anchor,
        )
        .unwrap();
        assert!(finished);
        // Every dkey's eLO is now gone; every dkey, akey, and the eHI
        // value of each survive.
        assert_eq!(value_tree.len(), 5);
        for d in 0..5u64 {
            assert!(value_tree.fetch(&(OID, d, 0, 10)).is_none(), "d{d} eLO should be gone");
            assert!(value_tree.fetch(&(OID, d, 0, 20)).is_some(), "d{d} eHI should survive");
            assert!(akey_tree.fetch(&(OID, d, 0)).is_some(), "d{d}'s akey should survive");
            assert!(dkey_tree.fetch(&(OID, d)).is_some(), "d{d} should survive");
        }
        let (_, meta) = obj_tree.fetch(&OID).unwrap();
        assert_eq!(meta.purged_epoch, 20);

        // Idempotent: a completed oid returns immediately without
        // touching the credit budget or any tree.
        let mut credits = 5;
        let finished = aggregate(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &mut container, 1, Some(OID), 0, 20, &mut credits, &mut anchor,
        )
        .unwrap();
        assert!(finished);
        assert_eq!(credits, 5);
        assert_eq!(value_tree.len(), 5);
    }

    #[test]
    fn aggregate_rejects_an_inverted_epoch_range() {
        let (mut obj_tree, mut dkey_tree, mut akey_tree, mut value_tree) = populated_object();
        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        let mut anchor = Anchor::default();
        let mut credits = 10;

        let err = aggregate(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &mut container, 1, Some(OID), 20, 10, &mut credits, &mut anchor,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Invalid(_)));
    }

    #[test]
    fn null_oid_marks_the_whole_container_aggregated() {
        let (mut obj_tree, mut dkey_tree, mut akey_tree, mut value_tree) = populated_object();
        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        let mut anchor = Anchor::default();
        let mut credits = 10;

        let finished = aggregate(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &mut container, 1, None, 0, 50, &mut credits, &mut anchor,
        )
        .unwrap();
        assert!(finished);
        assert_eq!(container.purged_epoch, 50);
        assert_eq!(credits, 10);
        assert!(object_cache.holds.is_empty());
    }
}
