//! Epoch discard (component C7): same recursive shell as the
//! aggregator, but deletes purely by cookie match and carries neither a
//! credit budget nor a resumable anchor.
//!
//! Grounded on `original_source/src/vos/vos_purge.c`'s `epoch_discard`
//! and `vos_epoch_discard`'s cookie-max-epoch short-circuit.

use tracing::{instrument, trace};

use crate::error::{CoreError, CoreResult};
use crate::external::{ObjectCache, OrderedMap, ProbeOp};
use crate::extent::{Cookie, Epoch};

use super::{AkeyKey, ContainerMeta, DkeyKey, ObjId, ObjMeta, ValueKey, ValueRecord, AKey, DKey};

fn in_dkey_scope(oid: ObjId, key: &DkeyKey) -> bool {
    key.0 == oid
}

fn in_akey_scope(oid: ObjId, dkey: DKey, key: &AkeyKey) -> bool {
    key.0 == oid && key.1 == dkey
}

fn in_value_scope(oid: ObjId, dkey: DKey, akey: AKey, epr_lo: Epoch, epr_hi: Epoch, key: &ValueKey) -> bool {
    key.0 == oid && key.1 == dkey && key.2 == akey && key.3 >= epr_lo && key.3 <= epr_hi
}

/// `discard(coh, oid, epr_lo, epr_hi, cookie)` (spec.md §4.5).
/// Short-circuits on the container's cookie → max-epoch map: if
/// `epr_lo` is already past everything ever written under `cookie`,
/// returns without touching any tree.
#[instrument(skip(obj_tree, dkey_tree, akey_tree, value_tree, object_cache, container))]
#[allow(clippy::too_many_arguments)]
pub fn discard<OT, DT, AT, VT, OC>(
    obj_tree: &mut OT,
    dkey_tree: &mut DT,
    akey_tree: &mut AT,
    value_tree: &mut VT,
    object_cache: &mut OC,
    container: &ContainerMeta,
    coh: u64,
    oid: ObjId,
    epr_lo: Epoch,
    epr_hi: Epoch,
    cookie: Cookie,
) -> CoreResult<()>
where
    OT: OrderedMap<Key = ObjId, Value = ObjMeta>,
    DT: OrderedMap<Key = DkeyKey, Value = ()>,
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
    OC: ObjectCache,
{
    let max_for_cookie = container.cookie_max_epoch.get(&cookie).copied().unwrap_or(0);
    if epr_lo > max_for_cookie {
        trace!(epr_lo, max_for_cookie, "discard: short-circuit, cookie never reached this range");
        return Ok(());
    }
    if obj_tree.probe(ProbeOp::Eq(oid)).is_none() {
        trace!(oid, "discard: object does not exist, nothing to purge");
        return Err(CoreError::Nonexist);
    }

    let handle = object_cache.hold(coh, oid, epr_hi, true);
    let result = discard_dkey(dkey_tree, akey_tree, value_tree, oid, epr_lo, epr_hi, cookie);
    object_cache.evict(&handle);
    object_cache.release(handle);
    result
}

fn discard_dkey<DT, AT, VT>(
    dkey_tree: &mut DT,
    akey_tree: &mut AT,
    value_tree: &mut VT,
    oid: ObjId,
    epr_lo: Epoch,
    epr_hi: Epoch,
    cookie: Cookie,
) -> CoreResult<()>
where
    DT: OrderedMap<Key = DkeyKey, Value = ()>,
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    let mut next = (oid, DKey::MIN);
    loop {
        let Some(cursor) = dkey_tree.probe(ProbeOp::Ge(next)) else {
            return Ok(());
        };
        let Some((key, _)) = dkey_tree.fetch(&cursor) else {
            return Ok(());
        };
        if !in_dkey_scope(oid, &key) {
            return Ok(());
        }
        next = super::anchor::dkey_key_succ(key);

        discard_akey(akey_tree, value_tree, oid, key.1, epr_lo, epr_hi, cookie)?;

        if akey_tree
            .probe(ProbeOp::Ge((oid, key.1, AKey::MIN)))
            .and_then(|c| akey_tree.fetch(&c))
            .map(|(k, _)| !in_akey_scope(oid, key.1, &k))
            .unwrap_or(true)
        {
            if let Some(c) = dkey_tree.probe(ProbeOp::Eq(key)) {
                dkey_tree.delete(&c);
            }
        }
    }
}

fn discard_akey<AT, VT>(
    akey_tree: &mut AT,
    value_tree: &mut VT,
    oid: ObjId,
    dkey: DKey,
    epr_lo: Epoch,
    epr_hi: Epoch,
    cookie: Cookie,
) -> CoreResult<()>
where
    AT: OrderedMap<Key = AkeyKey, Value = ()>,
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    let mut next = (oid, dkey, AKey::MIN);
    loop {
        let Some(cursor) = akey_tree.probe(ProbeOp::Ge(next)) else {
            return Ok(());
        };
        let Some((key, _)) = akey_tree.fetch(&cursor) else {
            return Ok(());
        };
        if !in_akey_scope(oid, dkey, &key) {
            return Ok(());
        }
        next = super::anchor::akey_key_succ(key);

        discard_value(value_tree, oid, dkey, key.2, epr_lo, epr_hi, cookie)?;

        // An akey node is never deleted by discard purely for being
        // momentarily empty of matching-cookie records: S6 requires the
        // akey to survive discard even when every value under it in
        // range was removed, since unrelated versions may remain.
    }
}

fn discard_value<VT>(
    value_tree: &mut VT,
    oid: ObjId,
    dkey: DKey,
    akey: AKey,
    epr_lo: Epoch,
    epr_hi: Epoch,
    cookie: Cookie,
) -> CoreResult<()>
where
    VT: OrderedMap<Key = ValueKey, Value = ValueRecord>,
{
    let mut next = (oid, dkey, akey, epr_lo);
    loop {
        let Some(cursor) = value_tree.probe(ProbeOp::Ge(next)) else {
            return Ok(());
        };
        let Some((key, rec)) = value_tree.fetch(&cursor) else {
            return Ok(());
        };
        if !in_value_scope(oid, dkey, akey, epr_lo, epr_hi, &key) {
            return Ok(());
        }
        next = super::anchor::value_key_succ(key);
        if rec.cookie == cookie {
            if let Some(c) = value_tree.probe(ProbeOp::Eq(key)) {
                value_tree.delete(&c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NullObjectCache;
    use crate::memstore::BTreeOrderedMap;

    const OID: ObjId = 3;

    #[test]
    fn discard_removes_only_matching_cookie_and_keeps_dkey_and_akey() {
        let mut obj_tree: BTreeOrderedMap<ObjId, ObjMeta> = BTreeOrderedMap::new();
        let mut dkey_tree: BTreeOrderedMap<DkeyKey, ()> = BTreeOrderedMap::new();
        let mut akey_tree: BTreeOrderedMap<AkeyKey, ()> = BTreeOrderedMap::new();
        let mut value_tree: BTreeOrderedMap<ValueKey, ValueRecord> = BTreeOrderedMap::new();
        obj_tree.update(OID, ObjMeta::default());
        dkey_tree.update((OID, 0), ());
        akey_tree.update((OID, 0, 0), ());
        value_tree.update((OID, 0, 0, 10), ValueRecord { cookie: 5 });
        value_tree.update((OID, 0, 0, 20), ValueRecord { cookie: 5 });
        value_tree.update((OID, 0, 0, 25), ValueRecord { cookie: 99 });

        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        container.cookie_max_epoch.insert(5, 20);

        discard(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &container, 1, OID, 0, 30, 5,
        )
        .unwrap();

        assert_eq!(value_tree.len(), 1);
        assert!(value_tree.fetch(&(OID, 0, 0, 25)).is_some());
        assert!(akey_tree.fetch(&(OID, 0, 0)).is_some());
        assert!(dkey_tree.fetch(&(OID, 0)).is_some());
    }

    #[test]
    fn discard_short_circuits_when_cookie_never_reached_the_range() {
        let mut obj_tree: BTreeOrderedMap<ObjId, ObjMeta> = BTreeOrderedMap::new();
        let mut dkey_tree: BTreeOrderedMap<DkeyKey, ()> = BTreeOrderedMap::new();
        let mut akey_tree: BTreeOrderedMap<AkeyKey, ()> = BTreeOrderedMap::new();
        let mut value_tree: BTreeOrderedMap<ValueKey, ValueRecord> = BTreeOrderedMap::new();
        dkey_tree.update((OID, 0), ());
        akey_tree.update((OID, 0, 0), ());
        value_tree.update((OID, 0, 0, 10), ValueRecord { cookie: 7 });

        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        container.cookie_max_epoch.insert(7, 5);

        discard(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &container, 1, OID, 10, 30, 7,
        )
        .unwrap();

        assert_eq!(value_tree.len(), 1);
        assert!(object_cache.holds.is_empty());
    }

    #[test]
    fn discard_rejects_an_object_that_does_not_exist() {
        let mut obj_tree: BTreeOrderedMap<ObjId, ObjMeta> = BTreeOrderedMap::new();
        let mut dkey_tree: BTreeOrderedMap<DkeyKey, ()> = BTreeOrderedMap::new();
        let mut akey_tree: BTreeOrderedMap<AkeyKey, ()> = BTreeOrderedMap::new();
        let mut value_tree: BTreeOrderedMap<ValueKey, ValueRecord> = BTreeOrderedMap::new();

        let mut object_cache = NullObjectCache::default();
        let mut container = ContainerMeta::default();
        container.cookie_max_epoch.insert(5, 20);

        let err = discard(
            &mut obj_tree, &mut dkey_tree, &mut akey_tree, &mut value_tree, &mut object_cache,
            &container, 1, OID, 0, 30, 5,
        )
        .unwrap_err();

        assert!(matches!(err, CoreError::Nonexist));
        assert!(object_cache.holds.is_empty());
    }
}
