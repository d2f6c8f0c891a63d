//! Resumable position for the epoch aggregator/discard walk (spec.md
//! §4.4 "Anchor encoding").
//!
//! The original threads a single bitmask plus four saved iterator
//! anchors through the recursive C call stack. Per SPEC_FULL.md's
//! Design Notes this is reimplemented as an explicit, serializable
//! struct: each level's "anchor" is simply the last key visited at that
//! level (itself a valid `OrderedMap` cursor position, since every
//! cursor this crate hands out round-trips through `probe`), plus two
//! bits (`set`, `complete`) standing in for the original's
//! `SET_*`/`COMPLETE_*` bitmask bits.

use crate::extent::Epoch;

pub type ObjId = u128;
pub type DKey = u64;
pub type AKey = u64;

pub type DkeyKey = (ObjId, DKey);
pub type AkeyKey = (ObjId, DKey, AKey);
pub type ValueKey = (ObjId, DKey, AKey, Epoch);

/// One level's saved position. `set` mirrors `SET_{OBJ,DKEY,AKEY,VALUE}`
/// (there is a saved cursor to resume from); `complete` mirrors
/// `COMPLETE_*` (this level's scan, for the current parent key, already
/// reached `NOT_FOUND` once).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelState<K> {
    pub cursor: Option<K>,
    pub set: bool,
    pub complete: bool,
}

/// Full anchor for one `aggregate`/`discard` call chain. `value_max`
/// stands in for the original's extra `VALUE_MAX` anchor; this
/// implementation re-derives the max-iterator position on every step
/// rather than persisting it (see DESIGN.md), so it is tracked here for
/// API completeness but not consulted by [`super::aggregate_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Anchor {
    pub oid: Option<ObjId>,
    pub obj: LevelState<ObjId>,
    pub dkey: LevelState<DkeyKey>,
    pub akey: LevelState<AkeyKey>,
    pub value: LevelState<ValueKey>,
    pub value_max: LevelState<ValueKey>,
}

impl Anchor {
    /// `purge_oid_is_aggregated`'s reset step: if the anchor was valid
    /// for a different object, the three lower completion bits are
    /// cleared before resuming (spec.md §4.4's Anchor encoding
    /// paragraph; see also DESIGN.md for the Open Question this
    /// resolves).
    pub fn reset_for_oid(&mut self, oid: ObjId) {
        if self.oid != Some(oid) {
            self.oid = Some(oid);
            self.dkey = LevelState::default();
            self.akey = LevelState::default();
            self.value = LevelState::default();
            self.value_max = LevelState::default();
        }
    }

    pub fn oid_is_complete(&self, oid: ObjId) -> bool {
        self.oid == Some(oid) && self.obj.complete
    }
}

/// The key immediately after `key` in the value tree's ordering, used
/// to advance the value-level scan window past an entry that was just
/// examined (and possibly deleted).
pub fn value_key_succ(key: ValueKey) -> ValueKey {
    (key.0, key.1, key.2, key.3.saturating_add(1))
}

pub fn dkey_key_succ(key: DkeyKey) -> DkeyKey {
    (key.0, key.1.saturating_add(1))
}

pub fn akey_key_succ(key: AkeyKey) -> AkeyKey {
    (key.0, key.1, key.2.saturating_add(1))
}
