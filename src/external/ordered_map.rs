//! The ordered key/value tree consumed by this crate (component C1).
//!
//! Out of scope per spec.md: this crate never implements a real
//! persistent B+-tree. Every index here — the free-extent offset tree,
//! the aggregate-offset tree, the OBJ/DKEY/AKEY/VALUE trees walked by the
//! aggregator — is expressed against this trait, so a real
//! persistent-memory-backed tree can be substituted without touching the
//! allocator or aggregator logic.

/// Probe operator, mirroring `BTR_PROBE_{EQ,LE,GE,FIRST}` from the
/// external ordered-map interface in spec.md §4.6.
#[derive(Debug, Clone)]
pub enum ProbeOp<K> {
    Eq(K),
    Le(K),
    Ge(K),
    First,
}

/// An ordered map with tree-style probe/fetch/update/delete semantics.
///
/// `Cursor` is the crate's equivalent of the external interface's
/// opaque iterator handle (`ih`) *and* its serializable anchor: because
/// every `Cursor` this crate hands back can be round-tripped through
/// `probe`, a cursor doubles as the position a bounded-credit walk saves
/// and resumes from.
pub trait OrderedMap {
    type Key: Ord + Clone;
    type Value: Clone;
    type Cursor: Clone;

    /// Position a cursor. Returns `None` (`NONEXIST`) if nothing matches.
    fn probe(&self, op: ProbeOp<Self::Key>) -> Option<Self::Cursor>;

    /// Read the entry a cursor currently points at.
    fn fetch(&self, cursor: &Self::Cursor) -> Option<(Self::Key, Self::Value)>;

    /// Advance a cursor by one entry, in key order.
    fn next(&self, cursor: &Self::Cursor) -> Option<Self::Cursor>;

    /// Delete the entry a cursor points at. Returns `false` if the
    /// cursor no longer refers to a live entry.
    fn delete(&mut self, cursor: &Self::Cursor) -> bool;

    /// Insert or overwrite an entry.
    fn update(&mut self, key: Self::Key, value: Self::Value);

    fn is_empty(&self) -> bool;
}
