//! The in-memory compound free-extent index (component C3): an offset
//! tree (authoritative for membership), a set of size-classed LRUs
//! ordered by ascending age, and a max-heap for large extents.
//!
//! Grounded on `original_source/src/vos/vea/vea_free.c`'s
//! `merge_free_ext`/`compound_free`/`blkcnt_to_lru`, reworked per
//! spec.md's Design Notes away from intrusive linked lists and raw
//! pointers: the offset tree is a `BTreeMap`, each size class is a
//! `VecDeque` ordered head-to-tail by ascending age, and the large-heap
//! is a `BTreeSet` of `(blk_cnt, blk_off)` pairs rather than a binary
//! heap with per-node "in heap" flags.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{instrument, trace};

use crate::error::{CoreError, CoreResult};
use crate::extent::{Adjacency, FreeExtent, FreeFlags};
use crate::external::{OrderedMap, ProbeOp};

/// Size-classed LRU set. Class `i` covers extents whose `blk_cnt` falls
/// in `(bounds[i-1], bounds[i]]` (with `bounds[-1] == 0`); `bounds` is
/// ascending and its last entry is the large-extent threshold.
#[derive(Debug, Clone)]
pub struct SizeClassSet {
    bounds: Vec<u32>,
    lrus: Vec<VecDeque<FreeExtent>>,
}

impl SizeClassSet {
    /// Builds a power-of-two ladder under `large_thresh`, the default
    /// mentioned in SPEC_FULL.md §4.1.
    pub fn new(large_thresh: u32) -> Self {
        let mut bounds = Vec::new();
        let mut b: u32 = 1;
        while b < large_thresh {
            bounds.push(b);
            b = match b.checked_mul(2) {
                Some(v) => v,
                None => break,
            };
        }
        bounds.push(large_thresh.max(1));
        let lrus = vec![VecDeque::new(); bounds.len()];
        Self { bounds, lrus }
    }

    fn bucket_for(&self, blk_cnt: u32) -> usize {
        self.bounds
            .iter()
            .position(|&bound| blk_cnt <= bound)
            .unwrap_or(self.bounds.len() - 1)
    }

    /// Insert keeping the LRU ordered ascending by age (oldest at head).
    /// A newly-stamped extent (`just_stamped == true`) is always
    /// youngest and goes straight to the tail, matching
    /// `compound_free`'s fast path for the `VEA_FL_GEN_AGE` case.
    pub fn insert(&mut self, ext: FreeExtent, just_stamped: bool) {
        let idx = self.bucket_for(ext.blk_cnt);
        let lru = &mut self.lrus[idx];
        if just_stamped {
            lru.push_back(ext);
            return;
        }
        let pos = lru
            .iter()
            .position(|cur| ext.age.lru_order() < cur.age.lru_order())
            .unwrap_or(lru.len());
        lru.insert(pos, ext);
    }

    pub fn remove(&mut self, off: u64, blk_cnt: u32) -> Option<FreeExtent> {
        let idx = self.bucket_for(blk_cnt);
        let lru = &mut self.lrus[idx];
        let pos = lru.iter().position(|e| e.blk_off == off)?;
        lru.remove(pos)
    }

    /// First-fit search starting at the smallest class whose upper
    /// bound is `>= blk_cnt`, scanning each class from its head (oldest
    /// first). Does not remove the match.
    pub fn peek_first_fit(&self, blk_cnt: u32) -> Option<FreeExtent> {
        let start = self.bucket_for(blk_cnt);
        for idx in start..self.lrus.len() {
            if let Some(e) = self.lrus[idx].iter().find(|e| e.blk_cnt >= blk_cnt) {
                return Some(*e);
            }
        }
        None
    }

    pub fn check_lru_age_order(&self) -> bool {
        self.lrus.iter().all(|lru| {
            lru.iter()
                .zip(lru.iter().skip(1))
                .all(|(a, b)| a.age.lru_order() <= b.age.lru_order())
        })
    }
}

/// In-memory compound free-extent index: offset tree + size-class LRUs
/// + large-extent max-heap.
#[derive(Debug, Clone)]
pub struct FreeIndex {
    offset: BTreeMap<u64, FreeExtent>,
    large_heap: BTreeSet<(u32, u64)>,
    size_classes: SizeClassSet,
    large_thresh: u32,
}

impl FreeIndex {
    pub fn new(large_thresh: u32) -> Self {
        Self {
            offset: BTreeMap::new(),
            large_heap: BTreeSet::new(),
            size_classes: SizeClassSet::new(large_thresh),
            large_thresh,
        }
    }

    pub fn large_thresh(&self) -> u32 {
        self.large_thresh
    }

    pub fn is_empty(&self) -> bool {
        self.offset.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offset.len()
    }

    pub fn iter_offsets(&self) -> impl Iterator<Item = &FreeExtent> {
        self.offset.values()
    }

    pub fn get(&self, off: u64) -> Option<&FreeExtent> {
        self.offset.get(&off)
    }

    pub fn max_heap_peek(&self) -> Option<FreeExtent> {
        self.large_heap
            .iter()
            .next_back()
            .and_then(|(_, off)| self.offset.get(off).copied())
    }

    /// Remove an extent from wherever it currently lives (heap or size
    /// class) and from the offset tree. Returns the removed extent.
    fn remove_tracked(&mut self, off: u64) -> Option<FreeExtent> {
        let ext = self.offset.remove(&off)?;
        if ext.blk_cnt > self.large_thresh {
            self.large_heap.remove(&(ext.blk_cnt, off));
        } else {
            self.size_classes.remove(off, ext.blk_cnt);
        }
        Some(ext)
    }

    /// Insert an extent into the offset tree and whichever secondary
    /// index it belongs in, given it was just freshly age-stamped.
    fn insert_tracked(&mut self, ext: FreeExtent, just_stamped: bool) {
        self.offset.insert(ext.blk_off, ext);
        if ext.blk_cnt > self.large_thresh {
            self.large_heap.insert((ext.blk_cnt, ext.blk_off));
        } else {
            self.size_classes.insert(ext, just_stamped);
        }
    }

    /// Remove the extent for a reservation that was carved from it,
    /// without reinserting. Used by the reservation engine's donor
    /// removal step.
    pub fn take(&mut self, off: u64) -> Option<FreeExtent> {
        self.remove_tracked(off)
    }

    /// Find a size-class donor without removing it, for the reservation
    /// engine's size-class fallback path.
    pub fn peek_size_class(&self, blk_cnt: u32) -> Option<FreeExtent> {
        self.size_classes.peek_first_fit(blk_cnt)
    }

    pub fn check_no_overlap(&self) -> bool {
        let mut prev_end: Option<u64> = None;
        for ext in self.offset.values() {
            if let Some(end) = prev_end {
                if end > ext.blk_off {
                    return false;
                }
            }
            prev_end = Some(ext.end());
        }
        true
    }

    pub fn check_heap_invariant(&self) -> bool {
        let max = self.max_heap_peek().map(|e| e.blk_cnt);
        let tracked_max = self.large_heap.iter().next_back().map(|(cnt, _)| *cnt);
        max == tracked_max
            && self
                .large_heap
                .iter()
                .all(|(cnt, _)| *cnt > self.large_thresh)
    }

    pub fn size_classes(&self) -> &SizeClassSet {
        &self.size_classes
    }
}

/// The quarantine: extents freed but not yet reuse-eligible (component
/// C5's data half). Ordered by insertion time (the LRU) and mirrored by
/// offset for adjacency coalescing.
#[derive(Debug, Clone, Default)]
pub struct AggregateIndex {
    offset: BTreeMap<u64, FreeExtent>,
    lru: VecDeque<u64>,
    last_migrate_ms: u64,
}

impl AggregateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_migrate_ms(&self) -> u64 {
        self.last_migrate_ms
    }

    pub fn set_last_migrate_ms(&mut self, ms: u64) {
        self.last_migrate_ms = ms;
    }

    pub fn is_empty(&self) -> bool {
        self.offset.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offset.len()
    }

    pub fn get(&self, off: u64) -> Option<&FreeExtent> {
        self.offset.get(&off)
    }

    pub fn iter_front_to_back(&self) -> impl Iterator<Item = &FreeExtent> + '_ {
        self.lru.iter().filter_map(move |off| self.offset.get(off))
    }

    fn remove_tracked(&mut self, off: u64) -> Option<FreeExtent> {
        let ext = self.offset.remove(&off)?;
        if let Some(pos) = self.lru.iter().position(|o| *o == off) {
            self.lru.remove(pos);
        }
        Some(ext)
    }

    fn insert_tracked_tail(&mut self, ext: FreeExtent) {
        self.offset.insert(ext.blk_off, ext);
        self.lru.push_back(ext.blk_off);
    }

    /// Pop the front (oldest) entry if present, without checking
    /// expiry. Used by `migrate`.
    pub fn pop_front(&mut self) -> Option<FreeExtent> {
        let off = self.lru.pop_front()?;
        self.offset.remove(&off)
    }

    pub fn peek_front(&self) -> Option<&FreeExtent> {
        self.lru.front().and_then(|off| self.offset.get(off))
    }

    /// Remove and return every entry whose age has expired as of `now`
    /// (`now >= entry.age + interval`), scanning the whole LRU rather
    /// than stopping at the first non-expired entry: a merge inside
    /// `aggregated_free` can leave a younger extent ahead of an older
    /// one in insertion order.
    pub fn drain_expired(&mut self, now: u64, interval: u64) -> Vec<FreeExtent> {
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.lru.len());
        while let Some(off) = self.lru.pop_front() {
            match self.offset.get(&off).copied() {
                Some(ext) if now >= ext.age.to_raw().saturating_add(interval) => {
                    self.offset.remove(&off);
                    expired.push(ext);
                }
                Some(_) => remaining.push_back(off),
                None => {}
            }
        }
        self.lru = remaining;
        expired
    }
}

/// Adjacency-merge scan shared by `compound_free`, `persistent_free`,
/// and `aggregated_free` — the single code path the teacher's
/// `merge_free_ext` uses across its three `VEA_TYPE_*` instantiations.
trait ExtentStore {
    fn find_le(&self, off: u64) -> Option<FreeExtent>;
    fn find_ge(&self, off: u64) -> Option<FreeExtent>;
    fn take_at(&mut self, off: u64) -> Option<FreeExtent>;
}

impl ExtentStore for FreeIndex {
    fn find_le(&self, off: u64) -> Option<FreeExtent> {
        self.offset.range(..=off).next_back().map(|(_, v)| *v)
    }
    fn find_ge(&self, off: u64) -> Option<FreeExtent> {
        self.offset.range(off..).next().map(|(_, v)| *v)
    }
    fn take_at(&mut self, off: u64) -> Option<FreeExtent> {
        self.remove_tracked(off)
    }
}

impl ExtentStore for AggregateIndex {
    fn find_le(&self, off: u64) -> Option<FreeExtent> {
        self.offset.range(..=off).next_back().map(|(_, v)| *v)
    }
    fn find_ge(&self, off: u64) -> Option<FreeExtent> {
        self.offset.range(off..).next().map(|(_, v)| *v)
    }
    fn take_at(&mut self, off: u64) -> Option<FreeExtent> {
        self.remove_tracked(off)
    }
}

/// Blanket adapter letting any persistent `OrderedMap<Key = u64, Value =
/// FreeExtent>` participate in the same merge scan as the two in-memory
/// indexes above.
struct PersistentAdapter<'a, P>(&'a mut P);

impl<'a, P> ExtentStore for PersistentAdapter<'a, P>
where
    P: OrderedMap<Key = u64, Value = FreeExtent>,
{
    fn find_le(&self, off: u64) -> Option<FreeExtent> {
        let cursor = self.0.probe(ProbeOp::Le(off))?;
        self.0.fetch(&cursor).map(|(_, v)| v)
    }
    fn find_ge(&self, off: u64) -> Option<FreeExtent> {
        let cursor = self.0.probe(ProbeOp::Ge(off))?;
        self.0.fetch(&cursor).map(|(_, v)| v)
    }
    fn take_at(&mut self, off: u64) -> Option<FreeExtent> {
        let cursor = self.0.probe(ProbeOp::Eq(off))?;
        let (_, v) = self.0.fetch(&cursor)?;
        self.0.delete(&cursor);
        Some(v)
    }
}

/// Merge `ext` with any adjacent extent already present in `store`,
/// returning the fully-merged extent. `NO_MERGE` turns any discovered
/// adjacency into `CoreError::Corrupt` instead of merging, matching
/// `VEA_FL_NO_MERGE`'s "fatal invariant violation" semantics.
fn merge_adjacent(
    store: &mut dyn ExtentStore,
    mut ext: FreeExtent,
    no_merge: bool,
) -> CoreResult<FreeExtent> {
    // LE neighbor first.
    if let Some(le) = store.find_le(ext.blk_off) {
        if le.blk_off != ext.blk_off {
            match le.adjacency(&ext) {
                Adjacency::Adjacent => {
                    if no_merge {
                        return Err(CoreError::Corrupt(format!(
                            "unexpected adjacent extents [{}, {}] and [{}, {}]",
                            le.blk_off, le.blk_cnt, ext.blk_off, ext.blk_cnt
                        )));
                    }
                    store.take_at(le.blk_off);
                    ext = FreeExtent::new(le.blk_off, le.blk_cnt + ext.blk_cnt, le.age);
                }
                Adjacency::Overlap => {
                    return Err(CoreError::Corrupt(format!(
                        "overlapping free extents at offset {}",
                        le.blk_off
                    )));
                }
                Adjacency::Apart => {}
            }
        }
    }
    // GE neighbor.
    if let Some(ge) = store.find_ge(ext.end()) {
        if ge.blk_off != ext.blk_off {
            match ext.adjacency(&ge) {
                Adjacency::Adjacent => {
                    if no_merge {
                        return Err(CoreError::Corrupt(format!(
                            "unexpected adjacent extents [{}, {}] and [{}, {}]",
                            ext.blk_off, ext.blk_cnt, ge.blk_off, ge.blk_cnt
                        )));
                    }
                    store.take_at(ge.blk_off);
                    ext.blk_cnt += ge.blk_cnt;
                }
                Adjacency::Overlap => {
                    return Err(CoreError::Corrupt(format!(
                        "overlapping free extents at offset {}",
                        ge.blk_off
                    )));
                }
                Adjacency::Apart => {}
            }
        }
    }
    Ok(ext)
}

/// Insert `ext` into the allocatable in-memory indexes (spec.md §4.1).
#[instrument(skip(index, clock), fields(off = ext.blk_off, cnt = ext.blk_cnt))]
pub fn compound_free(
    index: &mut FreeIndex,
    clock: &dyn crate::Clock,
    mut ext: FreeExtent,
    flags: FreeFlags,
) -> CoreResult<()> {
    ext.verify(None)?;
    if flags.gen_age {
        ext.age = crate::extent::Age::Value(clock.now_ms());
    }
    let merged = merge_adjacent(index, ext, flags.no_merge)?;
    trace!(merged_off = merged.blk_off, merged_cnt = merged.blk_cnt, "compound free merged");
    index.insert_tracked(merged, flags.gen_age);
    Ok(())
}

/// Transactional counterpart: writes the merged record to the
/// persistent free map with `age = Frozen`.
pub fn persistent_free<P>(map: &mut P, ext: FreeExtent) -> CoreResult<()>
where
    P: OrderedMap<Key = u64, Value = FreeExtent>,
{
    ext.verify(None)?;
    let mut adapter = PersistentAdapter(map);
    let merged = merge_adjacent(&mut adapter, ext, false)?;
    let mut merged = merged;
    merged.age = crate::extent::Age::Frozen;
    map.update(merged.blk_off, merged);
    Ok(())
}

/// Insert into the quarantine (component C5).
pub fn aggregated_free(
    agg: &mut AggregateIndex,
    clock: &dyn crate::Clock,
    mut ext: FreeExtent,
) -> CoreResult<()> {
    ext.verify(None)?;
    ext.age = crate::extent::Age::Value(clock.now_ms());
    let merged = merge_adjacent(agg, ext, false)?;
    agg.insert_tracked_tail(merged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::extent::Age;
    use crate::memstore::BTreeOrderedMap;

    #[test]
    fn compound_free_merges_adjacent_extents() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(16);
        compound_free(&mut index, &clock, FreeExtent::new(0, 4, Age::Frozen), FreeFlags::NONE).unwrap();
        compound_free(&mut index, &clock, FreeExtent::new(4, 4, Age::Frozen), FreeFlags::NONE).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(0), Some(&FreeExtent::new(0, 8, Age::Frozen)));
        assert!(index.check_no_overlap());
    }

    #[test]
    fn large_extent_tracked_in_heap() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(16);
        compound_free(&mut index, &clock, FreeExtent::new(100, 20, Age::Value(5)), FreeFlags::NONE).unwrap();

        assert_eq!(index.max_heap_peek(), Some(FreeExtent::new(100, 20, Age::Value(5))));
        assert!(index.check_heap_invariant());
    }

    #[test]
    fn persistent_free_merges_adjacent_records() {
        // persistent_free merges unconditionally with both neighbors,
        // the same rule compound_free applies to the in-memory index.
        let mut persist = BTreeOrderedMap::new();
        persist.update(0, FreeExtent::new(0, 4, Age::Frozen));

        persistent_free(&mut persist, FreeExtent::new(4, 4, Age::Value(999))).unwrap();

        assert_eq!(persist.len(), 1);
        let (_, rec) = persist.fetch(&0).unwrap();
        assert_eq!(rec, FreeExtent::new(0, 8, Age::Frozen));
    }

    #[test]
    fn quarantine_drain_expired_respects_interval() {
        let clock = TestClock::new();
        let mut agg = AggregateIndex::new();

        aggregated_free(&mut agg, &clock, FreeExtent::new(0, 4, Age::Frozen)).unwrap();
        clock.advance(50);
        aggregated_free(&mut agg, &clock, FreeExtent::new(10, 4, Age::Frozen)).unwrap();

        let expired = agg.drain_expired(60, 50);
        assert_eq!(expired, vec![FreeExtent::new(0, 4, Age::Value(0))]);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.get(10), Some(&FreeExtent::new(10, 4, Age::Value(50))));
    }

    #[test]
    fn size_class_bucket_ladder_doubles_up_to_threshold() {
        let classes = SizeClassSet::new(16);
        assert_eq!(classes.bucket_for(1), 0);
        assert_eq!(classes.bucket_for(2), 1);
        assert_eq!(classes.bucket_for(3), 2);
        assert_eq!(classes.bucket_for(8), 3);
        assert_eq!(classes.bucket_for(9), 4);
        assert_eq!(classes.bucket_for(16), 4);
    }
}
