//! The reservation engine (component C4): hinted, large, size-class,
//! and vector-fallback paths over the compound free-extent index.
//!
//! Grounded on spec.md §4.2's pseudocode; the in-memory mechanics reuse
//! `compound_free`/`FreeIndex` from [`super::free_class`].

use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::extent::{Age, FreeExtent, FreeFlags, HintRecord, VectorExtent};

use super::free_class::{compound_free, FreeIndex};

/// A reservation's carved ranges plus, for each range, the donor
/// extent's age at the time it was carved. The age isn't part of the
/// persisted vector record (spec.md §6), but `cancel` needs it to
/// restore the in-memory indexes byte-for-byte even when a carve
/// consumed its donor entirely and left no adjacent residual to adopt
/// the age from during the merge scan.
#[derive(Debug, Clone, Default)]
pub struct Reservation {
    pub list: VectorExtent,
    donor_ages: Vec<Age>,
}

impl Reservation {
    pub fn total_blocks(&self) -> u64 {
        self.list.total_blocks()
    }

    fn push(&mut self, off: u64, cnt: u32, age: Age) -> CoreResult<()> {
        self.list.push(off, cnt)?;
        self.donor_ages.push(age);
        Ok(())
    }
}

/// Carve `blk_cnt` blocks out of `donor`, record the carved range, and
/// reinsert any residual with the donor's original age preserved
/// (`NO_GEN_AGE`). `from_tail` carves from the end of the donor rather
/// than the start, used by the large-extent path to keep the head of a
/// dividable extent intact for future large requests.
fn carve(
    index: &mut FreeIndex,
    clock: &dyn Clock,
    donor: FreeExtent,
    blk_cnt: u32,
    from_tail: bool,
    out: &mut Reservation,
) -> CoreResult<()> {
    index.take(donor.blk_off);
    let carved_off = if from_tail {
        donor.blk_off + (donor.blk_cnt - blk_cnt) as u64
    } else {
        donor.blk_off
    };
    out.push(carved_off, blk_cnt, donor.age)?;
    if donor.blk_cnt > blk_cnt {
        let residual = if from_tail {
            FreeExtent::new(donor.blk_off, donor.blk_cnt - blk_cnt, donor.age)
        } else {
            FreeExtent::new(
                donor.blk_off + blk_cnt as u64,
                donor.blk_cnt - blk_cnt,
                donor.age,
            )
        };
        compound_free(index, clock, residual, FreeFlags::NONE)?;
    }
    Ok(())
}

/// Assemble a vector reservation by repeating the size-class/large-heap
/// first-fit search with a shrinking request until `blk_cnt` total
/// blocks are gathered, or the index is exhausted.
fn vector_reserve(index: &mut FreeIndex, clock: &dyn Clock, mut remaining: u32) -> CoreResult<Reservation> {
    let mut out = Reservation::default();
    while remaining > 0 {
        let donor = index
            .peek_size_class(1)
            .or_else(|| index.max_heap_peek());
        let Some(donor) = donor else {
            return Err(CoreError::OutOfSpace { requested: remaining });
        };
        let take = donor.blk_cnt.min(remaining);
        carve(index, clock, donor, take, false, &mut out)?;
        remaining -= take;
    }
    Ok(out)
}

/// `reserve(blk_cnt, hint) -> ReservedList` (spec.md §4.2).
#[instrument(skip(index, clock, hint), fields(blk_cnt))]
pub fn reserve(
    index: &mut FreeIndex,
    clock: &dyn Clock,
    hint: &mut HintRecord,
    blk_cnt: u32,
) -> CoreResult<Reservation> {
    if blk_cnt == 0 {
        return Err(CoreError::Invalid("reserve requested zero blocks"));
    }
    let mut out = Reservation::default();

    // 1. Hinted path: the hint only ever points exactly at a free
    // extent's own key, never into its middle.
    if let Some(donor) = index.get(hint.last_off).copied() {
        if donor.blk_cnt >= blk_cnt {
            carve(index, clock, donor, blk_cnt, false, &mut out)?;
            hint.last_off += blk_cnt as u64;
            hint.seq += 1;
            debug!(off = hint.last_off, seq = hint.seq, "reserve: hinted path");
            return Ok(out);
        }
    }

    // 2. Large path.
    if let Some(top) = index.max_heap_peek() {
        if top.blk_cnt >= blk_cnt && top.age != Age::Frozen {
            let dividable = top.blk_cnt > 2 * index.large_thresh();
            carve(index, clock, top, blk_cnt, dividable, &mut out)?;
            debug!(off = top.blk_off, dividable, "reserve: large path");
            return Ok(out);
        }
    }

    // 3. Size-class path.
    if let Some(donor) = index.peek_size_class(blk_cnt) {
        carve(index, clock, donor, blk_cnt, false, &mut out)?;
        debug!(off = donor.blk_off, "reserve: size-class path");
        return Ok(out);
    }

    // 4. Vector fallback.
    match vector_reserve(index, clock, blk_cnt) {
        Ok(out) => {
            debug!(ranges = out.list.ranges.len(), "reserve: vector fallback");
            Ok(out)
        }
        Err(_) => Err(CoreError::OutOfSpace { requested: blk_cnt }),
    }
}

/// `cancel(hint, list)`: reinstate every reserved extent with its
/// donor's original age and roll back the hint. Callable outside a
/// transaction; never touches the persistent free map.
pub fn cancel(
    index: &mut FreeIndex,
    clock: &dyn Clock,
    hint: &mut HintRecord,
    pre_reserve_hint: HintRecord,
    reservation: &Reservation,
) -> CoreResult<()> {
    for (&(off, cnt), &age) in reservation
        .list
        .ranges
        .iter()
        .zip(reservation.donor_ages.iter())
    {
        let ext = FreeExtent::new(off, cnt, age);
        compound_free(index, clock, ext, FreeFlags::NONE)?;
    }
    *hint = pre_reserve_hint;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::extent::Age;

    #[test]
    fn hinted_path_carves_at_the_hint_offset() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(1024);
        compound_free(&mut index, &clock, FreeExtent::new(100, 50, Age::Value(1)), FreeFlags::NONE).unwrap();

        let mut hint = HintRecord { last_off: 100, seq: 0 };
        let out = reserve(&mut index, &clock, &mut hint, 20).unwrap();

        assert_eq!(out.list.ranges, vec![(100, 20)]);
        assert_eq!(hint, HintRecord { last_off: 120, seq: 1 });
        assert_eq!(index.get(100), None);
        assert_eq!(index.get(120), Some(&FreeExtent::new(120, 30, Age::Value(1))));
    }

    #[test]
    fn large_path_carves_from_the_tail_when_dividable() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(4);
        compound_free(&mut index, &clock, FreeExtent::new(1000, 20, Age::Value(5)), FreeFlags::NONE).unwrap();

        // A hint pointing at offset 0 must not accidentally match: no
        // extent starts there, so the hinted path falls through.
        let mut hint = HintRecord::default();
        let out = reserve(&mut index, &clock, &mut hint, 6).unwrap();

        assert_eq!(out.list.ranges, vec![(1014, 6)]);
        assert_eq!(index.get(1000), Some(&FreeExtent::new(1000, 14, Age::Value(5))));
        assert!(index.max_heap_peek().is_some());
    }

    #[test]
    fn size_class_path_carves_from_a_matching_bucket() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(16);
        compound_free(&mut index, &clock, FreeExtent::new(2000, 10, Age::Value(3)), FreeFlags::NONE).unwrap();

        let mut hint = HintRecord::default();
        let out = reserve(&mut index, &clock, &mut hint, 8).unwrap();

        assert_eq!(out.list.ranges, vec![(2000, 8)]);
        assert_eq!(index.get(2008), Some(&FreeExtent::new(2008, 2, Age::Value(3))));
    }

    #[test]
    fn vector_fallback_assembles_a_reservation_from_several_donors() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(16);
        clock.set(1);
        compound_free(&mut index, &clock, FreeExtent::new(0, 3, Age::Frozen), FreeFlags::GEN_AGE).unwrap();
        clock.set(2);
        compound_free(&mut index, &clock, FreeExtent::new(100, 4, Age::Frozen), FreeFlags::GEN_AGE).unwrap();
        clock.set(3);
        compound_free(&mut index, &clock, FreeExtent::new(200, 3, Age::Frozen), FreeFlags::GEN_AGE).unwrap();

        let mut hint = HintRecord::default();
        let out = reserve(&mut index, &clock, &mut hint, 10).unwrap();

        assert_eq!(out.list.ranges, vec![(0, 3), (100, 4), (200, 3)]);
        assert_eq!(out.total_blocks(), 10);
        assert!(index.is_empty());
    }

    #[test]
    fn out_of_space_when_total_free_is_short() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(16);
        compound_free(&mut index, &clock, FreeExtent::new(0, 3, Age::Value(1)), FreeFlags::NONE).unwrap();

        let mut hint = HintRecord::default();
        let err = reserve(&mut index, &clock, &mut hint, 10).unwrap_err();
        assert!(matches!(err, CoreError::OutOfSpace { requested: 10 }));
    }

    #[test]
    fn cancel_restores_the_index_and_rolls_back_the_hint() {
        let clock = TestClock::new();
        let mut index = FreeIndex::new(1024);
        compound_free(&mut index, &clock, FreeExtent::new(100, 50, Age::Value(1)), FreeFlags::NONE).unwrap();

        let pre_reserve_hint = HintRecord { last_off: 100, seq: 0 };
        let mut hint = pre_reserve_hint;
        let out = reserve(&mut index, &clock, &mut hint, 20).unwrap();
        assert_ne!(hint, pre_reserve_hint);

        cancel(&mut index, &clock, &mut hint, pre_reserve_hint, &out).unwrap();

        assert_eq!(hint, pre_reserve_hint);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(100), Some(&FreeExtent::new(100, 50, Age::Value(1))));
    }
}
