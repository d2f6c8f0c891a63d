//! On-disk and in-memory record shapes for the free-extent index.
//!
//! Layouts follow the teacher crate's convention of a fixed `#[repr(C)]`,
//! `bytemuck::Pod` header plus a checksum, rather than hand-rolled
//! big-endian packing.

use bytemuck::{Pod, Zeroable};

/// Format magic for the space header, matching spec.md's external
/// interface section byte-for-byte.
pub const SPACE_MAGIC: u32 = 0xea20_1804;

/// Large-extent threshold default, in MiB. Overridable via `VeaConfig`.
pub const DEFAULT_LARGE_EXT_MB: u32 = 64;

/// Maximum number of ranges packed into a single vector reservation.
/// `original_source`'s `verify_vec_entry` references this cap without
/// defining it in the filtered sources available to this crate; fixed
/// here at 32 (see DESIGN.md).
pub const VEA_EXT_VECTOR_MAX: usize = 32;

/// Age sentinel. `Frozen` is the `age == VEA_EXT_AGE_MAX` marker from the
/// original: "not yet reuse-eligible" (quarantined, or never allocated
/// from in the persistent free map). Kept as its own variant rather than
/// `u64::MAX` so arithmetic on an age can't silently treat the sentinel
/// as a real timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Age {
    Value(u64),
    Frozen,
}

impl Age {
    pub const fn to_raw(self) -> u64 {
        match self {
            Age::Value(v) => v,
            Age::Frozen => u64::MAX,
        }
    }

    pub const fn from_raw(raw: u64) -> Self {
        if raw == u64::MAX {
            Age::Frozen
        } else {
            Age::Value(raw)
        }
    }

    /// Ordering used by the size-class LRUs: oldest (smallest numeric age)
    /// first. `Frozen` sorts after every real age, since a frozen extent
    /// should never be picked for reservation ahead of a reusable one.
    pub fn lru_order(self) -> u64 {
        self.to_raw()
    }
}

/// A contiguous free range of blocks, keyed by its starting offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeExtent {
    pub blk_off: u64,
    pub blk_cnt: u32,
    pub age: Age,
}

impl FreeExtent {
    pub fn new(blk_off: u64, blk_cnt: u32, age: Age) -> Self {
        Self {
            blk_off,
            blk_cnt,
            age,
        }
    }

    pub fn end(&self) -> u64 {
        self.blk_off + self.blk_cnt as u64
    }

    /// Verifies the invariant that a free entry is non-empty and its
    /// stored key matches its offset. Equivalent to the original's
    /// `verify_free_entry`.
    pub fn verify(&self, expected_off: Option<u64>) -> Result<(), crate::CoreError> {
        if let Some(off) = expected_off {
            if off != self.blk_off {
                return Err(crate::CoreError::Corrupt(format!(
                    "free entry key {off} != stored offset {}",
                    self.blk_off
                )));
            }
        }
        if self.blk_cnt == 0 {
            return Err(crate::CoreError::Corrupt(
                "free entry has zero block count".into(),
            ));
        }
        Ok(())
    }

    /// Adjacency test between `self` (assumed to sort before `next`) and
    /// `next`. `Overlap` indicates corruption and must never be silently
    /// repaired by the caller.
    pub fn adjacency(&self, next: &FreeExtent) -> Adjacency {
        let cur_end = self.end();
        if cur_end == next.blk_off {
            Adjacency::Adjacent
        } else if cur_end < next.blk_off {
            Adjacency::Apart
        } else {
            Adjacency::Overlap
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjacency {
    Adjacent,
    Apart,
    Overlap,
}

/// Flags accepted by `compound_free`/`cancel`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeFlags {
    /// Stamp the merged extent's age with `now_ms()` rather than
    /// preserving a donor's age.
    pub gen_age: bool,
    /// Treat any adjacency found during the merge scan as a fatal
    /// corruption instead of merging. Used when the caller already knows
    /// the extent can't be adjacent to anything (e.g. publishing a
    /// reservation back out is never expected to find neighbors it
    /// didn't itself carve from).
    pub no_merge: bool,
}

impl FreeFlags {
    pub const NONE: Self = Self {
        gen_age: false,
        no_merge: false,
    };
    pub const GEN_AGE: Self = Self {
        gen_age: true,
        no_merge: false,
    };
    pub const NO_MERGE: Self = Self {
        gen_age: false,
        no_merge: true,
    };
}

/// Non-contiguous reservation, used when a request can't be satisfied by
/// a single extent. Keyed by its first offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorExtent {
    pub ranges: Vec<(u64, u32)>,
}

impl VectorExtent {
    pub fn push(&mut self, off: u64, cnt: u32) -> Result<(), crate::CoreError> {
        if self.ranges.len() >= VEA_EXT_VECTOR_MAX {
            return Err(crate::CoreError::Invalid(
                "vector reservation exceeded VEA_EXT_VECTOR_MAX ranges",
            ));
        }
        self.ranges.push((off, cnt));
        Ok(())
    }

    pub fn total_blocks(&self) -> u64 {
        self.ranges.iter().map(|(_, c)| *c as u64).sum()
    }
}

/// Per-I/O-stream locality hint. Embedded directly in [`SpaceHeader`] so
/// `publish` has a real on-disk slot to install the updated hint into,
/// rather than just mutating the caller's in-memory copy.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HintRecord {
    pub last_off: u64,
    pub seq: u64,
}

/// Root of the persistent allocator state.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SpaceHeader {
    pub magic: u32,
    pub blk_sz: u32,
    pub hdr_blks: u32,
    pub _pad: u32,
    pub capacity: u64,
    pub free_root: u64,
    pub vec_root: u64,
    pub hint_root: HintRecord,
}

impl SpaceHeader {
    pub fn new(blk_sz: u32, hdr_blks: u32, capacity: u64) -> Self {
        Self {
            magic: SPACE_MAGIC,
            blk_sz,
            hdr_blks,
            _pad: 0,
            capacity,
            free_root: 0,
            vec_root: 0,
            hint_root: HintRecord::default(),
        }
    }

    /// Serialize with a trailing xxh3 checksum, the same shape the
    /// teacher crate uses for its root page (`RootData::store`).
    pub fn to_bytes_checked(&self) -> Vec<u8> {
        let mut buf = bytemuck::bytes_of(self).to_vec();
        let hash = xxhash_rust::xxh3::xxh3_64(&buf);
        buf.extend_from_slice(&hash.to_le_bytes());
        buf
    }

    pub fn from_bytes_checked(buf: &[u8]) -> Result<Self, crate::CoreError> {
        let hdr_len = std::mem::size_of::<SpaceHeader>();
        if buf.len() < hdr_len + 8 {
            return Err(crate::CoreError::Corrupt("space header truncated".into()));
        }
        let (hdr_bytes, rest) = buf.split_at(hdr_len);
        let (hash_bytes, _) = rest.split_at(8);
        let hash = u64::from_le_bytes(hash_bytes.try_into().unwrap());
        let expected = xxhash_rust::xxh3::xxh3_64(hdr_bytes);
        if hash != expected {
            return Err(crate::CoreError::Corrupt(
                "space header checksum mismatch".into(),
            ));
        }
        let header: &SpaceHeader = bytemuck::from_bytes(hdr_bytes);
        if header.magic != SPACE_MAGIC {
            return Err(crate::CoreError::Corrupt(
                "space header magic mismatch".into(),
            ));
        }
        Ok(*header)
    }
}

/// Writer identifier attached to every stored value version.
pub type Cookie = u64;
/// Monotonically increasing version tag on every stored value.
pub type Epoch = u64;

pub const EPOCH_MAX: Epoch = u64::MAX;
