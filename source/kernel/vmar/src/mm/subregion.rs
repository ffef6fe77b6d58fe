// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Ordered, non-overlapping children of one region
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SubregionSet (crate-internal)
//! DEPENDS_ON: alloc::collections::BTreeMap, rand_core::RngCore
//! INVARIANTS: Entries are keyed by base and never overlap; sizes are non-zero

use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

use rand_core::RngCore;

use super::error::VmError;
use super::node::NodeId;

/// One direct child as seen from its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Child {
    pub base: usize,
    pub size: usize,
    pub id: NodeId,
}

impl Child {
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    id: NodeId,
    size: usize,
}

#[derive(Default, Debug, PartialEq, Eq)]
pub(crate) struct SubregionSet {
    map: BTreeMap<usize, Entry>,
}

impl SubregionSet {
    pub const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    fn child(base: &usize, entry: &Entry) -> Child {
        Child { base: *base, size: entry.size, id: entry.id }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn first(&self) -> Option<Child> {
        self.map.iter().next().map(|(b, e)| Self::child(b, e))
    }

    pub fn iter(&self) -> impl Iterator<Item = Child> + '_ {
        self.map.iter().map(|(b, e)| Self::child(b, e))
    }

    /// True if no child intersects `[base, base + size)`.
    pub fn is_range_available(&self, base: usize, size: usize) -> bool {
        if let Some(prev) = self.at_or_below(base) {
            if prev.end() > base {
                return false;
            }
        }
        match self.map.range(base..).next() {
            Some((next_base, _)) => *next_base - base >= size,
            None => true,
        }
    }

    pub fn insert(&mut self, base: usize, size: usize, id: NodeId) {
        assert!(size > 0, "zero-sized child");
        assert!(self.is_range_available(base, size), "overlapping child at {base:#x}");
        self.map.insert(base, Entry { id, size });
    }

    pub fn remove(&mut self, base: usize, id: NodeId) {
        let removed = self.map.remove(&base);
        assert!(
            matches!(removed, Some(entry) if entry.id == id),
            "child at {base:#x} missing from parent"
        );
    }

    /// Child containing `addr`.
    pub fn find(&self, addr: usize) -> Option<Child> {
        self.at_or_below(addr).filter(|c| addr - c.base < c.size)
    }

    /// First child whose base is strictly above `addr`.
    pub fn upper_bound(&self, addr: usize) -> Option<Child> {
        self.map.range((Excluded(addr), Unbounded)).next().map(|(b, e)| Self::child(b, e))
    }

    /// Child containing `addr`, else the first child above it.
    pub fn include_or_higher(&self, addr: usize) -> Option<Child> {
        self.find(addr).or_else(|| self.upper_bound(addr))
    }

    /// Last child whose base is at or below `addr`.
    pub fn at_or_below(&self, addr: usize) -> Option<Child> {
        self.map.range(..=addr).next_back().map(|(b, e)| Self::child(b, e))
    }

    /// Updates the recorded size of the child at `base`.
    pub fn resize(&mut self, base: usize, size: usize) {
        let entry = self.map.get_mut(&base);
        assert!(entry.is_some(), "resize of unknown child at {base:#x}");
        if let Some(entry) = entry {
            entry.size = size;
        }
    }

    /// Moves the child at `old_base` to `new_base` with `new_size`.
    pub fn rebase(&mut self, old_base: usize, new_base: usize, new_size: usize) {
        let entry = self.map.remove(&old_base);
        assert!(entry.is_some(), "rebase of unknown child at {old_base:#x}");
        if let Some(entry) = entry {
            self.insert(new_base, new_size, entry.id);
        }
    }

    /// Visits every maximal free range inside `[lo, hi)` in address order.
    /// The callback returns `false` to stop.
    pub fn for_each_gap(&self, lo: usize, hi: usize, mut f: impl FnMut(usize, usize) -> bool) {
        if lo >= hi {
            return;
        }
        let start = self.at_or_below(lo).map_or(lo, |c| c.base);
        let mut cursor = lo;
        for (base, entry) in self.map.range(start..hi) {
            let end = *base + entry.size;
            if end <= cursor {
                continue;
            }
            if *base > cursor && !f(cursor, *base - cursor) {
                return;
            }
            cursor = cursor.max(end);
            if cursor >= hi {
                return;
            }
        }
        if cursor < hi {
            f(cursor, hi - cursor);
        }
    }

    /// Picks a candidate base for `size` bytes aligned to `1 << align_pow2`.
    ///
    /// Every aligned position of every gap inside
    /// `[parent_base, min(parent_base + parent_size, upper_limit))` is a
    /// candidate, counted from the lowest address. Only the first
    /// `2^entropy_bits` candidates are eligible; one of them is drawn
    /// uniformly from `rng`. Without a PRNG or entropy the lowest candidate
    /// wins.
    #[allow(clippy::too_many_arguments)]
    pub fn get_alloc_spot(
        &self,
        align_pow2: u8,
        entropy_bits: u8,
        size: usize,
        parent_base: usize,
        parent_size: usize,
        rng: Option<&mut (dyn RngCore + Send)>,
        upper_limit: usize,
    ) -> Result<usize, VmError> {
        debug_assert!(size > 0);
        let align = 1usize << align_pow2;
        let hi = (parent_base + parent_size).min(upper_limit);

        let max_candidates: u64 = match (&rng, entropy_bits) {
            (Some(_), bits) if bits > 0 => 1u64 << bits.min(63),
            _ => 1,
        };

        let mut total: u64 = 0;
        self.for_each_gap(parent_base, hi, |gap_base, gap_len| {
            total = total.saturating_add(candidates_in(gap_base, gap_len, align, align_pow2, size));
            total < max_candidates
        });
        let total = total.min(max_candidates);
        if total == 0 {
            return Err(VmError::OutOfSpace);
        }

        let mut index = match rng {
            Some(rng) if total > 1 => uniform(rng, total),
            _ => 0,
        };

        let mut spot = None;
        self.for_each_gap(parent_base, hi, |gap_base, gap_len| {
            let count = candidates_in(gap_base, gap_len, align, align_pow2, size);
            if index < count {
                // A gap with candidates has an aligned first address.
                let first = super::align_up(gap_base, align).unwrap_or(gap_base);
                spot = Some(first + (index as usize) * align);
                return false;
            }
            index -= count;
            true
        });
        spot.ok_or(VmError::OutOfSpace)
    }
}

/// Number of aligned positions for `size` bytes inside `[gap_base, gap_base + gap_len)`.
fn candidates_in(gap_base: usize, gap_len: usize, align: usize, align_pow2: u8, size: usize) -> u64 {
    let Some(first) = super::align_up(gap_base, align) else {
        return 0;
    };
    let gap_end = gap_base + gap_len;
    match first.checked_add(size) {
        Some(end) if end <= gap_end => (((gap_end - end) >> align_pow2) + 1) as u64,
        _ => 0,
    }
}

/// Unbiased draw from `[0, bound)`.
fn uniform(rng: &mut (dyn RngCore + Send), bound: u64) -> u64 {
    debug_assert!(bound > 0);
    let threshold = bound.wrapping_neg() % bound;
    loop {
        let value = rng.next_u64();
        if value >= threshold {
            return value % bound;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::node::{Node, NodeArena};
    use crate::mm::VmarFlags;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::vec::Vec;

    fn ids(n: usize) -> Vec<NodeId> {
        let mut arena = NodeArena::new();
        (0..n)
            .map(|_| {
                arena
                    .insert(Node::region(0, 0x1000, VmarFlags::empty(), None, ""))
                    .expect("insert")
            })
            .collect()
    }

    #[test]
    fn lookups_follow_ordering() {
        let id = ids(2);
        let mut set = SubregionSet::new();
        set.insert(0x1000, 0x1000, id[0]);
        set.insert(0x3000, 0x1000, id[1]);
        assert_eq!(set.find(0x1fff).map(|c| c.id), Some(id[0]));
        assert!(set.find(0x2000).is_none());
        assert_eq!(set.include_or_higher(0x2000).map(|c| c.base), Some(0x3000));
        assert_eq!(set.upper_bound(0x1000).map(|c| c.base), Some(0x3000));
        assert_eq!(set.at_or_below(0x2fff).map(|c| c.base), Some(0x1000));
        assert!(set.is_range_available(0x2000, 0x1000));
        assert!(!set.is_range_available(0x2000, 0x1001));
        assert!(!set.is_range_available(0x1800, 0x100));
    }

    #[test]
    #[should_panic]
    fn overlapping_insert_is_fatal() {
        let id = ids(2);
        let mut set = SubregionSet::new();
        set.insert(0x1000, 0x2000, id[0]);
        set.insert(0x2000, 0x1000, id[1]);
    }

    #[test]
    fn gaps_cover_free_space() {
        let id = ids(2);
        let mut set = SubregionSet::new();
        set.insert(0x2000, 0x1000, id[0]);
        set.insert(0x5000, 0x1000, id[1]);
        let mut gaps = Vec::new();
        set.for_each_gap(0x1000, 0x8000, |b, l| {
            gaps.push((b, l));
            true
        });
        assert_eq!(gaps, [(0x1000, 0x1000), (0x3000, 0x2000), (0x6000, 0x2000)]);
    }

    #[test]
    fn first_fit_without_entropy() {
        let id = ids(1);
        let mut set = SubregionSet::new();
        set.insert(0x1000, 0x1000, id[0]);
        let spot = set.get_alloc_spot(12, 0, 0x1000, 0x1000, 0x10000, None, usize::MAX);
        assert_eq!(spot, Ok(0x2000));
        let full = set.get_alloc_spot(12, 0, 0x10000, 0x1000, 0x10000, None, usize::MAX);
        assert_eq!(full, Err(VmError::OutOfSpace));
    }

    #[test]
    fn randomized_spot_is_aligned_and_free() {
        let id = ids(1);
        let mut set = SubregionSet::new();
        set.insert(0x4000, 0x4000, id[0]);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for _ in 0..64 {
            let spot = set
                .get_alloc_spot(13, 8, 0x2000, 0, 0x20000, Some(&mut rng), usize::MAX)
                .expect("spot");
            assert_eq!(spot % 0x2000, 0);
            assert!(spot + 0x2000 <= 0x20000);
            assert!(set.is_range_available(spot, 0x2000));
        }
    }

    #[test]
    fn upper_limit_bounds_search() {
        let set = SubregionSet::new();
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        for _ in 0..32 {
            let spot = set
                .get_alloc_spot(12, 10, 0x1000, 0x1000, 0x100000, Some(&mut rng), 0x4000)
                .expect("spot");
            assert!(spot >= 0x1000 && spot + 0x1000 <= 0x4000);
        }
    }
}
