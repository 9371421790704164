//! Ordered physical memory map.
//!
//! A [`MemoryMap`] is an ordered set of `(start, size, type)` ranges describing what
//! every piece of RAM is currently used for. Both physical allocators maintain one, and
//! the native loader serialises the final map into `MEMORY` tags for the kernel.
//!
//! Invariants, enforced by every operation:
//! - ranges are sorted by start address and never overlap,
//! - starts and sizes are page aligned and sizes are non-zero,
//! - two adjacent ranges never share the same type (they get merged).

use alloc::vec::Vec;

use crate::mem::{PhyAddr, PAGE_SIZE};
use crate::utils::is_aligned;

/// What a range of physical memory is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeType {
    /// Usable RAM, free for allocation.
    Free,
    /// Allocated for the kernel's long-term use.
    Allocated,
    /// Holds boot data the kernel may reclaim once consumed.
    Reclaimable,
    /// Kernel page tables built by the loader.
    Pagetables,
    /// The kernel stack.
    Stack,
    /// User-supplied boot modules.
    Modules,
    /// In use by the loader itself; released back to `Free` when the memory map is
    /// finalized.
    Internal,
}

impl RangeType {
    /// Numeric encoding used by the boot-protocol `MEMORY` tags.
    ///
    /// `Internal` ranges never survive [`finalize`](crate::mem::phys::PhysMemory) and
    /// therefore have no encoding.
    pub fn tag_encoding(self) -> u8 {
        match self {
            RangeType::Free => 0,
            RangeType::Allocated => 1,
            RangeType::Reclaimable => 2,
            RangeType::Pagetables => 3,
            RangeType::Stack => 4,
            RangeType::Modules => 5,
            RangeType::Internal => u8::MAX,
        }
    }
}

/// A single range of the memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: PhyAddr,
    pub size: u64,
    pub range_type: RangeType,
}

impl MemoryRange {
    pub fn new(start: PhyAddr, size: u64, range_type: RangeType) -> Self {
        Self {
            start,
            size,
            range_type,
        }
    }

    /// Exclusive end address of the range.
    pub fn end(&self) -> u64 {
        self.start.as_u64() + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start.as_u64() && addr < self.end()
    }
}

/// An ordered, non-overlapping set of typed physical memory ranges.
///
/// Ranges live in an owning vector kept sorted by start address.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    ranges: Vec<MemoryRange>,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total byte count of ranges matching `range_type`.
    pub fn total_of(&self, range_type: RangeType) -> u64 {
        self.ranges
            .iter()
            .filter(|r| r.range_type == range_type)
            .map(|r| r.size)
            .sum()
    }

    /// Total byte count described by the map, regardless of type.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| r.size).sum()
    }

    /// Inserts `[start, start + size)` with the given type.
    ///
    /// The new range wins over anything it overlaps: existing ranges are truncated or
    /// split around it. Adjacent ranges of the same type are merged afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `start` or `size` is not page aligned, or if `size` is zero: the
    /// callers own alignment, a violation here is a loader defect.
    pub fn insert(&mut self, start: PhyAddr, size: u64, range_type: RangeType) {
        assert!(size != 0, "zero-sized memory range");
        assert!(
            start.is_aligned_with(PAGE_SIZE) && is_aligned(size, PAGE_SIZE),
            "unaligned memory range {start} + {size:#x}"
        );

        self.carve(start.as_u64(), size);

        let pos = self
            .ranges
            .iter()
            .position(|r| r.start > start)
            .unwrap_or(self.ranges.len());
        self.ranges
            .insert(pos, MemoryRange::new(start, size, range_type));

        self.coalesce();
    }

    /// Removes `[start, start + size)` from the map entirely.
    ///
    /// Overlapping ranges are truncated or split; the address window is afterwards not
    /// covered by any range.
    pub fn remove(&mut self, start: PhyAddr, size: u64) {
        assert!(size != 0, "zero-sized memory range");
        assert!(
            start.is_aligned_with(PAGE_SIZE) && is_aligned(size, PAGE_SIZE),
            "unaligned memory range {start} + {size:#x}"
        );

        self.carve(start.as_u64(), size);
    }

    /// Deep copy of the map.
    pub fn snapshot(&self) -> MemoryMap {
        self.clone()
    }

    /// Drops every range.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Finds the range containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&MemoryRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    /// Cuts the window `[start, start + size)` out of every overlapping range,
    /// splitting ranges that extend on both sides.
    fn carve(&mut self, start: u64, size: u64) {
        let end = start + size;
        let mut split: Option<MemoryRange> = None;

        self.ranges.retain_mut(|r| {
            let r_start = r.start.as_u64();
            let r_end = r.end();

            if r_end <= start || r_start >= end {
                return true;
            }

            if r_start < start && r_end > end {
                // The window is strictly inside: keep the head, queue the tail.
                split = Some(MemoryRange::new(
                    PhyAddr::new(end),
                    r_end - end,
                    r.range_type,
                ));
                r.size = start - r_start;
                return true;
            }

            if r_start < start {
                // Overlap on the right: truncate.
                r.size = start - r_start;
                return true;
            }

            if r_end > end {
                // Overlap on the left: advance the start.
                r.start = PhyAddr::new(end);
                r.size = r_end - end;
                return true;
            }

            // Fully covered by the window.
            false
        });

        if let Some(tail) = split {
            let pos = self
                .ranges
                .iter()
                .position(|r| r.start > tail.start)
                .unwrap_or(self.ranges.len());
            self.ranges.insert(pos, tail);
        }
    }

    /// Merges adjacent ranges of identical type.
    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.ranges.len() {
            let (a, b) = (self.ranges[i], self.ranges[i + 1]);

            if a.end() == b.start.as_u64() && a.range_type == b.range_type {
                self.ranges[i].size += b.size;
                self.ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}
