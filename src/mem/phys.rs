//! Physical memory allocation.
//!
//! Two interchangeable allocators implement the [`PhysMemory`] contract:
//!
//! - [`SelfManagedAlloc`] owns the authoritative [`MemoryMap`], seeded by the platform
//!   with the machine's usable RAM. Used when the firmware has handed the machine over
//!   (BIOS after the E820 probe, U-Boot, ...).
//! - [`FirmwareAlloc`] defers ownership to the firmware's memory services (UEFI boot
//!   services). Every call re-queries the firmware map, and allocations are mirrored in
//!   a side table so the final map can be reconstructed at handoff.
//!
//! Callers must not depend on either implementation's idiosyncrasies: the contract is
//! identical, and a failed allocation without [`AllocFlags::CAN_FAIL`] aborts the boot.

use alloc::boxed::Box;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::errors::FsResult;
use crate::mem::map::{MemoryMap, MemoryRange, RangeType};
use crate::mem::{PhyAddr, PAGE_SIZE};
use crate::utils::{align_down, align_up, is_aligned};

bitflags::bitflags! {
    /// Behaviour flags for [`PhysMemory::allocate`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Prefer the highest suitable address instead of the lowest.
        const HIGH = 1 << 0;
        /// Return `None` on exhaustion instead of aborting the boot.
        const CAN_FAIL = 1 << 1;
    }
}

/// A physical allocation request.
///
/// `align` defaults to the page size; a zero `min`/`max` pair defaults to the
/// allocator's full addressable window.
#[derive(Clone, Copy, Debug)]
pub struct AllocRequest {
    pub size: u64,
    pub align: u64,
    pub min: u64,
    pub max: u64,
    pub range_type: RangeType,
    pub flags: AllocFlags,
}

impl AllocRequest {
    pub fn new(size: u64, range_type: RangeType) -> Self {
        Self {
            size,
            align: PAGE_SIZE,
            min: 0,
            max: 0,
            range_type,
            flags: AllocFlags::empty(),
        }
    }

    pub fn align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    /// Restricts the allocation to `[min, max]` (inclusive upper bound on the last
    /// byte).
    pub fn window(mut self, min: u64, max: u64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Contract shared by both physical allocators.
pub trait PhysMemory: Send {
    /// Allocates a physical range satisfying `req`.
    ///
    /// Returns `None` only when [`AllocFlags::CAN_FAIL`] is set; otherwise exhaustion
    /// is a fatal boot error.
    fn allocate(&mut self, req: AllocRequest) -> Option<PhyAddr>;

    /// Returns a previously allocated range to the free pool.
    fn free(&mut self, addr: PhyAddr, size: u64);

    /// Deep copy of the current memory map.
    fn snapshot(&self) -> MemoryMap;

    /// Produces the final memory map for OS handoff, demoting `Internal` ranges to
    /// `Free`. No further allocation may follow.
    fn finalize(&mut self) -> MemoryMap;
}

fn check_request(req: &AllocRequest) {
    assert!(
        req.size != 0 && is_aligned(req.size, PAGE_SIZE),
        "allocation size {:#x} not a multiple of the page size",
        req.size
    );
    assert!(
        req.align >= PAGE_SIZE && req.align.is_power_of_two(),
        "allocation alignment {:#x} invalid",
        req.align
    );
}

/// Picks an allocation address out of `free` ranges.
///
/// `free` must be sorted by start address; the scan is forward for lowest-address
/// allocation, reverse when [`AllocFlags::HIGH`] is set.
fn scan_free_ranges(
    free: &[MemoryRange],
    req: &AllocRequest,
    min: u64,
    max: u64,
) -> Option<PhyAddr> {
    let fit = |range: &MemoryRange| -> Option<u64> {
        let lo = range.start.as_u64().max(min);
        let hi = range.end().min(max.checked_add(1)?);

        if req.flags.contains(AllocFlags::HIGH) {
            let candidate = align_down(hi.checked_sub(req.size)?, req.align);
            (candidate >= lo).then_some(candidate)
        } else {
            let candidate = align_up(lo, req.align);
            (candidate.checked_add(req.size)? <= hi).then_some(candidate)
        }
    };

    if req.flags.contains(AllocFlags::HIGH) {
        free.iter().rev().find_map(|r| fit(r)).map(PhyAddr::new)
    } else {
        free.iter().find_map(|r| fit(r)).map(PhyAddr::new)
    }
}

/// Allocator owning the machine's memory map.
pub struct SelfManagedAlloc {
    map: MemoryMap,
    phys_min: u64,
    phys_max: u64,
}

impl SelfManagedAlloc {
    /// Creates an empty allocator covering the platform's addressable window
    /// (`phys_max` is the last addressable byte).
    pub fn new(phys_min: u64, phys_max: u64) -> Self {
        Self {
            map: MemoryMap::new(),
            phys_min,
            phys_max,
        }
    }

    /// Seeds the allocator with a range of usable RAM. Called by the platform's memory
    /// probe.
    pub fn add_range(&mut self, start: PhyAddr, size: u64) {
        self.map.insert(start, size, RangeType::Free);
    }

    /// Marks a range as in use by the loader itself (the loader image, firmware-placed
    /// data). Demoted to free in [`PhysMemory::finalize`].
    pub fn mark_internal(&mut self, start: PhyAddr, size: u64) {
        self.map.insert(start, size, RangeType::Internal);
    }

    /// Hides all free subranges of `[start, start + size)` from allocation until
    /// finalization.
    pub fn protect(&mut self, start: PhyAddr, size: u64) {
        let window_start = start.as_u64();
        let window_end = window_start + size;

        let covered: Vec<(u64, u64)> = self
            .map
            .ranges()
            .iter()
            .filter(|r| r.range_type == RangeType::Free)
            .filter_map(|r| {
                let lo = r.start.as_u64().max(window_start);
                let hi = r.end().min(window_end);
                (lo < hi).then_some((lo, hi - lo))
            })
            .collect();

        for (lo, len) in covered {
            self.map.insert(PhyAddr::new(lo), len, RangeType::Internal);
        }
    }
}

impl PhysMemory for SelfManagedAlloc {
    fn allocate(&mut self, req: AllocRequest) -> Option<PhyAddr> {
        check_request(&req);

        let min = if req.min == 0 && req.max == 0 {
            self.phys_min
        } else {
            req.min
        };
        let max = if req.min == 0 && req.max == 0 {
            self.phys_max
        } else {
            req.max
        };

        let free: Vec<MemoryRange> = self
            .map
            .ranges()
            .iter()
            .filter(|r| r.range_type == RangeType::Free)
            .copied()
            .collect();

        match scan_free_ranges(&free, &req, min, max) {
            Some(addr) => {
                self.map.insert(addr, req.size, req.range_type);
                Some(addr)
            }
            None if req.flags.contains(AllocFlags::CAN_FAIL) => None,
            None => {
                boot_error!(
                    "out of physical memory ({:#x} bytes, align {:#x})",
                    req.size,
                    req.align
                );
            }
        }
    }

    fn free(&mut self, addr: PhyAddr, size: u64) {
        self.map.insert(addr, size, RangeType::Free);
    }

    fn snapshot(&self) -> MemoryMap {
        self.map.snapshot()
    }

    fn finalize(&mut self) -> MemoryMap {
        let internal: Vec<MemoryRange> = self
            .map
            .ranges()
            .iter()
            .filter(|r| r.range_type == RangeType::Internal)
            .copied()
            .collect();

        for r in internal {
            self.map.insert(r.start, r.size, RangeType::Free);
        }

        self.map.snapshot()
    }
}

/// Firmware memory services, as exposed by UEFI-style boot environments.
///
/// The firmware owns the authoritative map while these services are available; the
/// loader mirrors its own allocations on the side.
pub trait FirmwareMemoryServices: Send + Sync {
    /// A fresh copy of the firmware's current memory map. Queried on every allocation,
    /// because firmware callbacks may reshape it at any time.
    fn current_map(&self) -> Vec<MemoryRange>;

    /// Allocates exactly `count` pages at `start`.
    fn allocate_pages(&self, start: PhyAddr, count: u64) -> FsResult<()>;

    /// Releases `count` pages at `start` back to the firmware.
    fn free_pages(&self, start: PhyAddr, count: u64) -> FsResult<()>;
}

/// Allocator delegating ownership of RAM to the firmware.
pub struct FirmwareAlloc {
    firmware: &'static dyn FirmwareMemoryServices,
    /// Ranges this loader obtained from the firmware, with the type they were
    /// allocated under.
    side_table: Vec<MemoryRange>,
    phys_min: u64,
    phys_max: u64,
}

impl FirmwareAlloc {
    pub fn new(firmware: &'static dyn FirmwareMemoryServices, phys_min: u64, phys_max: u64) -> Self {
        Self {
            firmware,
            side_table: Vec::new(),
            phys_min,
            phys_max,
        }
    }

    fn overlay(&self, demote_internal: bool) -> MemoryMap {
        let mut map = MemoryMap::new();

        let mut fresh = self.firmware.current_map();
        fresh.sort_unstable_by_key(|r| r.start);
        for r in fresh {
            map.insert(r.start, r.size, r.range_type);
        }

        for r in &self.side_table {
            let range_type = if demote_internal && r.range_type == RangeType::Internal {
                RangeType::Free
            } else {
                r.range_type
            };
            map.insert(r.start, r.size, range_type);
        }

        map
    }
}

impl PhysMemory for FirmwareAlloc {
    fn allocate(&mut self, req: AllocRequest) -> Option<PhyAddr> {
        check_request(&req);

        let min = if req.min == 0 && req.max == 0 {
            self.phys_min
        } else {
            req.min
        };
        let max = if req.min == 0 && req.max == 0 {
            self.phys_max
        } else {
            req.max
        };

        let mut free: Vec<MemoryRange> = self
            .firmware
            .current_map()
            .into_iter()
            .filter(|r| r.range_type == RangeType::Free)
            .collect();
        free.sort_unstable_by_key(|r| r.start);

        // The firmware can refuse a specific range even when its map shows it free
        // (another agent raced us). Shrink the window past the refused candidate and
        // retry.
        let mut window_min = min;
        let mut window_max = max;
        loop {
            let candidate = match scan_free_ranges(&free, &req, window_min, window_max) {
                Some(addr) => addr,
                None if req.flags.contains(AllocFlags::CAN_FAIL) => return None,
                None => {
                    boot_error!(
                        "firmware out of physical memory ({:#x} bytes, align {:#x})",
                        req.size,
                        req.align
                    );
                }
            };

            if self
                .firmware
                .allocate_pages(candidate, req.size / PAGE_SIZE)
                .is_ok()
            {
                self.side_table
                    .push(MemoryRange::new(candidate, req.size, req.range_type));
                return Some(candidate);
            }

            if req.flags.contains(AllocFlags::HIGH) {
                match candidate.as_u64().checked_sub(1) {
                    Some(m) => window_max = m,
                    None if req.flags.contains(AllocFlags::CAN_FAIL) => return None,
                    None => boot_error!("firmware refused every candidate range"),
                }
            } else {
                window_min = candidate.as_u64() + req.size;
            }
        }
    }

    fn free(&mut self, addr: PhyAddr, size: u64) {
        if self.firmware.free_pages(addr, size / PAGE_SIZE).is_err() {
            warn!("mem", "firmware refused to release {addr} + {size:#x}");
        }

        self.side_table
            .retain(|r| !(r.start == addr && r.size == size));
    }

    fn snapshot(&self) -> MemoryMap {
        self.overlay(false)
    }

    fn finalize(&mut self) -> MemoryMap {
        self.overlay(true)
    }
}

static PHYS_MANAGER: OnceCell<Mutex<Box<dyn PhysMemory>>> = OnceCell::uninit();

/// Installs the machine-wide physical allocator. Called once by the platform after its
/// memory probe.
pub fn init_global(allocator: Box<dyn PhysMemory>) {
    PHYS_MANAGER.init_once(|| Mutex::new(allocator));
}

/// Runs `f` against the machine-wide allocator, if one has been installed.
pub fn with_global<R>(f: impl FnOnce(&mut dyn PhysMemory) -> R) -> Option<R> {
    PHYS_MANAGER
        .try_get()
        .ok()
        .map(|m| f(m.lock().as_mut()))
}
