//! MBR (_Master Boot Record_) partition table handling.
//!
//! Legacy structure used to store partition information on hard drives, stored on the
//! first logical block of the drive. Limits the number of partitions to 4 (extended
//! partition chains are not followed by the loader).

use bytemuck::{Pod, Zeroable};

use crate::device::partitions::{PartitionEntry, PartitionScheme};
use crate::device::DiskDevice;
use crate::errors::{FsResult, Status};

/// Offset of the partition table in the `Master Boot Record`.
const MBR_PART_OFFSET: usize = 0x1BE;

/// Offset of the boot signature.
const MBR_SIG_OFFSET: usize = 0x1FE;

/// Partition type byte of a protective GPT entry.
const PART_TYPE_PROTECTIVE: u8 = 0xEE;

/// A `Master Boot Record` partition entry.
///
/// All related methods use _LBA_ instead of the legacy _CHS_ addressing; the CHS
/// fields are carried only for layout fidelity.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MbrPartitionEntry {
    attributes: u8,
    chs_start: [u8; 3],
    part_type: u8,
    chs_last: [u8; 3],
    lba_start: u32,
    sectors_count: u32,
}

impl MbrPartitionEntry {
    /// Checks if this partition is _active_ (or bootable).
    pub fn is_active(&self) -> bool {
        (0x80..0x8F).contains(&self.attributes)
    }

    /// Checks if this partition entry is used (valid).
    pub fn is_used(&self) -> bool {
        self.part_type != 0
    }

    pub fn part_type(&self) -> u8 {
        self.part_type
    }

    pub fn start_lba(&self) -> u64 {
        u64::from(u32::from_le(self.lba_start))
    }

    pub fn sectors(&self) -> u64 {
        u64::from(u32::from_le(self.sectors_count))
    }
}

/// The MBR [`PartitionScheme`].
pub struct MbrScheme;

impl PartitionScheme for MbrScheme {
    fn name(&self) -> &'static str {
        "mbr"
    }

    fn iterate(
        &self,
        disk: &DiskDevice,
        entry: &mut dyn FnMut(PartitionEntry),
    ) -> FsResult<()> {
        let mut sector = [0u8; 512];
        disk.read_bytes(0, &mut sector)?;

        if sector[MBR_SIG_OFFSET..MBR_SIG_OFFSET + 2] != [0x55, 0xAA] {
            return Err(Status::UnknownScheme);
        }

        let entries: &[MbrPartitionEntry; 4] =
            bytemuck::from_bytes(&sector[MBR_PART_OFFSET..MBR_PART_OFFSET + 64]);

        // A protective MBR belongs to the GPT scheme further down the probe order.
        if entries.iter().any(|e| e.part_type() == PART_TYPE_PROTECTIVE) {
            return Err(Status::UnknownScheme);
        }

        let used: alloc::vec::Vec<&MbrPartitionEntry> =
            entries.iter().filter(|e| e.is_used()).collect();
        if used.is_empty() {
            return Err(Status::UnknownScheme);
        }

        for (i, e) in used.iter().enumerate() {
            if e.start_lba() + e.sectors() > disk.block_count() {
                return Err(Status::CorruptFs);
            }

            entry(PartitionEntry {
                index: i as u32 + 1,
                first_block: e.start_lba(),
                block_count: e.sectors(),
            });
        }

        Ok(())
    }
}
