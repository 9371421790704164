//! `GUID Partition Table` handling.
//!
//! Standard layout for storing partition tables, part of the UEFI standard. The
//! primary header lives on LBA 1 behind a protective MBR; a backup header sits on the
//! last block of the disk.

use bytemuck::{Pod, Zeroable};

use crate::device::partitions::{PartitionEntry, PartitionScheme};
use crate::device::DiskDevice;
use crate::errors::{FsResult, Status};

/// `GUID Partition Table Header`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptHeader {
    /// Identifies an EFI-compatible partition table header.
    /// Should contain the string "EFI PART".
    sig: [u8; 8],

    /// Revision number for this header.
    revision: u32,

    /// Size of the header in bytes.
    size: u32,

    /// CRC32 checksum for the header.
    checksum: u32,
    reserved: u32,

    /// The LBA that contains this structure.
    my_lba: u64,

    /// The LBA of the alternate `GPT` header.
    alternate_lba: u64,

    /// First logical block that may be used by a partition.
    first_usable_lba: u64,

    /// Last logical block that may be used by a partition.
    last_usable_lba: u64,

    /// GUID of the disk.
    disk_guid: [u8; 16],

    /// First LBA of the partition entry array.
    part_entry_lba: u64,

    /// Number of entries in the partition entry array.
    partitions_count: u32,

    /// Size in bytes of one partition entry.
    part_entry_size: u32,

    /// CRC32 of the partition entry array.
    part_entry_array_crc32: u32,
}

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

impl GptHeader {
    fn is_valid(&self) -> bool {
        if self.sig != *GPT_SIGNATURE {
            return false;
        }

        let size = u32::from_le(self.size);
        if !(92..=512).contains(&size) {
            return false;
        }

        // The checksum field is zeroed for the computation.
        let mut bytes = [0u8; 512];
        bytes[..core::mem::size_of::<Self>()].copy_from_slice(bytemuck::bytes_of(self));
        bytes[16..20].fill(0);

        crc32(&bytes[..size as usize]) == u32::from_le(self.checksum)
    }
}

/// A `GUID Partition Table` partition entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GptPartitionEntry {
    /// Partition type GUID; all-zero marks an unused entry.
    type_guid: [u8; 16],

    /// Unique GUID of this partition.
    part_guid: [u8; 16],

    /// First LBA of the partition.
    start_lba: u64,

    /// Last LBA of the partition (inclusive).
    last_lba: u64,

    /// Partition attribute flags.
    attributes: u64,

    /// Partition name, UTF-16LE.
    name: [u16; 36],
}

impl GptPartitionEntry {
    pub fn is_used(&self) -> bool {
        self.type_guid != [0u8; 16]
    }

    pub fn start_lba(&self) -> u64 {
        u64::from_le(self.start_lba)
    }

    pub fn block_count(&self) -> u64 {
        u64::from_le(self.last_lba) - u64::from_le(self.start_lba) + 1
    }
}

/// The GPT [`PartitionScheme`].
pub struct GptScheme;

impl PartitionScheme for GptScheme {
    fn name(&self) -> &'static str {
        "gpt"
    }

    fn iterate(
        &self,
        disk: &DiskDevice,
        entry: &mut dyn FnMut(PartitionEntry),
    ) -> FsResult<()> {
        let bs = u64::from(disk.block_size());

        let mut header_block = alloc::vec![0u8; disk.block_size() as usize];
        disk.read_bytes(bs, &mut header_block)?;
        let mut header: GptHeader =
            *bytemuck::from_bytes(&header_block[..core::mem::size_of::<GptHeader>()]);

        if header.sig != *GPT_SIGNATURE {
            return Err(Status::UnknownScheme);
        }

        // Fall back to the backup header when the primary is damaged.
        if !header.is_valid() {
            warn!("gpt", "invalid primary gpt header, trying backup");
            disk.read_bytes((disk.block_count() - 1) * bs, &mut header_block)?;
            header = *bytemuck::from_bytes(&header_block[..core::mem::size_of::<GptHeader>()]);

            if !header.is_valid() {
                error!("gpt", "primary and backup gpt headers corrupted, aborting");
                return Err(Status::CorruptFs);
            }
        }

        let count = u32::from_le(header.partitions_count);
        let entry_size = u32::from_le(header.part_entry_size) as usize;
        if entry_size < core::mem::size_of::<GptPartitionEntry>() || count > 4096 {
            return Err(Status::CorruptFs);
        }

        let mut array = alloc::vec![0u8; entry_size * count as usize];
        disk.read_bytes(u64::from_le(header.part_entry_lba) * bs, &mut array)?;

        if crc32(&array) != u32::from_le(header.part_entry_array_crc32) {
            error!("gpt", "partition entry array checksum mismatch");
            return Err(Status::CorruptFs);
        }

        let mut index = 0u32;
        for i in 0..count as usize {
            let part: &GptPartitionEntry = bytemuck::from_bytes(
                &array[i * entry_size..i * entry_size + core::mem::size_of::<GptPartitionEntry>()],
            );

            index += 1;
            if !part.is_used() {
                continue;
            }

            if part.start_lba() + part.block_count() > disk.block_count() {
                return Err(Status::CorruptFs);
            }

            entry(PartitionEntry {
                index,
                first_block: part.start_lba(),
                block_count: part.block_count(),
            });
        }

        Ok(())
    }
}

/// Bitwise CRC32 (IEEE 802.3 polynomial, reflected), as used by the GPT checksums.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;

    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }

    !crc
}
