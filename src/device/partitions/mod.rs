//! Partition scheme probing.
//!
//! Raw disks are probed against the registered partition schemes in order; the first
//! scheme whose `iterate` succeeds defines the partitions, each of which is registered
//! as a child disk named `<parent>pN` carrying its parent and block offset.

pub mod gpt;
pub mod mbr;

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::{Device, DeviceRegistry, DeviceType, DiskDevice};
use crate::errors::{FsResult, Status};

/// A partition reported by a scheme's `iterate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Scheme-assigned partition number (1-based in device names).
    pub index: u32,
    pub first_block: u64,
    pub block_count: u64,
}

/// A partition table format (MBR, GPT, ...).
pub trait PartitionScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reports every partition on `disk` through `entry`.
    ///
    /// Returns [`Status::UnknownScheme`] when the disk does not carry this format, so
    /// the probe falls through to the next scheme.
    fn iterate(
        &self,
        disk: &DiskDevice,
        entry: &mut dyn FnMut(PartitionEntry),
    ) -> FsResult<()>;
}

/// Probe order. MBR rejects protective tables so GPT disks fall through to the GPT
/// scheme.
pub fn schemes() -> &'static [&'static dyn PartitionScheme] {
    static SCHEMES: [&dyn PartitionScheme; 2] = [&mbr::MbrScheme, &gpt::GptScheme];
    &SCHEMES
}

/// Probes `parent` for partitions and registers each as a child disk device.
///
/// Returns the registered children. A disk without a recognisable table is left as is.
pub fn probe_disk(registry: &mut DeviceRegistry, parent: &Arc<Device>) -> Vec<Arc<Device>> {
    let Some(disk) = parent.as_disk() else {
        return Vec::new();
    };
    if disk.is_partition() {
        return Vec::new();
    }

    let mut found = Vec::new();
    for scheme in schemes() {
        let mut entries = Vec::new();
        match scheme.iterate(disk, &mut |e| entries.push(e)) {
            Ok(()) => {
                info!(
                    "device",
                    "{}: {} partition table, {} partitions",
                    parent.name(),
                    scheme.name(),
                    entries.len()
                );

                for e in entries {
                    let child = DiskDevice::partition(
                        parent,
                        disk.io.clone(),
                        e.first_block,
                        e.block_count,
                    );
                    let name = format!("{}p{}", parent.name(), e.index);
                    found.push(registry.register(&name, DeviceType::Disk(child)));
                }
                break;
            }
            Err(Status::UnknownScheme) => continue,
            Err(err) => {
                warn!("device", "{}: partition probe failed: {err}", parent.name());
                break;
            }
        }
    }

    found
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::BlockIo;

    /// An in-memory block device for partition and filesystem tests.
    pub(crate) struct RamDisk {
        pub blocks: spin::Mutex<Vec<u8>>,
        pub block_size: u32,
    }

    impl RamDisk {
        pub fn new(data: Vec<u8>, block_size: u32) -> Self {
            assert_eq!(data.len() % block_size as usize, 0);
            Self {
                blocks: spin::Mutex::new(data),
                block_size,
            }
        }
    }

    impl BlockIo for RamDisk {
        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            (self.blocks.lock().len() / self.block_size as usize) as u64
        }

        fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> FsResult<()> {
            let data = self.blocks.lock();
            let start = lba as usize * self.block_size as usize;
            if start + buf.len() > data.len() {
                return Err(Status::Io);
            }
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(())
        }
    }

    fn disk_with(data: Vec<u8>) -> DiskDevice {
        DiskDevice::new(Arc::new(RamDisk::new(data, 512)))
    }

    #[test]
    fn blank_disk_matches_no_scheme() {
        let disk = disk_with(alloc::vec![0u8; 512 * 8]);

        for scheme in schemes() {
            assert_eq!(
                scheme.iterate(&disk, &mut |_| {}),
                Err(Status::UnknownScheme),
                "{} matched a blank disk",
                scheme.name()
            );
        }
    }

    #[test]
    fn mbr_disk_registers_children() {
        let mut image = alloc::vec![0u8; 512 * 64];
        // One 16-block partition starting at block 8, type 0x83.
        image[510] = 0x55;
        image[511] = 0xAA;
        let e = 0x1BE;
        image[e + 4] = 0x83;
        image[e + 8..e + 12].copy_from_slice(&8u32.to_le_bytes());
        image[e + 12..e + 16].copy_from_slice(&16u32.to_le_bytes());

        let mut registry = DeviceRegistry::new();
        let parent = registry.register(
            "hd9",
            DeviceType::Disk(disk_with(image)),
        );

        let children = probe_disk(&mut registry, &parent);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "hd9p1");

        let child = children[0].as_disk().unwrap();
        assert_eq!(child.block_count(), 16);

        // Reads through the child are offset by the partition start.
        let mut via_child = [0u8; 512];
        let mut via_parent = [0u8; 512];
        child.read_blocks(0, &mut via_child).unwrap();
        parent
            .as_disk()
            .unwrap()
            .read_blocks(8, &mut via_parent)
            .unwrap();
        assert_eq!(via_child, via_parent);
    }
}
