//! Device registry.
//!
//! Every bootable resource (raw disks, partitions, network interfaces, pre-loaded boot
//! images) is registered here under a globally unique name (`hd0`, `hd0p1`, `cd0`,
//! `net0`, `image0`). Devices are registered during platform bring-up and live until
//! shutdown; there is no dynamic removal.

pub mod partitions;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::errors::{FsResult, Status};
use crate::fs::Mount;

/// Block-granular read access to a storage device, implemented by platform drivers
/// (AHCI, BIOS disk services, UEFI block I/O, ...).
pub trait BlockIo: Send + Sync {
    /// Size in bytes of one logical block.
    fn block_size(&self) -> u32;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Reads whole blocks starting at `lba`. `buf` length must be a block multiple.
    fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> FsResult<()>;
}

/// A disk-class device: either a raw disk backed by a [`BlockIo`] driver, or a
/// partition carrying its parent and block offset.
pub struct DiskDevice {
    io: Arc<dyn BlockIo>,
    block_size: u32,
    block_count: u64,
    /// `(parent, first block)` when this disk is a partition.
    parent: Option<(Weak<Device>, u64)>,
}

impl DiskDevice {
    pub fn new(io: Arc<dyn BlockIo>) -> Self {
        let block_size = io.block_size();
        let block_count = io.block_count();

        Self {
            io,
            block_size,
            block_count,
            parent: None,
        }
    }

    fn partition(parent: &Arc<Device>, io: Arc<dyn BlockIo>, first_block: u64, count: u64) -> Self {
        let block_size = io.block_size();

        Self {
            io,
            block_size,
            block_count: count,
            parent: Some((Arc::downgrade(parent), first_block)),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn is_partition(&self) -> bool {
        self.parent.is_some()
    }

    /// Reads whole blocks, translating partition-relative addresses.
    pub fn read_blocks(&self, lba: u64, buf: &mut [u8]) -> FsResult<()> {
        let offset = self.parent.as_ref().map_or(0, |(_, off)| *off);

        if lba + (buf.len() as u64).div_ceil(u64::from(self.block_size)) > self.block_count {
            return Err(Status::InvalidArg);
        }

        self.io.read_blocks(lba + offset, buf)
    }

    /// Reads an arbitrary `(offset, len)` byte window through a bounce buffer for the
    /// unaligned head and tail.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let bs = u64::from(self.block_size);
        let mut pos = 0usize;
        let mut lba = offset / bs;
        let mut skip = (offset % bs) as usize;

        let mut block = alloc::vec![0u8; self.block_size as usize];
        while pos < buf.len() {
            self.read_blocks(lba, &mut block)?;

            let take = (buf.len() - pos).min(block.len() - skip);
            buf[pos..pos + take].copy_from_slice(&block[skip..skip + take]);

            pos += take;
            lba += 1;
            skip = 0;
        }

        Ok(())
    }
}

/// A network-class device. The core only needs its identity; packet I/O belongs to the
/// platform's network loaders.
pub struct NetDevice {
    pub hw_addr: [u8; 6],
}

/// Typed capability set of a registered device.
pub enum DeviceType {
    Disk(DiskDevice),
    Network(NetDevice),
    Other,
}

/// A registered device.
pub struct Device {
    name: String,
    dev: DeviceType,
    /// The filesystem mounted on this device, if any. One mount per device.
    mount: Mutex<Option<Arc<Mount>>>,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.dev
    }

    pub fn as_disk(&self) -> Option<&DiskDevice> {
        match &self.dev {
            DeviceType::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn mount(&self) -> Option<Arc<Mount>> {
        self.mount.lock().clone()
    }

    pub(crate) fn set_mount(&self, mount: Arc<Mount>) {
        let mut slot = self.mount.lock();
        assert!(slot.is_none(), "device {} already mounted", self.name);
        *slot = Some(mount);
    }
}

/// Name → device table.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Arc<Device>>,
    /// Registration order, for stable enumeration.
    order: Vec<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dev` under `name`. Names must be unique for the whole boot.
    pub fn register(&mut self, name: &str, dev: DeviceType) -> Arc<Device> {
        assert!(
            !self.devices.contains_key(name),
            "duplicate device name {name}"
        );

        let device = Arc::new(Device {
            name: String::from(name),
            dev,
            mount: Mutex::new(None),
        });

        self.devices.insert(String::from(name), device.clone());
        self.order.push(String::from(name));
        info!("device", "registered {name}");

        device
    }

    /// Counts registered devices whose name starts with `prefix`, for `hdN`-style
    /// sequential naming.
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.order
            .iter()
            .filter(|n| {
                n.strip_prefix(prefix)
                    .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
            })
            .count()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.order.iter().filter_map(|n| self.devices.get(n))
    }
}

lazy_static::lazy_static! {
    static ref DEVICES: Mutex<DeviceRegistry> = Mutex::new(DeviceRegistry::new());
}

/// Registers a device in the global registry.
pub fn register(name: &str, dev: DeviceType) -> Arc<Device> {
    DEVICES.lock().register(name, dev)
}

/// Looks a device up by name in the global registry.
pub fn lookup(name: &str) -> Option<Arc<Device>> {
    DEVICES.lock().lookup(name)
}

/// Runs `f` over every registered device, in registration order.
pub fn for_each(mut f: impl FnMut(&Arc<Device>)) {
    for dev in DEVICES.lock().iter() {
        f(dev);
    }
}

/// Runs `f` with the global registry borrowed mutably (partition probing, platform
/// bring-up).
pub fn with_registry<R>(f: impl FnOnce(&mut DeviceRegistry) -> R) -> R {
    f(&mut DEVICES.lock())
}
