//! File-system related code.
//!
//! Contains the driver-independent filesystem layer: mount probing, handle lifecycle,
//! path resolution and directory iteration. Concrete filesystems (ext2, FAT, ISO9660,
//! boot-image archives) are collaborators implementing [`FilesystemOps`] and register a
//! [`FilesystemDriver`] for mount probing.
//!
//! Most of the utilities are designed to work with a `global_allocator`, to store file
//! metadata and handle payloads.

pub mod decompress;

#[cfg(test)]
pub(crate) mod testfs;

use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{Device, DeviceRegistry};
use crate::errors::{FsResult, Status};

/// Maximum number of symbolic links followed during one path resolution.
pub const SYMLINK_LIMIT: u32 = 8;

bitflags::bitflags! {
    /// Flags for [`open`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Transparently decompress gzip streams: when the opened file starts with the
        /// gzip magic, the returned handle reads the uncompressed content.
        const DECOMPRESS = 1 << 0;
    }
}

/// What a filesystem handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Regular,
    Directory,
    Symlink,
}

/// A mounted filesystem. One mount per device at a time.
pub struct Mount {
    device: Weak<Device>,
    ops: Box<dyn FilesystemOps>,
    /// Entry names on this mount compare ASCII case-insensitively.
    pub case_insensitive: bool,
    pub label: Option<String>,
    pub uuid: Option<String>,
    root: spin::Once<Arc<FsHandle>>,
}

impl Mount {
    /// Creates a mount for `device`. The driver must attach the root handle with
    /// [`Mount::set_root`] before the mount is visible to path resolution.
    pub fn new(
        device: &Arc<Device>,
        ops: Box<dyn FilesystemOps>,
        case_insensitive: bool,
        label: Option<String>,
        uuid: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::downgrade(device),
            ops,
            case_insensitive,
            label,
            uuid,
            root: spin::Once::new(),
        })
    }

    pub fn set_root(&self, root: Arc<FsHandle>) {
        assert!(root.kind == HandleKind::Directory);
        self.root.call_once(|| root);
    }

    pub fn root(&self) -> Arc<FsHandle> {
        self.root.get().expect("mount has no root handle").clone()
    }

    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub fn ops(&self) -> &dyn FilesystemOps {
        self.ops.as_ref()
    }
}

/// Driver-private payload of a handle.
pub(crate) enum HandlePayload {
    /// Driver-owned node data.
    Node(Box<dyn Any + Send + Sync>),
    /// Decompression wrapper around an inner handle.
    Decompress(decompress::DecompressPayload),
}

/// An open filesystem object.
///
/// Handles are reference counted through [`Arc`]: cloning retains, dropping releases,
/// and the driver's `close` hook runs when the last reference goes away. Environments
/// hold handles for their current directory.
pub struct FsHandle {
    mount: Weak<Mount>,
    pub kind: HandleKind,
    pub size: u64,
    pub flags: OpenFlags,
    /// Unique for the whole boot; used for handle identity and decompression-state
    /// ownership.
    id: u64,
    pub(crate) payload: HandlePayload,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl FsHandle {
    /// Creates a driver handle. Called by filesystem implementations from
    /// `open_entry` and mount probing.
    pub fn new(
        mount: &Arc<Mount>,
        kind: HandleKind,
        size: u64,
        node: Box<dyn Any + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount: Arc::downgrade(mount),
            kind,
            size,
            flags: OpenFlags::empty(),
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            payload: HandlePayload::Node(node),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl core::fmt::Debug for FsHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish()
    }
}

impl PartialEq for FsHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl FsHandle {

    pub fn mount(&self) -> Option<Arc<Mount>> {
        self.mount.upgrade()
    }

    /// Downcasts the driver payload.
    pub fn node<T: 'static>(&self) -> Option<&T> {
        match &self.payload {
            HandlePayload::Node(node) => node.downcast_ref(),
            HandlePayload::Decompress(_) => None,
        }
    }
}

impl Drop for FsHandle {
    fn drop(&mut self) {
        if let HandlePayload::Node(_) = self.payload {
            if let Some(mount) = self.mount.upgrade() {
                mount.ops.close(self);
            }
        }
    }
}

/// A transient directory entry passed to iteration callbacks.
pub struct DirEntry {
    pub name: String,
    pub handle: Arc<FsHandle>,
}

/// Operation set implemented by a concrete filesystem.
pub trait FilesystemOps: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Short reads happen only at end of
    /// file.
    fn read(&self, handle: &FsHandle, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    /// Opens the named entry of `dir`. `..` on the root resolves to the root itself.
    fn open_entry(&self, dir: &FsHandle, name: &str, case_insensitive: bool)
        -> FsResult<Arc<FsHandle>>;

    /// Enumerates `dir`, calling `cb` for each entry. The callback returns `false` to
    /// stop the iteration early.
    fn iterate(&self, dir: &FsHandle, cb: &mut dyn FnMut(&DirEntry) -> bool) -> FsResult<()>;

    /// Returns the target of a symbolic link handle.
    fn read_link(&self, _handle: &FsHandle) -> FsResult<String> {
        Err(Status::NotSupported)
    }

    /// Releases driver resources attached to a handle. Runs on last handle drop.
    fn close(&self, _handle: &FsHandle) {}
}

/// A registered filesystem implementation, tried in order during mount probing.
pub trait FilesystemDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspects `device` and, when it carries this filesystem, returns the mount with
    /// its root attached. [`Status::UnknownFs`] falls through to the next driver.
    fn probe(&self, device: &Arc<Device>) -> FsResult<Arc<Mount>>;
}

static DRIVERS: Mutex<Vec<&'static dyn FilesystemDriver>> = Mutex::new(Vec::new());

/// Registers a filesystem driver for mount probing.
pub fn register_driver(driver: &'static dyn FilesystemDriver) {
    DRIVERS.lock().push(driver);
}

/// Walks the registered drivers and mounts the first filesystem recognised on
/// `device`. The mount is retained on the device.
pub fn probe_device(device: &Arc<Device>) -> FsResult<Arc<Mount>> {
    if let Some(existing) = device.mount() {
        return Ok(existing);
    }

    let drivers: Vec<&'static dyn FilesystemDriver> = DRIVERS.lock().clone();
    for driver in drivers {
        match driver.probe(device) {
            Ok(mount) => {
                info!("fs", "{}: mounted {}", device.name(), driver.name());
                device.set_mount(mount.clone());
                return Ok(mount);
            }
            Err(Status::UnknownFs) => continue,
            Err(err) => return Err(err),
        }
    }

    Err(Status::UnknownFs)
}

/// Starting point for path resolution: the caller's device binding and current
/// directory, plus the registry consulted for `(device)` prefixes (`None` uses the
/// global registry).
pub struct OpenContext<'a> {
    pub registry: Option<&'a DeviceRegistry>,
    pub device: Option<Arc<Device>>,
    pub directory: Option<Arc<FsHandle>>,
}

impl OpenContext<'_> {
    pub fn empty() -> Self {
        OpenContext {
            registry: None,
            device: None,
            directory: None,
        }
    }
}

/// Opens `path`, resolving it against `cx`.
///
/// Grammar: an optional `(device-name)` prefix rebinds the starting device; a leading
/// `/` anchors at the mount root, anything else at the context's current directory.
/// `.` and `..` resolve against the accumulated handle and symbolic links are followed
/// up to [`SYMLINK_LIMIT`] times.
///
/// When `kind` is given, a mismatch between it and the resolved handle fails with
/// [`Status::TypeMismatch`]. With [`OpenFlags::DECOMPRESS`], a gzip-compressed file is
/// wrapped in the transparent decompression adapter.
pub fn open(
    cx: &OpenContext,
    path: &str,
    kind: Option<HandleKind>,
    flags: OpenFlags,
) -> FsResult<Arc<FsHandle>> {
    let mut rest = path;

    let device = if let Some(stripped) = rest.strip_prefix('(') {
        let (name, tail) = stripped.split_once(')').ok_or(Status::InvalidArg)?;
        rest = tail;

        match cx.registry {
            Some(registry) => registry.lookup(name),
            None => crate::device::lookup(name),
        }
        .ok_or(Status::NotFound)?
    } else {
        cx.device.clone().ok_or(Status::InvalidArg)?
    };

    let mount = device.mount().ok_or(Status::UnknownFs)?;

    let start = if rest.starts_with('/') {
        mount.root()
    } else if path.starts_with('(') {
        // A device prefix rebinds the starting point; the context directory belongs to
        // the previous device.
        mount.root()
    } else {
        cx.directory.clone().unwrap_or_else(|| mount.root())
    };

    let mut depth = 0;
    let handle = resolve(&mount, start, rest, &mut depth)?;

    match kind {
        Some(HandleKind::Regular) if handle.kind == HandleKind::Directory => {
            return Err(Status::TypeMismatch)
        }
        Some(HandleKind::Directory) if handle.kind == HandleKind::Regular => {
            return Err(Status::TypeMismatch)
        }
        _ => {}
    }

    if flags.contains(OpenFlags::DECOMPRESS)
        && handle.kind == HandleKind::Regular
        && decompress::is_gzip(&handle)?
    {
        return decompress::open_wrapped(&handle);
    }

    Ok(handle)
}

/// Component walk. `depth` counts symbolic links followed across recursion.
fn resolve(
    mount: &Arc<Mount>,
    start: Arc<FsHandle>,
    path: &str,
    depth: &mut u32,
) -> FsResult<Arc<FsHandle>> {
    let mut current = start;

    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." {
            continue;
        }

        if current.kind != HandleKind::Directory {
            return Err(Status::TypeMismatch);
        }

        let mut child = mount
            .ops
            .open_entry(&current, component, mount.case_insensitive)?;

        while child.kind == HandleKind::Symlink {
            *depth += 1;
            if *depth > SYMLINK_LIMIT {
                return Err(Status::SymlinkLimit);
            }

            let target = mount.ops.read_link(&child)?;
            let base = if target.starts_with('/') {
                mount.root()
            } else {
                current.clone()
            };
            child = resolve(mount, base, &target, depth)?;
        }

        current = child;
    }

    Ok(current)
}

/// Reads from a handle at `offset`, dispatching to the decompression adapter for
/// wrapped handles. Returns the number of bytes read; short only at end of file.
pub fn read(handle: &Arc<FsHandle>, buf: &mut [u8], offset: u64) -> FsResult<usize> {
    match &handle.payload {
        HandlePayload::Node(_) => {
            let mount = handle.mount().ok_or(Status::Io)?;
            mount.ops.read(handle, buf, offset)
        }
        HandlePayload::Decompress(payload) => decompress::read(handle, payload, buf, offset),
    }
}

/// Reads a whole file into memory.
pub fn read_whole(handle: &Arc<FsHandle>) -> FsResult<Vec<u8>> {
    if handle.kind != HandleKind::Regular {
        return Err(Status::TypeMismatch);
    }

    let mut data = alloc::vec![0u8; handle.size as usize];
    let got = read(handle, &mut data, 0)?;
    if got != data.len() {
        return Err(Status::EndOfFile);
    }

    Ok(data)
}

/// Enumerates a directory handle.
pub fn iterate(handle: &Arc<FsHandle>, cb: &mut dyn FnMut(&DirEntry) -> bool) -> FsResult<()> {
    if handle.kind != HandleKind::Directory {
        return Err(Status::TypeMismatch);
    }

    let mount = handle.mount().ok_or(Status::Io)?;
    mount.ops.iterate(handle, cb)
}
