//! In-memory filesystem used by the test suite.
//!
//! Implements the full [`FilesystemOps`] contract (entries, symlinks, iteration,
//! case-insensitive lookup, close hooks) over a tree built in test code, so path
//! resolution, the configuration commands and the loaders can be exercised without a
//! disk image.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::{Device, DeviceRegistry, DeviceType};
use crate::errors::{FsResult, Status};
use crate::fs::{DirEntry, FilesystemOps, FsHandle, HandleKind, Mount};

/// Declarative tree node used to describe a test filesystem.
#[derive(Clone)]
pub(crate) enum TestTree {
    File(Vec<u8>),
    Dir(Vec<(String, TestTree)>),
    Symlink(String),
}

impl TestTree {
    pub fn file(data: &[u8]) -> Self {
        TestTree::File(data.to_vec())
    }

    pub fn dir(entries: &[(&str, TestTree)]) -> Self {
        TestTree::Dir(
            entries
                .iter()
                .map(|(name, node)| (name.to_string(), node.clone()))
                .collect(),
        )
    }

    pub fn symlink(target: &str) -> Self {
        TestTree::Symlink(target.to_string())
    }
}

struct TNode {
    kind: HandleKind,
    data: Vec<u8>,
    link: String,
    children: Vec<(String, Arc<TNode>)>,
    parent: Mutex<Weak<TNode>>,
    /// Live handle for this node, so repeated opens observe one identity.
    cached: Mutex<Weak<FsHandle>>,
}

fn build(tree: &TestTree) -> Arc<TNode> {
    let node = match tree {
        TestTree::File(data) => Arc::new(TNode {
            kind: HandleKind::Regular,
            data: data.clone(),
            link: String::new(),
            children: Vec::new(),
            parent: Mutex::new(Weak::new()),
            cached: Mutex::new(Weak::new()),
        }),
        TestTree::Symlink(target) => Arc::new(TNode {
            kind: HandleKind::Symlink,
            data: Vec::new(),
            link: target.clone(),
            children: Vec::new(),
            parent: Mutex::new(Weak::new()),
            cached: Mutex::new(Weak::new()),
        }),
        TestTree::Dir(entries) => {
            let children: Vec<(String, Arc<TNode>)> = entries
                .iter()
                .map(|(name, sub)| (name.clone(), build(sub)))
                .collect();

            let dir = Arc::new(TNode {
                kind: HandleKind::Directory,
                data: Vec::new(),
                link: String::new(),
                children,
                parent: Mutex::new(Weak::new()),
                cached: Mutex::new(Weak::new()),
            });

            for (_, child) in &dir.children {
                *child.parent.lock() = Arc::downgrade(&dir);
            }
            dir
        }
    };

    node
}

struct TestFsOps {
    root: Arc<TNode>,
    /// Number of handle `close` hooks that have run on this filesystem.
    closes: Arc<AtomicUsize>,
}

impl TestFsOps {
    fn node_of(handle: &FsHandle) -> FsResult<Arc<TNode>> {
        handle
            .node::<Arc<TNode>>()
            .cloned()
            .ok_or(Status::InvalidArg)
    }

    fn handle_for(mount: &Arc<Mount>, node: &Arc<TNode>) -> Arc<FsHandle> {
        let mut cached = node.cached.lock();
        if let Some(live) = cached.upgrade() {
            return live;
        }

        let handle = FsHandle::new(
            mount,
            node.kind,
            node.data.len() as u64,
            Box::new(node.clone()),
        );
        *cached = Arc::downgrade(&handle);
        handle
    }
}

impl FilesystemOps for TestFsOps {
    fn read(&self, handle: &FsHandle, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let node = Self::node_of(handle)?;
        if node.kind != HandleKind::Regular {
            return Err(Status::TypeMismatch);
        }

        let offset = offset as usize;
        if offset >= node.data.len() {
            return Ok(0);
        }

        let take = buf.len().min(node.data.len() - offset);
        buf[..take].copy_from_slice(&node.data[offset..offset + take]);
        Ok(take)
    }

    fn open_entry(
        &self,
        dir: &FsHandle,
        name: &str,
        case_insensitive: bool,
    ) -> FsResult<Arc<FsHandle>> {
        let mount = dir.mount().ok_or(Status::Io)?;
        let node = Self::node_of(dir)?;

        if name == ".." {
            let parent = node.parent.lock().upgrade().unwrap_or_else(|| self.root.clone());
            return Ok(Self::handle_for(&mount, &parent));
        }

        let child = node
            .children
            .iter()
            .find(|(entry, _)| {
                if case_insensitive {
                    entry.eq_ignore_ascii_case(name)
                } else {
                    entry == name
                }
            })
            .map(|(_, child)| child.clone())
            .ok_or(Status::NotFound)?;

        Ok(Self::handle_for(&mount, &child))
    }

    fn iterate(&self, dir: &FsHandle, cb: &mut dyn FnMut(&DirEntry) -> bool) -> FsResult<()> {
        let mount = dir.mount().ok_or(Status::Io)?;
        let node = Self::node_of(dir)?;
        if node.kind != HandleKind::Directory {
            return Err(Status::TypeMismatch);
        }

        for (name, child) in &node.children {
            let entry = DirEntry {
                name: name.clone(),
                handle: Self::handle_for(&mount, child),
            };
            if !cb(&entry) {
                break;
            }
        }

        Ok(())
    }

    fn read_link(&self, handle: &FsHandle) -> FsResult<String> {
        let node = Self::node_of(handle)?;
        if node.kind != HandleKind::Symlink {
            return Err(Status::InvalidArg);
        }
        Ok(node.link.clone())
    }

    fn close(&self, _handle: &FsHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registers a device named `name` carrying a test filesystem built from `tree`, and
/// mounts it.
pub(crate) fn mount_tree(
    registry: &mut DeviceRegistry,
    name: &str,
    tree: TestTree,
    case_insensitive: bool,
) -> Arc<Device> {
    mount_tree_counted(registry, name, tree, case_insensitive).0
}

/// Like [`mount_tree`], also handing back this filesystem's close-hook counter.
pub(crate) fn mount_tree_counted(
    registry: &mut DeviceRegistry,
    name: &str,
    tree: TestTree,
    case_insensitive: bool,
) -> (Arc<Device>, Arc<AtomicUsize>) {
    let root = build(&tree);
    assert!(root.kind == HandleKind::Directory, "tree root must be a dir");

    let closes = Arc::new(AtomicUsize::new(0));
    let device = registry.register(name, DeviceType::Other);
    let ops = TestFsOps {
        root: root.clone(),
        closes: closes.clone(),
    };

    let mount = Mount::new(
        &device,
        Box::new(ops),
        case_insensitive,
        Some(String::from("testfs")),
        Some(String::from("0000-4242")),
    );
    mount.set_root(FsHandle::new(
        &mount,
        HandleKind::Directory,
        0,
        Box::new(root.clone()),
    ));
    *root.cached.lock() = Arc::downgrade(&mount.root());

    device.set_mount(mount);
    (device, closes)
}
