/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! The global context and the layer registry.
//!
//! The registry is a fixed table of layer slots; slot `0` always holds the
//! global layer. The registry mutex guards the table, the high-water mark
//! and every persistent sibling/child pointer fix-up, so topology edits are
//! totally ordered.

use crate::INVALID_INODE;
use crate::MAX_LAYERS;
use crate::alloc;
use crate::alloc::BlockAllocator;
use crate::device::Device;
use crate::fs_handle;
use crate::global_root;
use crate::inode::Inode;
use crate::inode::root_init;
use crate::layer::Layer;
use crate::layer::LockedLayer;
use crate::page::PageCache;
use crate::superblock::SUPER_DIRTY;
use crate::superblock::SUPER_RDWR;
use crate::superblock::SuperBlock;
use log::error;
use std::io;
use std::io::Error;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The layer table, guarded by the registry mutex.
#[derive(Debug)]
pub(crate) struct Registry {
    /// Layer handles by slot index; empty slots are `None`.
    pub(crate) layers: Vec<Option<Arc<Layer>>>,
    /// Root inode number of the layer in the matching slot.
    pub(crate) roots: Vec<u64>,
    /// Largest slot index ever occupied.
    pub(crate) high_water: usize,
}

/// Process-wide state of one mounted device.
#[derive(Debug)]
pub struct Gfs {
    /// The underlying device.
    dev: Device,
    /// The layer registry.
    pub(crate) registry: Mutex<Registry>,
    /// Number of live layer objects.
    count: AtomicU64,
    /// Number of resident pages across all layers.
    pcount: AtomicU64,
    /// Inode number of the snapshot root directory, or [`INVALID_INODE`].
    snap_root: AtomicU64,
    /// Pinned inode handle of the snapshot root directory.
    snap_root_inode: Mutex<Option<Arc<Inode>>>,
    /// The block allocator, behind its own mutex.
    pub(crate) alloc: Mutex<BlockAllocator>,
}

impl Gfs {
    /// Allocates the global context around an open device.
    pub(crate) fn new(dev: Device) -> Arc<Self> {
        Arc::new(Self {
            dev,
            registry: Mutex::new(Registry {
                layers: vec![None; MAX_LAYERS],
                roots: vec![0; MAX_LAYERS],
                high_water: 0,
            }),
            count: AtomicU64::new(0),
            pcount: AtomicU64::new(0),
            snap_root: AtomicU64::new(INVALID_INODE),
            snap_root_inode: Mutex::new(None),
            alloc: Mutex::new(BlockAllocator::new()),
        })
    }

    pub fn device(&self) -> &Device {
        &self.dev
    }

    /// Returns the global layer (slot `0`).
    pub fn global(&self) -> Arc<Layer> {
        self.registry.lock().unwrap().layers[0]
            .clone()
            .expect("global layer missing")
    }

    /// Returns the layer in slot `index`, if present.
    pub fn layer_at(&self, index: usize) -> Option<Arc<Layer>> {
        self.registry.lock().unwrap().layers.get(index)?.clone()
    }

    /// Returns the root inode number recorded for slot `index`.
    pub fn root_at(&self, index: usize) -> u64 {
        self.registry.lock().unwrap().roots[index]
    }

    /// Largest slot index ever occupied.
    pub fn high_water(&self) -> usize {
        self.registry.lock().unwrap().high_water
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn count_add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn count_sub(&self, n: u64) {
        self.count.fetch_sub(n, Ordering::AcqRel);
    }

    pub fn pcount(&self) -> u64 {
        self.pcount.load(Ordering::Acquire)
    }

    pub(crate) fn pcount_add(&self, n: u64) {
        self.pcount.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn pcount_sub(&self, n: u64) {
        self.pcount.fetch_sub(n, Ordering::AcqRel);
    }

    /// Inode number of the snapshot root directory, or [`INVALID_INODE`].
    pub fn snap_root(&self) -> u64 {
        self.snap_root.load(Ordering::Acquire)
    }

    /// Records the snapshot root directory and pins its inode.
    pub fn set_snap_root(&self, ino: u64, inode: Option<Arc<Inode>>) {
        *self.snap_root_inode.lock().unwrap() = inode;
        self.snap_root.store(ino, Ordering::Release);
    }

    /// Installs the global layer in slot `0` at mount time.
    pub(crate) fn install_global(&self, layer: &Arc<Layer>) {
        let mut registry = self.registry.lock().unwrap();
        debug_assert!(registry.layers[0].is_none());
        layer.set_gindex(0);
        registry.layers[0] = Some(layer.clone());
        registry.roots[0] = layer.root();
    }

    /// Clears slot `index` and drops the registry's handle on its layer.
    pub(crate) fn clear_slot(&self, index: usize) {
        let mut registry = self.registry.lock().unwrap();
        registry.layers[index] = None;
        registry.roots[index] = 0;
    }

    /// Places a recovered layer in the slot persisted in its superblock.
    pub(crate) fn install_recovered(&self, layer: &Arc<Layer>) {
        let index = { layer.sb().sb_index } as usize;
        assert!(index < MAX_LAYERS);
        let mut registry = self.registry.lock().unwrap();
        assert!(registry.layers[index].is_none());
        registry.layers[index] = Some(layer.clone());
        registry.roots[index] = layer.root();
        if index > registry.high_water {
            registry.high_water = index;
        }
        layer.set_gindex(index as i64);
    }

    /// Adds a layer to the registry and splices it into the layer graph.
    ///
    /// With a sibling anchor, the layer becomes the anchor's next snapshot;
    /// with a parent, the layer becomes the parent's first child. The slot
    /// assignment, the superblock block allocation and the persistent
    /// pointer fix-ups all happen under the registry mutex.
    pub fn add_layer(
        &self,
        layer: &Arc<Layer>,
        parent: Option<&Arc<Layer>>,
        snap: Option<&Arc<Layer>>,
    ) -> io::Result<()> {
        let mut registry = self.registry.lock().unwrap();
        // Find a free slot and insert the new layer
        let Some(index) = (1..MAX_LAYERS).find(|i| registry.layers[*i].is_none()) else {
            error!("no free layer slot");
            return Err(Error::from_raw_os_error(libc::ENOSPC));
        };
        layer.set_gindex(index as i64);
        layer.sb().sb_index = index as u32;
        registry.layers[index] = Some(layer.clone());
        registry.roots[index] = layer.root();
        if index > registry.high_water {
            registry.high_water = index;
        }
        let sblock = match alloc::alloc_blocks(self, layer, 1, true) {
            Ok(sblock) => sblock,
            Err(e) => {
                registry.layers[index] = None;
                registry.roots[index] = 0;
                layer.set_gindex(-1);
                return Err(e);
            }
        };
        layer.set_sblock(sblock);

        // Splice into the snapshot chain or under the parent
        if let Some(anchor) = snap {
            layer.set_next(anchor.next());
            anchor.set_next(Some(layer.clone()));
            let mut anchor_sb = anchor.sb();
            layer.sb().sb_next_snap = anchor_sb.sb_next_snap;
            anchor_sb.sb_next_snap = sblock;
            anchor_sb.sb_flags |= SUPER_DIRTY;
        } else if let Some(parent) = parent {
            debug_assert!(parent.snap().is_none());
            parent.set_snap(Some(layer.clone()));
            layer.set_parent(Arc::downgrade(parent));
            let mut parent_sb = parent.sb();
            parent_sb.sb_child_snap = sblock;
            parent_sb.sb_flags |= SUPER_DIRTY;
        }
        Ok(())
    }

    /// Removes a detached layer from the registry.
    ///
    /// The layer must have no children and must not be the global layer.
    pub(crate) fn remove_fs(&self, layer: &Layer) {
        debug_assert!(layer.snap().is_none());
        let gindex = layer.gindex();
        debug_assert!(gindex > 0 && (gindex as usize) < MAX_LAYERS);
        let gindex = gindex as usize;
        let mut registry = self.registry.lock().unwrap();
        debug_assert!(registry.layers[gindex].is_some());
        registry.layers[gindex] = None;
        registry.roots[gindex] = 0;
        if registry.high_water == gindex {
            debug_assert!(registry.high_water > 0);
            registry.high_water -= 1;
        }
        drop(registry);
        layer.set_gindex(-1);
    }

    /// Unsplices a layer from the snapshot graph, fixing up the persistent
    /// pointers of its predecessor.
    pub(crate) fn remove_snap(&self, layer: &Arc<Layer>) {
        debug_assert!(layer.snap().is_none());
        let registry = self.registry.lock().unwrap();
        let global = registry.layers[0].clone().expect("global layer missing");
        let parent = layer.parent();
        let direct_child = parent
            .as_ref()
            .and_then(|p| p.snap())
            .is_some_and(|c| Arc::ptr_eq(&c, layer));
        if let Some(parent) = parent.filter(|_| direct_child) {
            // Parent points to this layer
            parent.set_snap(layer.next());
            let mut parent_sb = parent.sb();
            parent_sb.sb_child_snap = { layer.sb().sb_next_snap };
            parent_sb.sb_flags |= SUPER_DIRTY;
        } else {
            // Remove from the common parent list
            let mut node = match layer.parent() {
                Some(parent) => parent.snap(),
                None => Some(global),
            };
            while let Some(n) = node {
                let next = n.next();
                if next.as_ref().is_some_and(|x| Arc::ptr_eq(x, layer)) {
                    n.set_next(layer.next());
                    let mut node_sb = n.sb();
                    node_sb.sb_next_snap = { layer.sb().sb_next_snap };
                    node_sb.sb_flags |= SUPER_DIRTY;
                    break;
                }
                node = next;
            }
        }
        // The parent edge stays: destroy uses it to tell cache owners from
        // layers that only alias the family caches
        layer.set_next(None);
    }

    /// Returns the layer owning the inode handle `ino`, locked in the
    /// requested mode. The caller releases it by dropping the guard.
    pub fn get_layer(&self, ino: u64, exclusive: bool) -> LockedLayer {
        let gindex = fs_handle(ino);
        assert!(gindex < MAX_LAYERS);
        let layer = self.layer_at(gindex).expect("layer slot empty");
        layer.lock(exclusive);
        debug_assert_eq!(layer.gindex(), gindex as i64);
        debug_assert_eq!(self.root_at(gindex), layer.root());
        LockedLayer::new(layer)
    }

    /// Checks whether `ino` is the root of another layer and returns that
    /// layer's slot, falling back to the current layer's slot.
    ///
    /// The crossing only happens from the global layer, for entries of the
    /// snapshot root directory. This is the single place where a lookup
    /// implicitly changes namespace.
    pub fn get_index(&self, layer: &Layer, parent: u64, ino: u64) -> usize {
        let gindex = layer.gindex();
        debug_assert!(gindex >= 0);
        let snap_root = self.snap_root();
        if gindex == 0 && snap_root != INVALID_INODE && parent == snap_root {
            let root = crate::inode_handle(ino);
            debug_assert!(global_root(ino));
            let registry = self.registry.lock().unwrap();
            for i in 1..=registry.high_water {
                if registry.roots[i] == root {
                    return i;
                }
            }
        }
        gindex as usize
    }

    /// Creates a layer and splices it into the graph.
    ///
    /// Exactly one of `parent` and `snap` must be given: a parent makes the
    /// new layer the parent's first child; a sibling anchor splices the new
    /// layer into the anchor's snapshot chain. The new layer's root
    /// directory is created under the inode number `root`.
    pub fn create_layer(
        &self,
        parent: Option<&Arc<Layer>>,
        snap: Option<&Arc<Layer>>,
        root: u64,
        rw: bool,
    ) -> io::Result<Arc<Layer>> {
        let (pcache, ilock, family_parent) = match (parent, snap) {
            (None, Some(anchor)) => match anchor.parent() {
                // Sibling on an existing chain shares the family caches
                Some(family) => (
                    anchor.pcache().clone(),
                    anchor.ilock().clone(),
                    Some(family),
                ),
                // Sibling of a base (or the global) layer starts a family
                None => (PageCache::new(), Arc::new(Mutex::new(root + 1)), None),
            },
            (Some(parent), None) => {
                if parent.snap().is_some() {
                    return Err(Error::from_raw_os_error(libc::EBUSY));
                }
                (parent.pcache().clone(), parent.ilock().clone(), None)
            }
            _ => return Err(Error::from_raw_os_error(libc::EINVAL)),
        };
        let layer = Layer::new(self, rw, pcache, ilock);
        layer.set_root(root);
        {
            let tblocks = { self.global().sb().sb_tblocks };
            let mut sb = layer.sb();
            *sb = SuperBlock::init(0, false);
            sb.sb_tblocks = tblocks;
            sb.sb_root = root;
            sb.sb_flags = SUPER_DIRTY | if rw { SUPER_RDWR } else { 0 };
        }
        if let Some(family) = family_parent {
            layer.set_parent(Arc::downgrade(&family));
        }
        root_init(self, &layer, root);
        if let Err(e) = self.add_layer(&layer, parent, snap) {
            layer.destroy(self, true);
            return Err(e);
        }
        Ok(layer)
    }

    /// Deletes a layer: detaches it from the graph and the registry, frees
    /// its blocks and destroys it.
    ///
    /// Fails with `EBUSY` while the layer has children; callers remove
    /// bottom-up.
    pub fn remove_layer(&self, layer: &Arc<Layer>) -> io::Result<()> {
        if layer.snap().is_some() {
            return Err(Error::from_raw_os_error(libc::EBUSY));
        }
        let gindex = layer.gindex();
        if gindex <= 0 || gindex as usize >= MAX_LAYERS {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        layer.lock(true);
        layer.set_removed();
        self.remove_snap(layer);
        self.remove_fs(layer);
        alloc::free_layer_blocks(self, layer, true);
        layer.unlock();
        layer.destroy(self, true);
        Ok(())
    }
}
