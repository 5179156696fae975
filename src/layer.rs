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

//! A layer is one filesystem namespace.
//!
//! Layers are tracked in the registry (see [`gfs`](crate::gfs)), linked into
//! the persistent parent/child/sibling forest and torn down in child-first
//! order. Each layer batches its dirty inode index pages in the inode-block
//! pipeline, which turns them into clustered contiguous writes.

use crate::BLOCK_SIZE;
use crate::CLUSTER_SIZE;
use crate::INVALID_BLOCK;
use crate::device::AlignedBuf;
use crate::gfs::Gfs;
use crate::inode;
use crate::inode::InodeCache;
use crate::page::Page;
use crate::page::PageCache;
use crate::rwlock::RwLock;
use crate::stats::Stats;
use crate::superblock::SUPER_DIRTY;
use crate::superblock::SuperBlock;
use crate::superblock::timestamp;
use log::debug;
use std::io;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Number of inode page addresses held by one inode index block.
pub const IBLOCK_MAX: usize = (BLOCK_SIZE - 8) / 8;

/// In-progress state of the inode-block pipeline, guarded by the layer's
/// pipeline mutex.
#[derive(Debug)]
struct Pipeline {
    /// The index block currently being filled, if any.
    inode_blocks: Option<AlignedBuf>,
    /// Entry cursor within `inode_blocks`.
    inode_index: usize,
    /// Number of index pages in the pending cluster, including the one
    /// being filled.
    inode_block_count: u64,
    /// Index pages wrapped and waiting for the next flush, oldest first.
    inode_block_pages: Vec<Arc<Page>>,
}

/// Per-layer allocator bookkeeping, guarded by the layer's allocator mutex.
#[derive(Debug)]
struct LayerAlloc {
    /// Number of blocks allocated over the layer's lifetime.
    blocks: u64,
    /// Blocks allocated for metadata (superblock, inode index clusters).
    meta_blocks: u64,
    /// Number of blocks freed back.
    freed: u64,
    /// Extents allocated to this layer, returned to the free list when the
    /// layer is removed.
    extents: Vec<(u64, u64)>,
}

/// A filesystem layer.
#[derive(Debug)]
pub struct Layer {
    /// The layer's slot in the registry; `-1` when detached.
    gindex: AtomicI64,
    /// Device block address of the layer's superblock.
    sblock: AtomicU64,
    /// Inode number of the layer's root directory.
    root: AtomicU64,
    /// Tells whether the layer is immutable.
    read_only: bool,
    /// Tells whether the layer has been detached and must be skipped.
    removed: AtomicBool,
    /// Layer creation time.
    ctime: u64,
    /// Last access time.
    atime: AtomicU64,
    /// The layer's decoded superblock.
    sb: Mutex<SuperBlock>,
    /// The parent layer, if any.
    parent: Mutex<Weak<Layer>>,
    /// The first child layer, if any.
    snap: Mutex<Option<Arc<Layer>>>,
    /// The next sibling layer sharing the same parent, if any.
    next: Mutex<Option<Arc<Layer>>>,
    /// The family's page cache. Owned by the eldest layer; descendants
    /// alias it.
    pcache: Arc<PageCache>,
    /// The family's inode number allocator. Same ownership as `pcache`.
    ilock: Arc<Mutex<u64>>,
    /// The layer's inode cache.
    icache: InodeCache,
    /// Serializes external requests (shared) against snapshot operations
    /// (exclusive).
    rwlock: RwLock,
    /// The inode-block pipeline.
    pipeline: Mutex<Pipeline>,
    /// Allocator bookkeeping.
    alloc: Mutex<LayerAlloc>,
    /// Operation counters.
    stats: Mutex<Stats>,
    /// Number of inodes resident in the cache.
    icount: AtomicU64,
    /// Number of pages this layer holds in the family page cache.
    pcount: AtomicU64,
}

impl Layer {
    /// Allocates a new layer sharing the given family page cache and inode
    /// lock.
    pub fn new(gfs: &Gfs, rw: bool, pcache: Arc<PageCache>, ilock: Arc<Mutex<u64>>) -> Arc<Self> {
        let now = timestamp();
        gfs.count_add(1);
        Arc::new(Self {
            gindex: AtomicI64::new(-1),
            sblock: AtomicU64::new(INVALID_BLOCK),
            root: AtomicU64::new(0),
            read_only: !rw,
            removed: AtomicBool::new(false),
            ctime: now,
            atime: AtomicU64::new(now),
            sb: Mutex::new(SuperBlock::init(0, false)),
            parent: Mutex::new(Weak::new()),
            snap: Mutex::new(None),
            next: Mutex::new(None),
            pcache,
            ilock,
            icache: InodeCache::new(),
            rwlock: RwLock::new(),
            pipeline: Mutex::new(Pipeline {
                inode_blocks: None,
                inode_index: 0,
                inode_block_count: 0,
                inode_block_pages: Vec::new(),
            }),
            alloc: Mutex::new(LayerAlloc {
                blocks: 0,
                meta_blocks: 0,
                freed: 0,
                extents: Vec::new(),
            }),
            stats: Mutex::new(Stats::new()),
            icount: AtomicU64::new(0),
            pcount: AtomicU64::new(0),
        })
    }

    /// Locks the layer: shared while serving a request, exclusive while
    /// taking or deleting snapshots.
    pub fn lock(&self, exclusive: bool) {
        if exclusive {
            self.rwlock.write_lock();
        } else {
            self.rwlock.read_lock();
        }
    }

    /// Unlocks the layer.
    pub fn unlock(&self) {
        self.rwlock.unlock();
    }

    pub fn gindex(&self) -> i64 {
        self.gindex.load(Ordering::Acquire)
    }

    pub(crate) fn set_gindex(&self, gindex: i64) {
        self.gindex.store(gindex, Ordering::Release);
    }

    pub fn sblock(&self) -> u64 {
        self.sblock.load(Ordering::Acquire)
    }

    pub(crate) fn set_sblock(&self, block: u64) {
        self.sblock.store(block, Ordering::Release);
    }

    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, root: u64) {
        self.root.store(root, Ordering::Release);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn ctime(&self) -> u64 {
        self.ctime
    }

    pub fn touch(&self) {
        self.atime.store(timestamp(), Ordering::Release);
    }

    /// Locks and returns the layer's superblock.
    pub fn sb(&self) -> MutexGuard<'_, SuperBlock> {
        self.sb.lock().unwrap()
    }

    /// Marks the layer's superblock dirty.
    pub fn mark_dirty(&self) {
        self.sb().sb_flags |= SUPER_DIRTY;
    }

    pub fn parent(&self) -> Option<Arc<Layer>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Layer>) {
        *self.parent.lock().unwrap() = parent;
    }

    pub fn snap(&self) -> Option<Arc<Layer>> {
        self.snap.lock().unwrap().clone()
    }

    pub(crate) fn set_snap(&self, snap: Option<Arc<Layer>>) {
        *self.snap.lock().unwrap() = snap;
    }

    pub fn next(&self) -> Option<Arc<Layer>> {
        self.next.lock().unwrap().clone()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Layer>>) {
        *self.next.lock().unwrap() = next;
    }

    /// Returns the eldest layer of this layer's family.
    pub fn family_root(self: &Arc<Self>) -> Arc<Layer> {
        let mut root = self.clone();
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    }

    pub fn pcache(&self) -> &Arc<PageCache> {
        &self.pcache
    }

    pub fn ilock(&self) -> &Arc<Mutex<u64>> {
        &self.ilock
    }

    pub fn icache(&self) -> &InodeCache {
        &self.icache
    }

    /// Locks and returns the layer's counters.
    pub fn stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap()
    }

    pub fn icount(&self) -> u64 {
        self.icount.load(Ordering::Acquire)
    }

    pub(crate) fn icount_add(&self, n: u64) {
        self.icount.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn icount_sub(&self, n: u64) {
        self.icount.fetch_sub(n, Ordering::AcqRel);
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

    /// Number of blocks allocated to the layer over its lifetime.
    pub fn blocks(&self) -> u64 {
        self.alloc.lock().unwrap().blocks
    }

    pub fn freed(&self) -> u64 {
        self.alloc.lock().unwrap().freed
    }

    /// Number of metadata blocks allocated to the layer.
    pub fn meta_blocks(&self) -> u64 {
        self.alloc.lock().unwrap().meta_blocks
    }

    pub(crate) fn record_alloc(&self, start: u64, count: u64, meta: bool) {
        let mut alloc = self.alloc.lock().unwrap();
        alloc.blocks += count;
        if meta {
            alloc.meta_blocks += count;
        }
        alloc.extents.push((start, count));
    }

    pub(crate) fn record_freed(&self, count: u64) {
        self.alloc.lock().unwrap().freed += count;
    }

    pub(crate) fn take_extents(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.alloc.lock().unwrap().extents)
    }

    /// Starts a fresh inode index block, wrapping the previous one onto the
    /// pending cluster. Flushes the pipeline first when the cluster is full.
    pub fn new_inode_block(self: &Arc<Self>, gfs: &Gfs) -> io::Result<()> {
        {
            let count = self.pipeline.lock().unwrap().inode_block_count;
            if count >= CLUSTER_SIZE {
                self.flush_inode_blocks(gfs)?;
            }
        }
        let mut pipeline = self.pipeline.lock().unwrap();
        if let Some(buf) = pipeline.inode_blocks.take() {
            let page = self.pcache.get_page_no_block(gfs, self, buf);
            pipeline.inode_block_pages.push(page);
        }
        pipeline.inode_blocks = Some(AlignedBuf::new(BLOCK_SIZE));
        pipeline.inode_index = 0;
        pipeline.inode_block_count += 1;
        Ok(())
    }

    /// Records the address of a freshly written inode page in the current
    /// index block.
    pub fn add_inode_block(self: &Arc<Self>, gfs: &Gfs, block: u64) -> io::Result<()> {
        let full = {
            let pipeline = self.pipeline.lock().unwrap();
            pipeline.inode_blocks.is_none() || pipeline.inode_index >= IBLOCK_MAX
        };
        if full {
            self.new_inode_block(gfs)?;
        }
        let mut pipeline = self.pipeline.lock().unwrap();
        let index = pipeline.inode_index;
        let buf = pipeline.inode_blocks.as_mut().unwrap();
        let off = 8 + index * 8;
        buf[off..off + 8].copy_from_slice(&block.to_le_bytes());
        pipeline.inode_index = index + 1;
        Ok(())
    }

    /// Flushes the pending inode index cluster.
    ///
    /// Allocates one contiguous run for the whole cluster, chains the pages
    /// through their `ib_next` pointers and submits a single clustered
    /// write. The chain head recorded in the superblock becomes the lowest
    /// block of the run; its pages link upward through the run, and the
    /// highest page splices onto the previous chain head.
    pub fn flush_inode_blocks(self: &Arc<Self>, gfs: &Gfs) -> io::Result<()> {
        let mut pipeline = self.pipeline.lock().unwrap();
        if pipeline.inode_block_count == 0 {
            return Ok(());
        }
        if let Some(buf) = pipeline.inode_blocks.take() {
            let page = self.pcache.get_page_no_block(gfs, self, buf);
            pipeline.inode_block_pages.push(page);
        }
        let count = pipeline.inode_block_count;
        debug_assert_eq!(pipeline.inode_block_pages.len() as u64, count);
        let base = crate::alloc::alloc_blocks(gfs, self, count, true)?;
        let prev_head = { self.sb().sb_inode_block };
        for (i, page) in pipeline.inode_block_pages.iter().enumerate() {
            let block = base + i as u64;
            self.pcache.add_page_block_hash(page, block);
            let ib_next = if i as u64 == count - 1 {
                prev_head
            } else {
                block + 1
            };
            page.data()[..8].copy_from_slice(&ib_next.to_le_bytes());
        }
        self.pcache
            .flush_page_cluster(gfs, self, &pipeline.inode_block_pages)?;
        pipeline.inode_block_count = 0;
        pipeline.inode_block_pages.clear();
        self.sb().sb_inode_block = base;
        Ok(())
    }

    /// Number of index pages in the pending cluster.
    pub fn pending_inode_blocks(&self) -> u64 {
        self.pipeline.lock().unwrap().inode_block_count
    }

    /// Destroys the layer's caches and settles its counters.
    ///
    /// The page cache and the inode lock are only torn down when this layer
    /// is the eldest of its family; descendants alias them and must not
    /// free them. With `remove`, cached state is discarded instead of being
    /// required to be clean.
    pub fn destroy(self: &Arc<Self>, gfs: &Gfs, remove: bool) {
        {
            let pipeline = self.pipeline.lock().unwrap();
            debug_assert!(pipeline.inode_blocks.is_none());
            debug_assert_eq!(pipeline.inode_block_count, 0);
            debug_assert!(pipeline.inode_block_pages.is_empty());
        }
        inode::destroy_inodes(gfs, self, remove);
        if self.parent().is_none() {
            self.pcache.destroy_pages(gfs, remove);
        }
        debug_assert_eq!(self.icount(), 0);
        debug_assert_eq!(self.pcount(), 0);
        // Drop this layer's graph edges
        self.set_snap(None);
        self.set_next(None);
        self.set_parent(Weak::new());
        gfs.count_sub(1);
        debug!(
            "destroy layer index {} blocks allocated {} freed {}: {}",
            self.gindex(),
            self.blocks(),
            self.freed(),
            self.stats()
        );
    }
}

/// A layer locked through [`Gfs::get_layer`](crate::gfs::Gfs::get_layer);
/// unlocked when dropped.
pub struct LockedLayer {
    layer: Arc<Layer>,
}

impl LockedLayer {
    pub(crate) fn new(layer: Arc<Layer>) -> Self {
        Self { layer }
    }

    /// The underlying layer handle.
    pub fn layer(&self) -> &Arc<Layer> {
        &self.layer
    }
}

impl Deref for LockedLayer {
    type Target = Layer;

    fn deref(&self) -> &Self::Target {
        &self.layer
    }
}

impl Drop for LockedLayer {
    fn drop(&mut self) {
        self.layer.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mount::unmount;
    use crate::test_util::mounted;
    use std::fs;

    fn get_u64(buf: &[u8], off: usize) -> u64 {
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn cluster_flush_at_capacity() {
        let (path, gfs) = mounted(2048);
        let layer = gfs.global();

        // Filling one past the cluster capacity flushes exactly once
        for _ in 0..CLUSTER_SIZE + 1 {
            layer.new_inode_block(&gfs).unwrap();
        }
        {
            let stats = layer.stats();
            assert_eq!(stats.clusters, 1);
            assert_eq!(stats.cluster_pages, CLUSTER_SIZE);
        }
        // One index page is pending for the next flush
        assert_eq!(layer.pending_inode_blocks(), 1);

        layer.flush_inode_blocks(&gfs).unwrap();
        {
            let stats = layer.stats();
            assert_eq!(stats.clusters, 2);
            assert_eq!(stats.cluster_pages, CLUSTER_SIZE + 1);
        }
        assert_eq!(layer.pending_inode_blocks(), 0);

        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn flush_chains_pages_across_runs() {
        let (path, gfs) = mounted(2048);
        let layer = gfs.global();
        let prev_head = { layer.sb().sb_inode_block };

        // First run of three index pages
        for _ in 0..3 {
            layer.new_inode_block(&gfs).unwrap();
        }
        layer.flush_inode_blocks(&gfs).unwrap();
        let base1 = { layer.sb().sb_inode_block };

        // The chain walks upward through the run, then into the old chain
        let b0 = gfs.device().read_block(base1).unwrap();
        assert_eq!(get_u64(&b0, 0), base1 + 1);
        let b1 = gfs.device().read_block(base1 + 1).unwrap();
        assert_eq!(get_u64(&b1, 0), base1 + 2);
        let b2 = gfs.device().read_block(base1 + 2).unwrap();
        assert_eq!(get_u64(&b2, 0), prev_head);

        // A second run splices in front of the first
        for _ in 0..2 {
            layer.new_inode_block(&gfs).unwrap();
        }
        layer.flush_inode_blocks(&gfs).unwrap();
        let base2 = { layer.sb().sb_inode_block };
        assert_ne!(base2, base1);
        let b0 = gfs.device().read_block(base2).unwrap();
        assert_eq!(get_u64(&b0, 0), base2 + 1);
        let b1 = gfs.device().read_block(base2 + 1).unwrap();
        assert_eq!(get_u64(&b1, 0), base1);

        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn flush_on_empty_pipeline_is_noop() {
        let (path, gfs) = mounted(256);
        let layer = gfs.global();
        let head = { layer.sb().sb_inode_block };
        layer.flush_inode_blocks(&gfs).unwrap();
        assert_eq!({ layer.sb().sb_inode_block }, head);
        assert_eq!(layer.stats().clusters, 0);
        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn pipeline_pages_leave_the_cache_after_flush() {
        let (path, gfs) = mounted(256);
        let layer = gfs.global();
        for _ in 0..4 {
            layer.new_inode_block(&gfs).unwrap();
        }
        assert!(gfs.pcount() > 0);
        layer.flush_inode_blocks(&gfs).unwrap();
        assert_eq!(gfs.pcount(), 0);
        assert_eq!(layer.pcount(), 0);
        assert_eq!(layer.pcache().resident(), 0);
        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }
}
