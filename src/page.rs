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

//! The page cache stages block writes.
//!
//! One page cache is shared by a whole layer family: the eldest layer owns
//! it and every descendant aliases it. Pages enter without a block address
//! ([`PageCache::get_page_no_block`]), get one assigned later
//! ([`PageCache::add_page_block_hash`]) and leave the cache when written,
//! either as part of a contiguous cluster or through the dirty-page flush.
//! Each page remembers the layer that created it; residency is settled
//! against that layer, never against whichever layer triggers the flush.

use crate::BLOCK_SIZE;
use crate::INVALID_BLOCK;
use crate::device::AlignedBuf;
use crate::gfs::Gfs;
use crate::layer::Layer;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A cached block image.
#[derive(Debug)]
pub struct Page {
    /// The page's content.
    data: Mutex<AlignedBuf>,
    /// The device block the page maps to, or [`INVALID_BLOCK`] while the
    /// page is not hashed yet.
    block: AtomicU64,
    /// Tells whether the page holds changes not yet on disk.
    dirty: AtomicBool,
    /// The layer the page is accounted to.
    owner: Weak<Layer>,
}

impl Page {
    /// Returns the page's block address.
    pub fn block(&self) -> u64 {
        self.block.load(Ordering::Acquire)
    }

    /// Locks and returns the page's content.
    pub fn data(&self) -> MutexGuard<'_, AlignedBuf> {
        self.data.lock().unwrap()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Block-indexed page table of a layer family.
#[derive(Debug)]
pub struct PageCache {
    /// Hashed pages, keyed by block address.
    pages: Mutex<HashMap<u64, Arc<Page>>>,
}

impl PageCache {
    /// Creates an empty page cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
        })
    }

    /// Wraps `data` into a page without assigning it a block address.
    ///
    /// The page is accounted as resident against `layer` but is not
    /// reachable through the cache until [`Self::add_page_block_hash`] is
    /// called.
    pub fn get_page_no_block(&self, gfs: &Gfs, layer: &Arc<Layer>, data: AlignedBuf) -> Arc<Page> {
        let page = Arc::new(Page {
            data: Mutex::new(data),
            block: AtomicU64::new(INVALID_BLOCK),
            dirty: AtomicBool::new(true),
            owner: Arc::downgrade(layer),
        });
        gfs.pcount_add(1);
        layer.pcount_add(1);
        page
    }

    /// Assigns `block` to `page` and hashes it into the cache.
    pub fn add_page_block_hash(&self, page: &Arc<Page>, block: u64) {
        debug_assert_ne!(block, INVALID_BLOCK);
        page.block.store(block, Ordering::Release);
        let prev = self.pages.lock().unwrap().insert(block, page.clone());
        debug_assert!(prev.is_none());
    }

    /// Inserts a dirty page for `block` with the given content.
    pub fn insert_dirty(
        &self,
        gfs: &Gfs,
        layer: &Arc<Layer>,
        block: u64,
        data: AlignedBuf,
    ) -> Arc<Page> {
        let page = self.get_page_no_block(gfs, layer, data);
        self.add_page_block_hash(&page, block);
        page
    }

    /// Settles the residency of pages leaving the cache against their
    /// owning layers.
    fn release(&self, gfs: &Gfs, pages: &[Arc<Page>]) {
        gfs.pcount_sub(pages.len() as u64);
        for page in pages {
            if let Some(owner) = page.owner.upgrade() {
                owner.pcount_sub(1);
            }
        }
    }

    /// Writes a contiguous cluster of pages in a single device write.
    ///
    /// All pages must be hashed to consecutive block addresses; the write
    /// covers the whole run. Written pages leave the cache.
    pub fn flush_page_cluster(
        &self,
        gfs: &Gfs,
        layer: &Layer,
        pages: &[Arc<Page>],
    ) -> io::Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let base = pages.iter().map(|p| p.block()).min().unwrap();
        let mut buf = AlignedBuf::new(pages.len() * BLOCK_SIZE);
        for page in pages {
            let off = (page.block() - base) as usize * BLOCK_SIZE;
            debug_assert!(off + BLOCK_SIZE <= buf.len());
            buf[off..off + BLOCK_SIZE].copy_from_slice(&page.data());
        }
        gfs.device().write_blocks(base, &buf)?;
        let mut table = self.pages.lock().unwrap();
        for page in pages {
            page.dirty.store(false, Ordering::Release);
            table.remove(&page.block());
        }
        drop(table);
        self.release(gfs, pages);
        let mut stats = layer.stats();
        stats.writes += pages.len() as u64;
        stats.clusters += 1;
        stats.cluster_pages += pages.len() as u64;
        Ok(())
    }

    /// Writes out every dirty page still in the cache.
    pub fn flush_dirty_pages(&self, gfs: &Gfs, layer: &Layer) -> io::Result<()> {
        let dirty: Vec<Arc<Page>> = {
            let table = self.pages.lock().unwrap();
            table.values().filter(|p| p.is_dirty()).cloned().collect()
        };
        for page in &dirty {
            gfs.device().write_blocks(page.block(), &page.data())?;
            page.dirty.store(false, Ordering::Release);
        }
        if dirty.is_empty() {
            return Ok(());
        }
        let mut table = self.pages.lock().unwrap();
        for page in &dirty {
            table.remove(&page.block());
        }
        drop(table);
        self.release(gfs, &dirty);
        layer.stats().writes += dirty.len() as u64;
        Ok(())
    }

    /// Tears the cache down.
    ///
    /// With `remove`, leftover pages are dropped without being written;
    /// otherwise the cache must already be empty. Only the family root
    /// calls this, after every family member has been synced or removed.
    pub fn destroy_pages(&self, gfs: &Gfs, remove: bool) {
        let mut table = self.pages.lock().unwrap();
        if !remove {
            debug_assert!(table.is_empty());
        }
        let leftover: Vec<Arc<Page>> = table.values().cloned().collect();
        table.clear();
        drop(table);
        if !leftover.is_empty() {
            self.release(gfs, &leftover);
        }
    }

    /// Number of pages currently resident.
    pub fn resident(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}
