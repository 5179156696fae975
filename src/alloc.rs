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

//! The block allocator hands out contiguous block runs.
//!
//! Allocation is first-fit from the free-extent list, falling back to the
//! watermark at the end of the allocated region. The free list is persisted
//! at unmount as a chain of map blocks referenced from the global
//! superblock and restored at mount.

use crate::BLOCK_SIZE;
use crate::device::AlignedBuf;
use crate::gfs::Gfs;
use crate::layer::Layer;
use log::warn;
use std::collections::BTreeMap;
use std::io;
use std::io::Error;

/// Number of extents in one block map block.
const BMAP_MAX: usize = (BLOCK_SIZE - 16) / 16;

/// Allocator state, guarded by the global context's allocator mutex.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Lowest never-allocated block address.
    next: u64,
    /// Total number of blocks on the device.
    tblocks: u64,
    /// Free extents below the watermark: start address to length.
    free: BTreeMap<u64, u64>,
}

impl BlockAllocator {
    pub fn new() -> Self {
        Self {
            next: 0,
            tblocks: 0,
            free: BTreeMap::new(),
        }
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the allocator from the global superblock.
///
/// Restores the watermark and walks the block map chain to rebuild the free
/// list. Must run after the layer forest has been recovered.
pub fn init(gfs: &Gfs) -> io::Result<()> {
    let global = gfs.global();
    let (watermark, tblocks, mut bmap) = {
        let sb = global.sb();
        ({ sb.sb_blocks }, { sb.sb_tblocks }, { sb.sb_bmap_block })
    };
    let mut alloc = gfs.alloc.lock().unwrap();
    alloc.next = watermark.max(1);
    alloc.tblocks = tblocks;
    alloc.free.clear();
    while bmap != 0 {
        let buf = gfs.device().read_block(bmap)?;
        let count = get_u64(&buf, 8) as usize;
        if count > BMAP_MAX {
            return Err(Error::from_raw_os_error(libc::EIO));
        }
        for i in 0..count {
            let start = get_u64(&buf, 16 + i * 16);
            let len = get_u64(&buf, 24 + i * 16);
            alloc.free.insert(start, len);
        }
        bmap = get_u64(&buf, 0);
    }
    Ok(())
}

/// Releases the allocator's in-memory state.
pub fn deinit(gfs: &Gfs) {
    let mut alloc = gfs.alloc.lock().unwrap();
    alloc.free.clear();
    alloc.next = 0;
    alloc.tblocks = 0;
}

/// Allocates a contiguous run of `count` blocks on behalf of `layer`.
///
/// `meta` marks metadata allocations (superblocks, inode index clusters);
/// the distinction only feeds accounting. Returns the lowest block of the
/// run, or `ENOSPC` when the device is exhausted.
pub fn alloc_blocks(gfs: &Gfs, layer: &Layer, count: u64, meta: bool) -> io::Result<u64> {
    let mut alloc = gfs.alloc.lock().unwrap();
    // First fit in the free list
    let fit = alloc
        .free
        .iter()
        .find(|(_, len)| **len >= count)
        .map(|(start, len)| (*start, *len));
    let start = if let Some((start, len)) = fit {
        alloc.free.remove(&start);
        if len > count {
            alloc.free.insert(start + count, len - count);
        }
        start
    } else {
        if alloc.next + count > alloc.tblocks {
            return Err(Error::from_raw_os_error(libc::ENOSPC));
        }
        let start = alloc.next;
        alloc.next += count;
        start
    };
    drop(alloc);
    layer.record_alloc(start, count, meta);
    Ok(start)
}

/// Returns the blocks recorded against `layer`.
///
/// With `remove`, the layer is being deleted and its extents go back to the
/// free list. Without it, only the bookkeeping is dropped; the blocks stay
/// allocated on disk.
pub fn free_layer_blocks(gfs: &Gfs, layer: &Layer, remove: bool) {
    let extents = layer.take_extents();
    if !remove {
        return;
    }
    let mut alloc = gfs.alloc.lock().unwrap();
    let mut freed = 0;
    for (start, len) in extents {
        alloc.free.insert(start, len);
        freed += len;
    }
    drop(alloc);
    layer.record_freed(freed);
}

/// Persists the free list as a chain of map blocks above the watermark and
/// records watermark and chain head in the global superblock.
pub fn update_block_map(gfs: &Gfs) -> io::Result<()> {
    let global = gfs.global();
    let alloc = gfs.alloc.lock().unwrap();
    let extents: Vec<(u64, u64)> = alloc.free.iter().map(|(s, l)| (*s, *l)).collect();
    let next = alloc.next;
    let tblocks = alloc.tblocks;
    drop(alloc);

    let nblocks = extents.len().div_ceil(BMAP_MAX) as u64;
    let mut sb = global.sb();
    sb.sb_blocks = next;
    if extents.is_empty() {
        sb.sb_bmap_block = 0;
        return Ok(());
    }
    if next + nblocks > tblocks {
        // No room left for the map; the free list is rebuilt on next format
        warn!("block map dropped, no room above watermark");
        sb.sb_bmap_block = 0;
        return Ok(());
    }
    sb.sb_bmap_block = next;
    drop(sb);
    for (i, chunk) in extents.chunks(BMAP_MAX).enumerate() {
        let block = next + i as u64;
        let mut buf = AlignedBuf::new(BLOCK_SIZE);
        let next_block = if (i + 1) * BMAP_MAX < extents.len() {
            block + 1
        } else {
            0
        };
        put_u64(&mut buf, 0, next_block);
        put_u64(&mut buf, 8, chunk.len() as u64);
        for (j, (start, len)) in chunk.iter().enumerate() {
            put_u64(&mut buf, 16 + j * 16, *start);
            put_u64(&mut buf, 24 + j * 16, *len);
        }
        gfs.device().write_blocks(block, &buf)?;
    }
    Ok(())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ROOT_INODE;
    use crate::SUPER_BLOCK;
    use crate::inode::make_dir;
    use crate::mount::unmount;
    use crate::test_util::mounted;
    use std::fs;

    #[test]
    fn contiguous_runs_and_exhaustion() {
        let (path, gfs) = mounted(64);
        let layer = gfs.global();

        let a = alloc_blocks(&gfs, &layer, 4, true).unwrap();
        let b = alloc_blocks(&gfs, &layer, 2, false).unwrap();
        // Runs are contiguous and disjoint
        assert_eq!(b, a + 4);
        assert_eq!(layer.blocks(), 6);

        let err = alloc_blocks(&gfs, &layer, 1000, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));

        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn freed_extents_are_reused() {
        let (path, gfs) = mounted(64);
        let layer = gfs.global();

        let a = alloc_blocks(&gfs, &layer, 3, false).unwrap();
        let watermark = gfs.alloc.lock().unwrap().next;
        free_layer_blocks(&gfs, &layer, true);
        assert_eq!(layer.freed(), 3);

        // The freed run satisfies the next allocation without moving the
        // watermark
        let b = alloc_blocks(&gfs, &layer, 2, false).unwrap();
        assert_eq!(b, a);
        assert_eq!(gfs.alloc.lock().unwrap().next, watermark);
        // The split remainder is still free
        let c = alloc_blocks(&gfs, &layer, 1, false).unwrap();
        assert_eq!(c, a + 2);

        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn free_map_survives_remount() {
        let (path, gfs) = mounted(256);
        let global = gfs.global();
        let snap_root = make_dir(&gfs, &global, ROOT_INODE, crate::mount::SNAP_DIR).unwrap();
        gfs.set_snap_root(snap_root, crate::inode::get_inode(&global, snap_root));
        let root = make_dir(&gfs, &global, snap_root, "doomed").unwrap();
        let layer = gfs.create_layer(None, Some(&global), root, true).unwrap();
        let freed_sblock = layer.sblock();
        // Everything is clean before the removal, so the unmount path does
        // not reallocate the blocks the removal frees
        crate::mount::sync(&gfs, &global);
        crate::mount::sync(&gfs, &layer);
        gfs.remove_layer(&layer).unwrap();
        unmount(&gfs);
        drop(gfs);

        let sb = {
            let dev = crate::device::Device::open(&path).unwrap();
            crate::superblock::SuperBlock::read(&dev, SUPER_BLOCK).unwrap()
        };
        assert_ne!({ sb.sb_bmap_block }, 0);

        let gfs = crate::mount::mount(&path).unwrap();
        {
            let alloc = gfs.alloc.lock().unwrap();
            assert!(alloc.free.contains_key(&freed_sblock));
        }
        // The freed block is handed out again below the watermark
        let global = gfs.global();
        let got = alloc_blocks(&gfs, &global, 1, true).unwrap();
        assert!(got <= freed_sblock);
        unmount(&gfs);
        fs::remove_file(&path).unwrap();
    }
}
