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

//! Inodes and the per-layer inode cache.
//!
//! Inodes are persisted one per block. The addresses of written inode pages
//! are collected in inode index blocks which the layer's pipeline chains and
//! flushes in clusters; recovery walks the chain from the superblock to
//! reload every inode.

use crate::BLOCK_SIZE;
use crate::INVALID_INODE;
use crate::device::AlignedBuf;
use crate::gfs::Gfs;
use crate::layer::IBLOCK_MAX;
use crate::layer::Layer;
use crate::superblock::timestamp;
use log::error;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::io::Error;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The kind of a file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileType {
    Directory,
    Regular,
}

impl FileType {
    fn to_raw(self) -> u8 {
        match self {
            Self::Directory => 1,
            Self::Regular => 2,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Directory),
            2 => Some(Self::Regular),
            _ => None,
        }
    }
}

/// An in-memory inode.
#[derive(Debug)]
pub struct Inode {
    /// The inode number, local to the layer's namespace.
    ino: u64,
    /// The kind of the file.
    ftype: FileType,
    /// File size in bytes. Directories hold the serialized size of their
    /// entries.
    size: AtomicU64,
    /// Creation time.
    ctime: u64,
    /// Last modification time.
    mtime: AtomicU64,
    /// Tells whether the inode differs from its on-disk image.
    dirty: AtomicBool,
    /// Directory entries, name to inode number. Empty for regular files.
    entries: Mutex<BTreeMap<String, u64>>,
}

impl Inode {
    fn new(ino: u64, ftype: FileType) -> Arc<Self> {
        let now = timestamp();
        Arc::new(Self {
            ino,
            ftype,
            size: AtomicU64::new(0),
            ctime: now,
            mtime: AtomicU64::new(now),
            dirty: AtomicBool::new(false),
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn ftype(&self) -> FileType {
        self.ftype
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the inode out of sync with its on-disk image.
    pub fn mark_dirty(&self) {
        self.mtime.store(timestamp(), Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns the inode number bound to `name`, for directories.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(name).copied()
    }

    /// Binds `name` to `ino` in the directory.
    pub fn insert(&self, name: &str, ino: u64) {
        debug_assert_eq!(self.ftype, FileType::Directory);
        let prev = self.entries.lock().unwrap().insert(name.to_string(), ino);
        if prev.is_none() {
            // Serialized size of the new entry record
            self.size
                .fetch_add(10 + name.len() as u64, Ordering::AcqRel);
        }
        self.mark_dirty();
    }

    /// Serializes the inode into a block-sized page.
    fn encode(&self) -> io::Result<AlignedBuf> {
        let mut buf = AlignedBuf::new(BLOCK_SIZE);
        buf[0..8].copy_from_slice(&self.ino.to_le_bytes());
        buf[8] = self.ftype.to_raw();
        buf[16..24].copy_from_slice(&self.size().to_le_bytes());
        buf[24..32].copy_from_slice(&self.ctime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.mtime.load(Ordering::Acquire).to_le_bytes());
        let entries = self.entries.lock().unwrap();
        buf[40..44].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        let mut off = 44;
        for (name, ino) in entries.iter() {
            let name = name.as_bytes();
            if off + 10 + name.len() > BLOCK_SIZE {
                // The directory no longer fits in its page
                return Err(Error::from_raw_os_error(libc::EFBIG));
            }
            buf[off..off + 8].copy_from_slice(&ino.to_le_bytes());
            buf[off + 8..off + 10].copy_from_slice(&(name.len() as u16).to_le_bytes());
            buf[off + 10..off + 10 + name.len()].copy_from_slice(name);
            off += 10 + name.len();
        }
        Ok(buf)
    }

    /// Decodes an inode page. Returns `None` for blank pages.
    fn decode(buf: &[u8]) -> Option<Arc<Self>> {
        let ino = get_u64(buf, 0);
        if ino == INVALID_INODE {
            return None;
        }
        let ftype = FileType::from_raw(buf[8])?;
        let size = get_u64(buf, 16);
        let ctime = get_u64(buf, 24);
        let mtime = get_u64(buf, 32);
        let count = u32::from_le_bytes(buf[40..44].try_into().unwrap()) as usize;
        let mut entries = BTreeMap::new();
        let mut off = 44;
        for _ in 0..count {
            if off + 10 > buf.len() {
                return None;
            }
            let entry_ino = get_u64(buf, off);
            let name_len = u16::from_le_bytes(buf[off + 8..off + 10].try_into().unwrap()) as usize;
            if off + 10 + name_len > buf.len() {
                return None;
            }
            let name = String::from_utf8(buf[off + 10..off + 10 + name_len].to_vec()).ok()?;
            entries.insert(name, entry_ino);
            off += 10 + name_len;
        }
        Some(Arc::new(Self {
            ino,
            ftype,
            size: AtomicU64::new(size),
            ctime,
            mtime: AtomicU64::new(mtime),
            dirty: AtomicBool::new(false),
            entries: Mutex::new(entries),
        }))
    }
}

/// Per-layer table of resident inodes.
#[derive(Debug)]
pub struct InodeCache {
    inodes: Mutex<HashMap<u64, Arc<Inode>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        Self {
            inodes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs a fresh root directory for the layer.
pub fn root_init(_gfs: &Gfs, layer: &Layer, ino: u64) {
    let root = Inode::new(ino, FileType::Directory);
    root.mark_dirty();
    let prev = layer
        .icache()
        .inodes
        .lock()
        .unwrap()
        .insert(ino, root);
    debug_assert!(prev.is_none());
    layer.icount_add(1);
    layer.mark_dirty();
}

/// Returns the inode `ino` of the layer, if resident.
pub fn get_inode(layer: &Layer, ino: u64) -> Option<Arc<Inode>> {
    layer.icache().inodes.lock().unwrap().get(&ino).cloned()
}

/// Looks `name` up in the directory `dir` of the layer.
///
/// Returns [`INVALID_INODE`] when the directory or the entry does not exist.
pub fn dir_lookup(layer: &Layer, dir: u64, name: &str) -> u64 {
    get_inode(layer, dir)
        .and_then(|inode| inode.lookup(name))
        .unwrap_or(INVALID_INODE)
}

/// Creates a directory named `name` under the directory `parent` of the
/// layer and returns its inode number.
pub fn make_dir(_gfs: &Gfs, layer: &Layer, parent: u64, name: &str) -> io::Result<u64> {
    let dir = get_inode(layer, parent).ok_or_else(|| Error::from_raw_os_error(libc::ENOENT))?;
    if dir.ftype() != FileType::Directory {
        return Err(Error::from_raw_os_error(libc::ENOTDIR));
    }
    if dir.lookup(name).is_some() {
        return Err(Error::from_raw_os_error(libc::EEXIST));
    }
    let ino = {
        let mut next = layer.ilock().lock().unwrap();
        let ino = *next;
        *next += 1;
        ino
    };
    let inode = Inode::new(ino, FileType::Directory);
    inode.mark_dirty();
    layer.icache().inodes.lock().unwrap().insert(ino, inode);
    layer.icount_add(1);
    dir.insert(name, ino);
    layer.mark_dirty();
    Ok(ino)
}

/// Reloads every inode of the layer from its on-disk index chain.
///
/// The chain is walked newest cluster first, so the first image seen for an
/// inode number is the current one.
pub fn read_inodes(gfs: &Gfs, layer: &Layer) -> io::Result<()> {
    let mut block = { layer.sb().sb_inode_block };
    let mut max_ino = 0;
    while block != 0 {
        let iblock = gfs.device().read_block(block)?;
        layer.stats().reads += 1;
        for i in 0..IBLOCK_MAX {
            let addr = get_u64(&iblock, 8 + i * 8);
            if addr == 0 {
                continue;
            }
            let page = gfs.device().read_block(addr)?;
            layer.stats().reads += 1;
            let Some(inode) = Inode::decode(&page) else {
                continue;
            };
            let ino = inode.ino();
            let mut inodes = layer.icache().inodes.lock().unwrap();
            if !inodes.contains_key(&ino) {
                inodes.insert(ino, inode);
                drop(inodes);
                layer.icount_add(1);
                max_ino = max_ino.max(ino);
            }
        }
        block = get_u64(&iblock, 0);
    }
    if get_inode(layer, layer.root()).is_none() {
        error!(
            "root inode {} missing in layer index {}",
            layer.root(),
            layer.gindex()
        );
        return Err(Error::from_raw_os_error(libc::EIO));
    }
    // Keep the family's inode numbering above everything recovered
    let mut next = layer.ilock().lock().unwrap();
    if *next <= max_ino {
        *next = max_ino + 1;
    }
    Ok(())
}

/// Writes out every dirty inode of the layer.
///
/// Each dirty inode becomes one freshly allocated inode page staged in the
/// family page cache; its address is recorded in the layer's inode index
/// pipeline, which is flushed at the end.
pub fn sync_inodes(gfs: &Gfs, layer: &Arc<Layer>) -> io::Result<()> {
    let dirty: Vec<Arc<Inode>> = {
        let inodes = layer.icache().inodes.lock().unwrap();
        inodes.values().filter(|i| i.is_dirty()).cloned().collect()
    };
    for inode in &dirty {
        let buf = inode.encode()?;
        let block = crate::alloc::alloc_blocks(gfs, layer, 1, false)?;
        layer.pcache().insert_dirty(gfs, layer, block, buf);
        layer.add_inode_block(gfs, block)?;
        inode.dirty.store(false, Ordering::Release);
        layer.stats().inode_pages += 1;
    }
    layer.flush_inode_blocks(gfs)
}

/// Drops the layer's inode cache.
///
/// Without `remove`, every inode must already be clean.
pub fn destroy_inodes(_gfs: &Gfs, layer: &Layer, remove: bool) {
    let mut inodes = layer.icache().inodes.lock().unwrap();
    if !remove {
        debug_assert!(inodes.values().all(|i| !i.is_dirty()));
    }
    let count = inodes.len() as u64;
    inodes.clear();
    drop(inodes);
    layer.icount_sub(count);
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inode_codec_round_trip() {
        let inode = Inode::new(42, FileType::Directory);
        inode.insert("hello", 43);
        inode.insert("world", 44);
        let buf = inode.encode().unwrap();

        let decoded = Inode::decode(&buf).unwrap();
        assert_eq!(decoded.ino(), 42);
        assert_eq!(decoded.ftype(), FileType::Directory);
        assert_eq!(decoded.lookup("hello"), Some(43));
        assert_eq!(decoded.lookup("world"), Some(44));
        assert_eq!(decoded.lookup("missing"), None);
        assert!(!decoded.is_dirty());
    }

    #[test]
    fn blank_page_decodes_to_none() {
        let buf = AlignedBuf::new(BLOCK_SIZE);
        assert!(Inode::decode(&buf).is_none());
    }

    #[test]
    fn oversized_directory_rejected() {
        let inode = Inode::new(2, FileType::Directory);
        for i in 0..200 {
            inode.insert(&format!("some-rather-long-entry-name-{i:04}"), 100 + i);
        }
        assert!(inode.encode().is_err());
    }
}
