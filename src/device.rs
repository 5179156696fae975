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

//! Access to the underlying block device.
//!
//! The device is opened with direct I/O when the host supports it, so every
//! transfer goes through block-aligned buffers ([`AlignedBuf`]) at block
//! granularity.

use crate::BLOCK_SIZE;
use libc::ioctl;
use std::alloc;
use std::alloc::Layout;
use std::ffi::CString;
use std::ffi::c_long;
use std::fs::File;
use std::io;
use std::io::Error;
use std::ops::Deref;
use std::ops::DerefMut;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::slice;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl macro: Read command.
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        ioc!(2, $a, $b, std::mem::size_of::<$c>() as c_long)
    };
}

/// ioctl command: Get size of disk in bytes.
const BLKGETSIZE64: c_long = ior!(0x12, 114, u64);

/// A block-aligned, heap-allocated buffer whose length is a multiple of
/// [`BLOCK_SIZE`], suitable for direct I/O.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
}

// The buffer is uniquely owned.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `len` bytes. `len` must be a non-zero
    /// multiple of [`BLOCK_SIZE`].
    pub fn new(len: usize) -> Self {
        assert!(len > 0 && len % BLOCK_SIZE == 0);
        let layout = Layout::from_size_align(len, BLOCK_SIZE).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self { ptr, len }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, BLOCK_SIZE).unwrap();
        unsafe {
            alloc::dealloc(self.ptr, layout);
        }
    }
}

/// Handle to the block device backing a mounted filesystem.
#[derive(Debug)]
pub struct Device {
    /// The open device file.
    file: File,
    /// The size of the device in bytes.
    size: u64,
}

impl Device {
    /// Opens the device at `path` for mounting.
    ///
    /// The device is opened read-write, exclusive, without access-time
    /// updates and with direct I/O. When the underlying filesystem does not
    /// support `O_DIRECT` (regular files on tmpfs), the open falls back to
    /// buffered I/O.
    pub fn open(path: &Path) -> io::Result<Self> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
        let flags = libc::O_RDWR | libc::O_EXCL | libc::O_NOATIME;
        let mut fd = unsafe { libc::open(path_c.as_ptr(), flags | libc::O_DIRECT, 0) };
        if fd < 0 && Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
            fd = unsafe { libc::open(path_c.as_ptr(), flags, 0) };
        }
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        let size = device_size(&file)?;
        if size < BLOCK_SIZE as u64 {
            return Err(Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(Self { file, size })
    }

    /// Returns the size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the block at address `block` into a fresh buffer.
    pub fn read_block(&self, block: u64) -> io::Result<AlignedBuf> {
        let mut buf = AlignedBuf::new(BLOCK_SIZE);
        self.file
            .read_exact_at(&mut buf, block * BLOCK_SIZE as u64)?;
        Ok(buf)
    }

    /// Writes `buf` starting at the block address `block`.
    pub fn write_blocks(&self, block: u64, buf: &AlignedBuf) -> io::Result<()> {
        self.file.write_all_at(buf, block * BLOCK_SIZE as u64)
    }

    /// Flushes device caches.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Returns the size in bytes of the device behind `dev`.
fn device_size(dev: &File) -> io::Result<u64> {
    let metadata = dev.metadata()?;
    let file_type = metadata.file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size = 0u64;
        let ret = unsafe { ioctl(dev.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(size)
    } else {
        Ok(metadata.len())
    }
}
