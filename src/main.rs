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

//! The `layerfs` command manages layerfs devices.

use layerfs::BLOCK_SIZE;
use layerfs::SUPER_BLOCK;
use layerfs::device::Device;
use layerfs::mount;
use layerfs::superblock::SUPER_DIRTY;
use layerfs::superblock::SuperBlock;
use std::env;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::exit;
use uuid::Uuid;

/// Prints the command's usage.
fn print_usage() {
    eprintln!("Usage:");
    eprintln!(" layerfs format <device>");
    eprintln!(" layerfs info <device>");
    eprintln!(" layerfs mount <device>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!(" format:\tcreates a fresh filesystem on the device");
    eprintln!(" info:\t\tprints the superblock and the layer tree of the device");
    eprintln!(" mount:\t\tmounts the device, prints the layer table, unmounts");
}

/// Writes an error to stderr, then exits.
fn error<M: fmt::Display>(msg: M) -> ! {
    eprintln!("layerfs: error: {msg}");
    exit(1);
}

/// Formats the device by mounting it with a poisoned superblock.
fn format(path: &Path) {
    let dev = Device::open(path).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", path.display()));
    });
    // Force the format branch of the next mount
    let mut sb = SuperBlock::read(&dev, SUPER_BLOCK).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", path.display()));
    });
    sb.sb_flags |= SUPER_DIRTY;
    sb.write(&dev, SUPER_BLOCK).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", path.display()));
    });
    drop(dev);
    let gfs = mount::mount(path).unwrap_or_else(|e| {
        error(format_args!("cannot format {}: {e}", path.display()));
    });
    mount::unmount(&gfs);
    println!("{} formatted", path.display());
}

/// Prints the superblock at `block` and recurses into the layer forest.
fn print_tree(dev: &Device, block: u64, depth: usize) {
    let sb = SuperBlock::read(dev, block).unwrap_or_else(|e| {
        error(format_args!("cannot read superblock at {block}: {e}"));
    });
    if !sb.is_valid() {
        error(format_args!("invalid superblock at block {block}"));
    }
    let index = { sb.sb_index };
    let root = { sb.sb_root };
    let uuid = Uuid::from_bytes({ sb.sb_uuid });
    println!(
        "{:indent$}layer {index}: block {block} root {root} uuid {uuid}{}",
        "",
        if sb.is_dirty() { " (dirty)" } else { "" },
        indent = depth * 2
    );
    let child = { sb.sb_child_snap };
    if child != 0 {
        print_tree(dev, child, depth + 1);
    }
    let next = { sb.sb_next_snap };
    if next != 0 {
        print_tree(dev, next, depth);
    }
}

/// Prints the device's superblock and layer tree.
fn info(path: &Path) {
    let dev = Device::open(path).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", path.display()));
    });
    let sb = SuperBlock::read(&dev, SUPER_BLOCK).unwrap_or_else(|e| {
        error(format_args!("{}: {e}", path.display()));
    });
    if !sb.is_valid() {
        error(format_args!("{}: not a layerfs device", path.display()));
    }
    let tblocks = { sb.sb_tblocks };
    println!("device: {}", path.display());
    println!("size: {} bytes ({tblocks} blocks)", tblocks * BLOCK_SIZE as u64);
    println!("mounts: {}", { sb.sb_mounts });
    println!("dirty: {}", sb.is_dirty());
    print_tree(&dev, SUPER_BLOCK, 0);
}

/// Mounts the device, prints the layer table and unmounts.
fn mount_device(path: &Path) {
    let gfs = mount::mount(path).unwrap_or_else(|e| {
        error(format_args!("cannot mount {}: {e}", path.display()));
    });
    for i in 0..=gfs.high_water() {
        let Some(layer) = gfs.layer_at(i) else {
            continue;
        };
        println!(
            "slot {i}: sblock {} root {} {}",
            layer.sblock(),
            layer.root(),
            if layer.is_read_only() { "ro" } else { "rw" }
        );
    }
    mount::unmount(&gfs);
}

fn main() {
    env_logger::init();
    let args: Vec<_> = env::args_os().skip(1).collect();
    let [cmd, device] = &args[..] else {
        print_usage();
        exit(1);
    };
    let path = PathBuf::from(device);
    match cmd.to_str() {
        Some("format") => format(&path),
        Some("info") => info(&path),
        Some("mount") => mount_device(&path),
        _ => {
            print_usage();
            exit(1);
        }
    }
}
