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

//! Per-layer operation counters.
//!
//! Counters are reported through the logger when a layer is destroyed.

use std::fmt;

/// Operation counters of a single layer.
#[derive(Default)]
#[derive(Debug)]
pub struct Stats {
    /// Number of blocks read from the device.
    pub reads: u64,
    /// Number of blocks written to the device.
    pub writes: u64,
    /// Number of inode pages written through the cache.
    pub inode_pages: u64,
    /// Number of inode-block clusters flushed.
    pub clusters: u64,
    /// Number of pages written through cluster flushes.
    pub cluster_pages: u64,
    /// Number of times the layer has been synced.
    pub syncs: u64,
}

impl Stats {
    pub fn new() -> Self {
        Default::default()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "reads {} writes {} inode pages {} clusters {} cluster pages {} syncs {}",
            self.reads, self.writes, self.inode_pages, self.clusters, self.cluster_pages, self.syncs
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        let mut stats = Stats::new();
        stats.reads = 3;
        stats.clusters = 1;
        assert_eq!(
            format!("{stats}"),
            "reads 3 writes 0 inode pages 0 clusters 1 cluster pages 0 syncs 0"
        );
    }
}
