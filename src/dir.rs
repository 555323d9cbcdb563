//! Directory traversal and mutation.
//!
//! A directory is a cluster chain like any other file; its content is a
//! run of 32-byte entries, `sectors_per_cluster * 16` per cluster.
//! Traversal inspects the first byte of each slot: `0x00` means nothing
//! is allocated from here to the end of the directory and the walk may
//! stop, `0xE5` marks a deleted entry to skip. Free slots are taken
//! from the `0x00` frontier only; deleted slots are not reused.
//!
//! When the frontier lies beyond the last cluster, the directory chain
//! is extended by one zero-filled cluster and the new entry lands in
//! its first slot. New directories additionally get their `.` and `..`
//! entries; the dot entry points at the directory itself, the dot-dot
//! entry at the parent, or 0 when the parent is the root.

use alloc::string::String;
use alloc::vec::Vec;

use crate::entry::{short_name_from_str, DirEntry};
use crate::fs::FileSystem;
use crate::{
    is_end_of_chain, Error, ATTR_DIRECTORY, DIRENT_SIZE, ROOT_CLUSTER, SECTOR_SIZE,
};

const SLOTS_PER_SECTOR: usize = SECTOR_SIZE / DIRENT_SIZE;

/// Outcome of scanning a directory for a name or a usable slot.
pub(crate) enum SlotSearch {
    /// An entry with this display name already exists.
    Exists,
    /// First never-used slot.
    Free { sector: u32, offset: usize },
    /// Directory is full; extend the chain after this tail cluster.
    NeedExtend { tail_cluster: u32 },
}

impl FileSystem {
    /// Find a live entry by display name. Volume labels never match.
    /// Returns the entry with the sector and in-sector offset of its
    /// FDI.
    pub(crate) fn dir_find_entry(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<(DirEntry, u32, usize)>, Error> {
        let mut clu = dir_cluster;
        let mut buf = [0u8; SECTOR_SIZE];
        loop {
            let base = self.volume.sector_of_cluster(clu);
            for s in 0..self.volume.sectors_per_cluster {
                self.read_sector(base + s, &mut buf)?;
                for slot in 0..SLOTS_PER_SECTOR {
                    let offset = slot * DIRENT_SIZE;
                    let entry = DirEntry::from_slice(&buf[offset..]);
                    if entry.is_end() {
                        return Ok(None);
                    }
                    if entry.is_deleted() || entry.is_volume_label() {
                        continue;
                    }
                    if entry.display_name() == name {
                        return Ok(Some((entry, base + s, offset)));
                    }
                }
            }
            let next = self.fat.next(clu)?;
            if is_end_of_chain(next) {
                return Ok(None);
            }
            if next < 2 {
                return Err(Error::CorruptChain);
            }
            clu = next;
        }
    }

    /// Scan for `name` or the first never-used slot, whichever comes
    /// first. A `0x00` byte proves no entry follows it, so a duplicate
    /// can only precede the free slot the scan settles on.
    pub(crate) fn dir_locate_slot(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> Result<SlotSearch, Error> {
        let mut clu = dir_cluster;
        let mut buf = [0u8; SECTOR_SIZE];
        loop {
            let base = self.volume.sector_of_cluster(clu);
            for s in 0..self.volume.sectors_per_cluster {
                self.read_sector(base + s, &mut buf)?;
                for slot in 0..SLOTS_PER_SECTOR {
                    let offset = slot * DIRENT_SIZE;
                    let entry = DirEntry::from_slice(&buf[offset..]);
                    if entry.is_end() {
                        return Ok(SlotSearch::Free {
                            sector: base + s,
                            offset,
                        });
                    }
                    if entry.is_deleted() || entry.is_volume_label() {
                        continue;
                    }
                    if entry.display_name() == name {
                        return Ok(SlotSearch::Exists);
                    }
                }
            }
            let next = self.fat.next(clu)?;
            if is_end_of_chain(next) {
                return Ok(SlotSearch::NeedExtend { tail_cluster: clu });
            }
            if next < 2 {
                return Err(Error::CorruptChain);
            }
            clu = next;
        }
    }

    /// Display names and attribute bytes of all live entries.
    pub(crate) fn dir_list(&self, dir_cluster: u32) -> Result<Vec<(String, u8)>, Error> {
        let mut list = Vec::new();
        let mut clu = dir_cluster;
        let mut buf = [0u8; SECTOR_SIZE];
        loop {
            let base = self.volume.sector_of_cluster(clu);
            for s in 0..self.volume.sectors_per_cluster {
                self.read_sector(base + s, &mut buf)?;
                for slot in 0..SLOTS_PER_SECTOR {
                    let offset = slot * DIRENT_SIZE;
                    let entry = DirEntry::from_slice(&buf[offset..]);
                    if entry.is_end() {
                        return Ok(list);
                    }
                    if entry.is_deleted() {
                        continue;
                    }
                    list.push((entry.display_name(), entry.attr()));
                }
            }
            let next = self.fat.next(clu)?;
            if is_end_of_chain(next) {
                return Ok(list);
            }
            if next < 2 {
                return Err(Error::CorruptChain);
            }
            clu = next;
        }
    }

    /// Splice one entry into a directory sector.
    pub(crate) fn write_fdi_at(
        &self,
        sector: u32,
        offset: usize,
        entry: &DirEntry,
    ) -> Result<(), Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sector(sector, &mut buf)?;
        buf[offset..offset + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
        self.write_sector(sector, &buf)
    }

    /// Lay down `.` and `..` in the first two slots of a directory's
    /// freshly zeroed first cluster.
    pub(crate) fn write_dot_entries(&self, cluster: u32, parent: u32) -> Result<(), Error> {
        let mut dot = DirEntry::new(short_name_from_str(".")?, ATTR_DIRECTORY);
        dot.set_first_cluster(cluster);
        let mut dotdot = DirEntry::new(short_name_from_str("..")?, ATTR_DIRECTORY);
        dotdot.set_first_cluster(if parent == ROOT_CLUSTER { 0 } else { parent });

        let mut buf = [0u8; SECTOR_SIZE];
        buf[..DIRENT_SIZE].copy_from_slice(dot.as_bytes());
        buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.as_bytes());
        self.write_sector(self.volume.sector_of_cluster(cluster), &buf)
    }
}
