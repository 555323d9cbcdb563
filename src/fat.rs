//! FAT table access.
//!
//! [`FatTable`] reads and writes single 32-bit entries, follows chains,
//! and hunts for free clusters. It owns its device handle and a view of
//! the FAT region geometry, nothing else; all higher bookkeeping (free
//! counts, hints, FSINFO) lives with the volume.
//!
//! Chain walking uses a segment-skip traversal: one FAT sector maps 128
//! consecutive clusters, so while the next-pointers of a chain land
//! inside the loaded sector the walk advances purely in memory, and a
//! sector read is only issued when the chain leaves that window. For
//! mostly-contiguous files this costs one read per 128 clusters instead
//! of one per cluster.
//!
//! Mutating walks batch their writes the same way: [`FatBatch`] holds
//! one dirty FAT sector and flushes it only when the walk crosses into
//! another, so FAT mutation costs one sector write per touched sector.

use alloc::sync::Arc;

use log::warn;

use crate::block_dev::BlockDevice;
use crate::volume::Volume;
use crate::{
    is_end_of_chain, read_le_u32, write_le_u32, Error, CLUSTER_MASK, ENTRIES_PER_FAT_SECTOR,
    FAT_ENTRY_SIZE, FREE_CLUSTER, SECTOR_SIZE,
};

pub struct FatTable {
    device: Arc<dyn BlockDevice>,
    fat_start_sector: u32,
    fat_sectors: u32,
    /// Highest valid data cluster number.
    max_cluster: u32,
}

impl FatTable {
    pub fn new(device: Arc<dyn BlockDevice>, vol: &Volume) -> Self {
        Self {
            device,
            fat_start_sector: vol.fat1_start_sector,
            fat_sectors: vol.fat_size_sectors,
            max_cluster: vol.max_cluster,
        }
    }

    pub fn max_cluster(&self) -> u32 {
        self.max_cluster
    }

    /// (absolute FAT sector, byte offset within it) of a cluster's entry.
    pub(crate) fn entry_location(&self, cluster: u32) -> (u32, usize) {
        let byte = cluster as usize * FAT_ENTRY_SIZE;
        (
            self.fat_start_sector + (byte / SECTOR_SIZE) as u32,
            byte % SECTOR_SIZE,
        )
    }

    /// Read one FAT entry, masked to its 28 significant bits.
    pub fn next(&self, cluster: u32) -> Result<u32, Error> {
        let (sector, offset) = self.entry_location(cluster);
        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read_sectors(&mut buf, sector, 1)?;
        Ok(read_le_u32(&buf[offset..]) & CLUSTER_MASK)
    }

    /// Read-modify-write one FAT entry, preserving the reserved high
    /// 4 bits of the 32-bit slot.
    pub fn set(&self, cluster: u32, value: u32) -> Result<(), Error> {
        let (sector, offset) = self.entry_location(cluster);
        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read_sectors(&mut buf, sector, 1)?;
        let old = read_le_u32(&buf[offset..]);
        write_le_u32(
            &mut buf[offset..],
            (old & !CLUSTER_MASK) | (value & CLUSTER_MASK),
        );
        self.device.write_sectors(&buf, sector, 1)?;
        Ok(())
    }

    /// Follow a chain to its tail with the segment-skip walk.
    ///
    /// Returns the cluster whose FAT entry carries the end-of-chain
    /// mark. Any 0 or 1 entry mid-chain, or a next-pointer outside the
    /// valid cluster range, fails with `CorruptChain`.
    pub fn follow_chain_fast(&self, start: u32) -> Result<u32, Error> {
        if start < 2 || start > self.max_cluster {
            return Err(Error::CorruptChain);
        }
        let mut clu = start;
        let mut buf = [0u8; SECTOR_SIZE];
        loop {
            let (sector, _) = self.entry_location(clu);
            self.device.read_sectors(&mut buf, sector, 1)?;
            // Clusters mapped by the loaded sector.
            let head = clu - clu % ENTRIES_PER_FAT_SECTOR as u32;
            let tail = head + ENTRIES_PER_FAT_SECTOR as u32 - 1;
            loop {
                let offset = (clu as usize % ENTRIES_PER_FAT_SECTOR) * FAT_ENTRY_SIZE;
                let next = read_le_u32(&buf[offset..]) & CLUSTER_MASK;
                if is_end_of_chain(next) {
                    return Ok(clu);
                }
                if next < 2 || next > self.max_cluster {
                    warn!("fat32: corrupt chain: {} -> {:#x}", clu, next);
                    return Err(Error::CorruptChain);
                }
                clu = next;
                if next < head || next > tail {
                    break;
                }
            }
        }
    }

    /// Zero every entry of a chain, batching writes per FAT sector.
    /// Returns the number of clusters freed.
    pub fn destroy_chain(&self, start: u32) -> Result<u32, Error> {
        if start < 2 || start > self.max_cluster {
            return Err(Error::CorruptChain);
        }
        let mut clu = start;
        let mut freed = 0u32;
        let mut batch = self.batch();
        loop {
            let next = batch.get(clu)?;
            batch.set(clu, FREE_CLUSTER)?;
            freed += 1;
            if is_end_of_chain(next) {
                break;
            }
            if next < 2 || next > self.max_cluster {
                batch.flush()?;
                warn!("fat32: corrupt chain while freeing: {} -> {:#x}", clu, next);
                return Err(Error::CorruptChain);
            }
            clu = next;
        }
        batch.flush()?;
        Ok(freed)
    }

    /// Scan a cluster range (inclusive) for the lowest zero entry.
    fn scan_free(&self, lo: u32, hi: u32) -> Result<Option<u32>, Error> {
        if lo > hi {
            return Ok(None);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        let first_sector = self.entry_location(lo).0;
        let last_sector = self.entry_location(hi).0;
        let mut clu = lo;
        for sector in first_sector..=last_sector {
            self.device.read_sectors(&mut buf, sector, 1)?;
            while self.entry_location(clu).0 == sector {
                let offset = (clu as usize % ENTRIES_PER_FAT_SECTOR) * FAT_ENTRY_SIZE;
                if read_le_u32(&buf[offset..]) & CLUSTER_MASK == FREE_CLUSTER {
                    return Ok(Some(clu));
                }
                if clu == hi {
                    return Ok(None);
                }
                clu += 1;
            }
        }
        Ok(None)
    }

    /// Lowest free cluster on the volume, if any.
    pub fn find_first_free(&self) -> Result<Option<u32>, Error> {
        self.scan_free(2, self.max_cluster)
    }

    /// Lowest free cluster strictly after `after`, wrapping to the
    /// start of the FAT when the end is reached.
    pub fn find_next_free(&self, after: u32) -> Result<Option<u32>, Error> {
        let from = if after < 2 { 2 } else { after + 1 };
        if from <= self.max_cluster {
            if let Some(clu) = self.scan_free(from, self.max_cluster)? {
                return Ok(Some(clu));
            }
        }
        self.scan_free(2, after.min(self.max_cluster))
    }

    /// Count zero entries across the whole table. Used when FSINFO
    /// reports the free count as unknown.
    pub fn count_free(&self) -> Result<u32, Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut count = 0u32;
        let mut clu = 2u32;
        'outer: for sector_idx in 0..self.fat_sectors {
            self.device
                .read_sectors(&mut buf, self.fat_start_sector + sector_idx, 1)?;
            while self.entry_location(clu).0 == self.fat_start_sector + sector_idx {
                let offset = (clu as usize % ENTRIES_PER_FAT_SECTOR) * FAT_ENTRY_SIZE;
                if read_le_u32(&buf[offset..]) & CLUSTER_MASK == FREE_CLUSTER {
                    count += 1;
                }
                if clu == self.max_cluster {
                    break 'outer;
                }
                clu += 1;
            }
        }
        Ok(count)
    }

    pub(crate) fn batch(&self) -> FatBatch<'_> {
        FatBatch {
            table: self,
            sector: 0,
            buf: [0; SECTOR_SIZE],
            loaded: false,
            dirty: false,
        }
    }
}

/// One buffered FAT sector for write batching. Loading a different
/// sector flushes the current one first, so mutation order on disk
/// follows call order.
pub(crate) struct FatBatch<'a> {
    table: &'a FatTable,
    sector: u32,
    buf: [u8; SECTOR_SIZE],
    loaded: bool,
    dirty: bool,
}

impl FatBatch<'_> {
    fn load(&mut self, sector: u32) -> Result<(), Error> {
        if self.loaded && self.sector == sector {
            return Ok(());
        }
        self.flush()?;
        self.table.device.read_sectors(&mut self.buf, sector, 1)?;
        self.sector = sector;
        self.loaded = true;
        Ok(())
    }

    pub fn get(&mut self, cluster: u32) -> Result<u32, Error> {
        let (sector, offset) = self.table.entry_location(cluster);
        self.load(sector)?;
        Ok(read_le_u32(&self.buf[offset..]) & CLUSTER_MASK)
    }

    pub fn set(&mut self, cluster: u32, value: u32) -> Result<(), Error> {
        let (sector, offset) = self.table.entry_location(cluster);
        self.load(sector)?;
        let old = read_le_u32(&self.buf[offset..]);
        write_le_u32(
            &mut self.buf[offset..],
            (old & !CLUSTER_MASK) | (value & CLUSTER_MASK),
        );
        self.dirty = true;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if self.loaded && self.dirty {
            self.table.device.write_sectors(&self.buf, self.sector, 1)?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::format_disk;
    use crate::END_OF_CLUSTER;

    fn table() -> FatTable {
        let device = format_disk(131072);
        let vol = Volume::detect(&device).unwrap();
        FatTable::new(device, &vol)
    }

    /// Reference walk: one `next` per step.
    fn slow_tail(fat: &FatTable, start: u32) -> u32 {
        let mut clu = start;
        loop {
            let next = fat.next(clu).unwrap();
            if is_end_of_chain(next) {
                return clu;
            }
            clu = next;
        }
    }

    #[test]
    fn set_then_next_round_trip() {
        let fat = table();
        fat.set(5, 6).unwrap();
        assert_eq!(fat.next(5).unwrap(), 6);
        fat.set(5, END_OF_CLUSTER).unwrap();
        assert_eq!(fat.next(5).unwrap(), END_OF_CLUSTER);
    }

    #[test]
    fn set_preserves_reserved_high_bits() {
        let fat = table();
        // Poke the raw slot to plant reserved bits, then overwrite.
        let (sector, offset) = fat.entry_location(9);
        let mut buf = [0u8; SECTOR_SIZE];
        fat.device.read_sectors(&mut buf, sector, 1).unwrap();
        write_le_u32(&mut buf[offset..], 0x3000_0000 | 0x0A);
        fat.device.write_sectors(&buf, sector, 1).unwrap();

        fat.set(9, END_OF_CLUSTER).unwrap();
        fat.device.read_sectors(&mut buf, sector, 1).unwrap();
        assert_eq!(read_le_u32(&buf[offset..]), 0x3FFF_FFFF);
        assert_eq!(fat.next(9).unwrap(), END_OF_CLUSTER);
    }

    #[test]
    fn fast_walk_matches_reference_walk() {
        let fat = table();
        // A chain that is contiguous, then jumps across a FAT sector
        // boundary, then comes back: 10..=20 -> 300 -> 301 -> 21 -> EOC.
        for c in 10..20 {
            fat.set(c, c + 1).unwrap();
        }
        fat.set(20, 300).unwrap();
        fat.set(300, 301).unwrap();
        fat.set(301, 21).unwrap();
        fat.set(21, END_OF_CLUSTER).unwrap();

        assert_eq!(fat.follow_chain_fast(10).unwrap(), 21);
        assert_eq!(fat.follow_chain_fast(10).unwrap(), slow_tail(&fat, 10));
        // Entering mid-chain finds the same tail.
        assert_eq!(fat.follow_chain_fast(300).unwrap(), 21);
    }

    #[test]
    fn fast_walk_detects_corruption() {
        let fat = table();
        fat.set(40, 41).unwrap();
        fat.set(41, FREE_CLUSTER).unwrap();
        assert_eq!(fat.follow_chain_fast(40).unwrap_err(), Error::CorruptChain);
        assert_eq!(fat.follow_chain_fast(0).unwrap_err(), Error::CorruptChain);
    }

    #[test]
    fn destroy_chain_frees_every_entry() {
        let fat = table();
        fat.set(50, 51).unwrap();
        fat.set(51, 200).unwrap();
        fat.set(200, END_OF_CLUSTER).unwrap();
        assert_eq!(fat.destroy_chain(50).unwrap(), 3);
        assert_eq!(fat.next(50).unwrap(), FREE_CLUSTER);
        assert_eq!(fat.next(51).unwrap(), FREE_CLUSTER);
        assert_eq!(fat.next(200).unwrap(), FREE_CLUSTER);
    }

    #[test]
    fn free_search_prefers_lowest_and_wraps() {
        let fat = table();
        // Fresh volume: root owns cluster 2, cluster 3 is first free.
        assert_eq!(fat.find_first_free().unwrap(), Some(3));
        fat.set(3, END_OF_CLUSTER).unwrap();
        fat.set(4, END_OF_CLUSTER).unwrap();
        assert_eq!(fat.find_first_free().unwrap(), Some(5));
        assert_eq!(fat.find_next_free(3).unwrap(), Some(5));
        // Wrap: nothing after max_cluster, search resumes from 2.
        assert_eq!(fat.find_next_free(fat.max_cluster()).unwrap(), Some(5));
    }

    #[test]
    fn batch_coalesces_same_sector_writes() {
        let fat = table();
        let mut batch = fat.batch();
        for c in 60..70 {
            batch.set(c, c + 1).unwrap();
        }
        batch.set(70, END_OF_CLUSTER).unwrap();
        batch.flush().unwrap();
        assert_eq!(fat.follow_chain_fast(60).unwrap(), 70);
    }
}
