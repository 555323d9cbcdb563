//! Per-partition volume state.
//!
//! [`Volume`] owns everything the driver knows about one mounted
//! partition: the geometry derived from its DBR, the FSINFO mirror
//! (free-cluster count and next-free hint), and the current working
//! directory cluster. There is no process-wide state; two mounted
//! volumes are fully independent.
//!
//! Given any valid data cluster number N, the first sector of that
//! cluster is `(N - 2) * sectors_per_cluster + first_data_sector`, and
//! its FAT entry lives in sector `fat1_start + (N * 4) / 512` at byte
//! offset `(N * 4) % 512`.

use alloc::sync::Arc;

use log::info;

use crate::block_dev::BlockDevice;
use crate::bpb::{self, BiosParameterBlock, FsInfo};
use crate::{Error, FAT_ENTRY_SIZE, ROOT_CLUSTER, SECTOR_SIZE};

#[derive(Debug, Clone)]
pub struct Volume {
    pub(crate) dbr_start_sector: u32,
    pub(crate) fat1_start_sector: u32,
    pub(crate) first_data_sector: u32,
    pub(crate) sectors_per_cluster: u32,
    pub(crate) fat_size_sectors: u32,
    pub(crate) num_fats: u32,
    pub(crate) total_sectors: u32,
    pub(crate) fsinfo_sector: u32,
    /// Highest valid data cluster number: data_cluster_cnt + 1.
    pub(crate) max_cluster: u32,

    /// FSINFO mirror. 0xFFFFFFFF means unknown until recomputed.
    pub(crate) free_cluster_count: u32,
    pub(crate) next_free_cluster: u32,

    /// Current working directory, moved only by explicit chdir calls.
    pub(crate) cwd: u32,
}

impl Volume {
    /// Parse absolute sector 0 and the partition's DBR + FSINFO.
    ///
    /// If sector 0 begins with the FAT32 jump instruction it is itself
    /// the DBR (super-floppy layout, no partition table); otherwise it
    /// is an MBR, all four slots are parsed, and partition 0 is driven.
    pub fn detect(device: &Arc<dyn BlockDevice>) -> Result<Self, Error> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sectors(&mut sector, 0, 1)?;

        let dbr_start = if bpb::sector0_is_dbr(&sector) {
            0
        } else {
            let parts = bpb::partition_start_sectors(&sector);
            let start = parts[0];
            if start == 0 {
                return Err(Error::InvalidVolume);
            }
            device.read_sectors(&mut sector, start, 1)?;
            start
        };

        let dbr = BiosParameterBlock::parse(&sector)?;
        if !dbr.is_valid() {
            return Err(Error::InvalidVolume);
        }

        let fat1 = dbr_start + dbr.reserved_sector_cnt();
        let first_data = fat1 + dbr.fat_cnt() * dbr.sectors_per_fat();
        let data_sectors = dbr
            .total_sector_cnt()
            .saturating_sub(dbr.reserved_sector_cnt() + dbr.fat_cnt() * dbr.sectors_per_fat());
        let data_clusters = data_sectors / dbr.sectors_per_cluster();
        if data_clusters == 0 {
            return Err(Error::InvalidVolume);
        }

        let fsinfo_sector = dbr_start + dbr.fsinfo_sector();
        device.read_sectors(&mut sector, fsinfo_sector, 1)?;
        let fsinfo = FsInfo::parse(&sector)?;

        info!(
            "fat32: volume at sector {}, {} sectors/cluster, {} data clusters",
            dbr_start,
            dbr.sectors_per_cluster(),
            data_clusters
        );

        Ok(Self {
            dbr_start_sector: dbr_start,
            fat1_start_sector: fat1,
            first_data_sector: first_data,
            sectors_per_cluster: dbr.sectors_per_cluster(),
            fat_size_sectors: dbr.sectors_per_fat(),
            num_fats: dbr.fat_cnt(),
            total_sectors: dbr.total_sector_cnt(),
            fsinfo_sector,
            max_cluster: data_clusters + 1,
            free_cluster_count: fsinfo.free_count,
            next_free_cluster: fsinfo.next_free,
            cwd: ROOT_CLUSTER,
        })
    }

    /// First sector of a data cluster.
    pub fn sector_of_cluster(&self, cluster: u32) -> u32 {
        debug_assert!(cluster >= 2);
        (cluster - 2) * self.sectors_per_cluster + self.first_data_sector
    }

    pub fn fat_sector_of_cluster(&self, cluster: u32) -> u32 {
        self.fat1_start_sector + cluster * FAT_ENTRY_SIZE as u32 / SECTOR_SIZE as u32
    }

    pub fn fat_offset_in_sector(&self, cluster: u32) -> usize {
        (cluster as usize * FAT_ENTRY_SIZE) % SECTOR_SIZE
    }

    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    pub fn data_cluster_cnt(&self) -> u32 {
        self.max_cluster - 1
    }

    pub fn free_cluster_cnt(&self) -> u32 {
        self.free_cluster_count
    }

    pub fn current_dir(&self) -> u32 {
        self.cwd
    }

    /// Write the FSINFO mirror back to disk, preserving everything but
    /// the two bookkeeping fields.
    pub fn persist_fsinfo(&self, device: &Arc<dyn BlockDevice>) -> Result<(), Error> {
        let mut sector = [0u8; SECTOR_SIZE];
        device.read_sectors(&mut sector, self.fsinfo_sector, 1)?;
        let fsinfo = FsInfo {
            free_count: self.free_cluster_count,
            next_free: self.next_free_cluster,
        };
        fsinfo.apply_to(&mut sector);
        device.write_sectors(&sector, self.fsinfo_sector, 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{format_disk, MemDisk};
    use crate::NO_FREE_HINT;

    #[test]
    fn detect_formatted_volume() {
        let device = format_disk(131072);
        let vol = Volume::detect(&device).unwrap();
        assert_eq!(vol.dbr_start_sector, 0);
        assert_eq!(vol.fat1_start_sector, 32);
        assert_eq!(
            vol.first_data_sector,
            32 + vol.num_fats * vol.fat_size_sectors
        );
        assert_eq!(vol.cwd, ROOT_CLUSTER);
        // Root directory occupies cluster 2.
        assert_eq!(vol.free_cluster_count, vol.data_cluster_cnt() - 1);
        assert_ne!(vol.next_free_cluster, NO_FREE_HINT);
    }

    #[test]
    fn cluster_maps() {
        let device = format_disk(131072);
        let vol = Volume::detect(&device).unwrap();
        assert_eq!(vol.sector_of_cluster(2), vol.first_data_sector);
        assert_eq!(
            vol.sector_of_cluster(3),
            vol.first_data_sector + vol.sectors_per_cluster
        );
        // Entries 0..127 share the first FAT sector.
        assert_eq!(vol.fat_sector_of_cluster(2), vol.fat1_start_sector);
        assert_eq!(vol.fat_sector_of_cluster(127), vol.fat1_start_sector);
        assert_eq!(vol.fat_sector_of_cluster(128), vol.fat1_start_sector + 1);
        assert_eq!(vol.fat_offset_in_sector(2), 8);
        assert_eq!(vol.fat_offset_in_sector(128), 0);
    }

    #[test]
    fn reject_blank_disk() {
        let device: Arc<dyn BlockDevice> = MemDisk::new(1024);
        assert_eq!(Volume::detect(&device).unwrap_err(), Error::InvalidVolume);
    }

    #[test]
    fn mbr_with_empty_slot_zero_is_rejected() {
        // A populated slot 1 does not substitute for partition 0.
        let device: Arc<dyn BlockDevice> = MemDisk::new(1024);
        let mut sector = [0u8; SECTOR_SIZE];
        let slot1 = crate::MBR_PARTITION_TABLE_OFFSET + crate::MBR_PARTITION_ENTRY_SIZE;
        sector[slot1 + 8..slot1 + 12].copy_from_slice(&512u32.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        device.write_sectors(&sector, 0, 1).unwrap();
        assert_eq!(Volume::detect(&device).unwrap_err(), Error::InvalidVolume);
    }

    #[test]
    fn fsinfo_persist_round_trip() {
        let device = format_disk(131072);
        let mut vol = Volume::detect(&device).unwrap();
        vol.free_cluster_count -= 3;
        vol.next_free_cluster = 9;
        vol.persist_fsinfo(&device).unwrap();
        let again = Volume::detect(&device).unwrap();
        assert_eq!(again.free_cluster_count, vol.free_cluster_count);
        assert_eq!(again.next_free_cluster, 9);
    }
}
