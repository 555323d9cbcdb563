//! Disk formatter.
//!
//! Lays down a single-partition (super-floppy) FAT32 volume: DBR at
//! sector 0, FSINFO at sector 1, two FATs, and a root directory holding
//! one volume-label entry. The FAT region is erased and seeded with the
//! canonical first entries: the media byte in entry 0, an end mark in
//! entry 1, and an end-of-chain for the root cluster.
//!
//! The cluster size defaults to the conventional total-size table
//! (512 B up to 64 MiB, doubling per bracket up to 32 KiB clusters at
//! 2 TiB); pass an explicit sectors-per-cluster to override, e.g. for
//! the small test images the recommendation table would reject.

use alloc::sync::Arc;

use log::info;

use crate::block_dev::BlockDevice;
use crate::bpb::FsInfo;
use crate::entry::DirEntry;
use crate::{write_le_u16, write_le_u32, Error, END_OF_CLUSTER, SECTOR_SIZE};

const RESERVED_SECTORS: u16 = 32;
const NUM_FATS: u32 = 2;
const VOLUME_LABEL: &[u8; 11] = b"NO NAME    ";

/// Conventional sectors-per-cluster by volume size. `None` below
/// 16 MiB: too small for FAT32.
pub fn recommended_sectors_per_cluster(total_sectors: u32) -> Option<u8> {
    match total_sectors {
        0..=32767 => None,
        32768..=131071 => Some(1),
        131072..=262143 => Some(2),
        262144..=524287 => Some(4),
        524288..=16777215 => Some(8),
        16777216..=33554431 => Some(16),
        33554432..=67108863 => Some(32),
        _ => Some(64),
    }
}

/// Sectors per FAT copy such that the two FATs map every data cluster:
/// each FAT sector covers 128 clusters of `spc` sectors each.
fn fat_size_sectors(total_sectors: u32, spc: u32) -> u32 {
    let numer = total_sectors as u64 - RESERVED_SECTORS as u64 + 2 * spc as u64;
    let denom = 128 * spc as u64 + NUM_FATS as u64;
    ((numer + denom - 1) / denom) as u32
}

/// Format `device` as one FAT32 volume of `total_sectors` sectors.
/// `sectors_per_cluster` of `None` picks the recommended value.
pub fn format(
    device: &Arc<dyn BlockDevice>,
    total_sectors: u32,
    sectors_per_cluster: Option<u8>,
) -> Result<(), Error> {
    let spc = match sectors_per_cluster {
        Some(s) if s != 0 && s.is_power_of_two() && s <= 128 => s as u32,
        Some(_) => return Err(Error::UnsupportedSize),
        None => recommended_sectors_per_cluster(total_sectors).ok_or(Error::UnsupportedSize)? as u32,
    };
    if total_sectors <= RESERVED_SECTORS as u32 + spc {
        return Err(Error::UnsupportedSize);
    }

    let fat_sz = fat_size_sectors(total_sectors, spc);
    let fat_start = RESERVED_SECTORS as u32;
    let first_data = fat_start + NUM_FATS * fat_sz;
    if first_data >= total_sectors {
        return Err(Error::UnsupportedSize);
    }
    let data_clusters = (total_sectors - first_data) / spc;
    if data_clusters == 0 {
        return Err(Error::UnsupportedSize);
    }

    // Boot sector.
    let mut sector = [0u8; SECTOR_SIZE];
    sector[0] = 0xEB;
    sector[1] = 0x58;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"MSDOS5.0");
    write_le_u16(&mut sector[11..], SECTOR_SIZE as u16);
    sector[13] = spc as u8;
    write_le_u16(&mut sector[14..], RESERVED_SECTORS);
    sector[16] = NUM_FATS as u8;
    sector[21] = 0xF8;
    write_le_u16(&mut sector[24..], 63); // sectors per track
    write_le_u16(&mut sector[26..], 255); // heads
    write_le_u32(&mut sector[32..], total_sectors);
    write_le_u32(&mut sector[36..], fat_sz);
    write_le_u32(&mut sector[44..], 2); // root cluster
    write_le_u16(&mut sector[48..], 1); // FSINFO sector
    write_le_u16(&mut sector[50..], 6); // backup boot sector
    sector[64] = 0x80; // drive number
    sector[66] = 0x29; // extended boot signature
    write_le_u32(&mut sector[67..], 0xB01E_EB1F); // volume serial
    sector[71..82].copy_from_slice(VOLUME_LABEL);
    sector[82..90].copy_from_slice(b"FAT32   ");
    sector[510] = 0x55;
    sector[511] = 0xAA;
    device.write_sectors(&sector, 0, 1)?;

    // Both FAT copies: erased, then the canonical first sector.
    device.erase_sectors(fat_start, (NUM_FATS * fat_sz) as usize)?;
    sector.fill(0);
    write_le_u32(&mut sector[0..], 0x0FFF_FFF8); // media byte entry
    write_le_u32(&mut sector[4..], 0xFFFF_FFFF);
    write_le_u32(&mut sector[8..], END_OF_CLUSTER); // root cluster
    device.write_sectors(&sector, fat_start, 1)?;
    device.write_sectors(&sector, fat_start + fat_sz, 1)?;

    // Root cluster: zeroed, volume label in the first slot.
    device.erase_sectors(first_data, spc as usize)?;
    sector.fill(0);
    let label = DirEntry::volume_label(*VOLUME_LABEL);
    sector[..label.as_bytes().len()].copy_from_slice(label.as_bytes());
    device.write_sectors(&sector, first_data, 1)?;

    // FSINFO: everything free except the root cluster; the next free
    // cluster is the one right after it.
    let fsinfo = FsInfo {
        free_count: data_clusters - 1,
        next_free: 3,
    };
    fsinfo.write_fresh(&mut sector);
    device.write_sectors(&sector, 1, 1)?;

    info!(
        "fat32: formatted {} sectors, {} sectors/cluster, {} data clusters",
        total_sectors, spc, data_clusters
    );
    Ok(())
}
