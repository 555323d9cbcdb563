//! In-memory block device and image helpers for the test suite.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block_dev::{BlockDevice, DeviceError};
use crate::SECTOR_SIZE;

/// A `Vec`-backed disk. Out-of-range access fails like hardware would.
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(total_sectors: u32) -> Arc<dyn BlockDevice> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; total_sectors as usize * SECTOR_SIZE]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn read_sectors(
        &self,
        buf: &mut [u8],
        start_sector: u32,
        sector_cnt: usize,
    ) -> Result<(), DeviceError> {
        if sector_cnt == 0 {
            return Ok(());
        }
        let data = self.data.lock();
        let lo = start_sector as usize * SECTOR_SIZE;
        let hi = lo + sector_cnt * SECTOR_SIZE;
        if hi > data.len() || buf.len() < sector_cnt * SECTOR_SIZE {
            return Err(DeviceError::ReadError);
        }
        buf[..sector_cnt * SECTOR_SIZE].copy_from_slice(&data[lo..hi]);
        Ok(())
    }

    fn write_sectors(
        &self,
        buf: &[u8],
        start_sector: u32,
        sector_cnt: usize,
    ) -> Result<(), DeviceError> {
        if sector_cnt == 0 {
            return Ok(());
        }
        let mut data = self.data.lock();
        let lo = start_sector as usize * SECTOR_SIZE;
        let hi = lo + sector_cnt * SECTOR_SIZE;
        if hi > data.len() || buf.len() < sector_cnt * SECTOR_SIZE {
            return Err(DeviceError::WriteError);
        }
        data[lo..hi].copy_from_slice(&buf[..sector_cnt * SECTOR_SIZE]);
        Ok(())
    }

    fn erase_sectors(&self, start_sector: u32, sector_cnt: usize) -> Result<(), DeviceError> {
        let mut data = self.data.lock();
        let lo = start_sector as usize * SECTOR_SIZE;
        let hi = lo + sector_cnt * SECTOR_SIZE;
        if hi > data.len() {
            return Err(DeviceError::EraseError);
        }
        data[lo..hi].fill(0);
        Ok(())
    }
}

/// A freshly formatted in-memory disk of `total_sectors` sectors.
pub fn format_disk(total_sectors: u32) -> Arc<dyn BlockDevice> {
    let device = MemDisk::new(total_sectors);
    crate::mkfs::format(&device, total_sectors, None).unwrap();
    device
}

/// Format and mount a 64 MiB volume.
pub fn fresh_fs() -> crate::fs::FileSystem {
    let device = format_disk(131072);
    crate::fs::FileSystem::mount(device).unwrap()
}
