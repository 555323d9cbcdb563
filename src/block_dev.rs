//! Block device interface.
//!
//! The driver's only I/O boundary. Implementations translate the fixed
//! 512-byte sector index space onto whatever the hardware offers; a NOR
//! flash with 4 KiB physical sectors, for example, maps eight logical
//! sectors onto each physical one.
//!
//! Atomicity is per-sector at best. A failed call leaves on-disk state
//! as whatever the device committed before the failure; the driver
//! aborts the current operation and surfaces the error.

use core::any::Any;

use crate::SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    ReadError,
    WriteError,
    EraseError,
}

pub trait BlockDevice: Send + Sync + Any {
    /// Read `sector_cnt` contiguous sectors starting at `start_sector`
    /// into `buf`. `buf.len()` must be `sector_cnt * 512`.
    /// A count of 0 is a no-op.
    fn read_sectors(
        &self,
        buf: &mut [u8],
        start_sector: u32,
        sector_cnt: usize,
    ) -> Result<(), DeviceError>;

    /// Write `sector_cnt` contiguous sectors starting at `start_sector`
    /// from `buf`. `buf.len()` must be `sector_cnt * 512`.
    /// A count of 0 is a no-op.
    fn write_sectors(
        &self,
        buf: &[u8],
        start_sector: u32,
        sector_cnt: usize,
    ) -> Result<(), DeviceError>;

    /// Fill `sector_cnt` sectors with zeroes. Only the formatter calls
    /// this. Devices with a real erase primitive should override the
    /// default, which emulates erase with zero writes.
    fn erase_sectors(&self, start_sector: u32, sector_cnt: usize) -> Result<(), DeviceError> {
        let zero = [0u8; SECTOR_SIZE];
        for i in 0..sector_cnt {
            self.write_sectors(&zero, start_sector + i as u32, 1)?;
        }
        Ok(())
    }
}
