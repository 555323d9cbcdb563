//! File handles and sequential reading.
//!
//! A [`FileHandle`] carries the read cursor (current cluster plus byte
//! offset within it), the append anchors (tail cluster and its free
//! byte count), and the fingerprint of the file's directory entry so
//! size updates land back in the right slot. Handles are plain data;
//! all I/O goes through the owning [`FileSystem`].

use crate::fs::FileSystem;
use crate::open_table::FdiKey;
use crate::{is_end_of_chain, Error, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct FileHandle {
    /// 0 while the file has no clusters.
    pub(crate) first_cluster: u32,
    pub(crate) cur_read_cluster: u32,
    pub(crate) read_offset_in_cluster: u32,
    pub(crate) file_size: u32,
    pub(crate) remaining_to_read: u32,
    /// 0 while the file has no clusters.
    pub(crate) tail_cluster: u32,
    /// Unwritten bytes in the tail cluster.
    pub(crate) tail_free: u32,
    pub(crate) fdi_sector: u32,
    pub(crate) fdi_offset: usize,
    pub(crate) state: HandleState,
}

/// Free bytes left in the tail cluster of a file of `size` bytes;
/// a size landing exactly on a cluster boundary leaves none.
pub(crate) fn tail_free_bytes(size: u32, cluster_size: u32) -> u32 {
    (cluster_size - size % cluster_size) % cluster_size
}

impl FileHandle {
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    pub fn remaining(&self) -> u32 {
        self.remaining_to_read
    }

    pub(crate) fn key(&self) -> FdiKey {
        FdiKey {
            sector: self.fdi_sector,
            offset: self.fdi_offset as u16,
        }
    }

    pub(crate) fn reset_closed(&mut self) {
        *self = FileHandle {
            first_cluster: 0,
            cur_read_cluster: 0,
            read_offset_in_cluster: 0,
            file_size: 0,
            remaining_to_read: 0,
            tail_cluster: 0,
            tail_free: 0,
            fdi_sector: 0,
            fdi_offset: 0,
            state: HandleState::Closed,
        };
    }
}

impl FileSystem {
    /// Sequential read from the handle's cursor. Returns the number of
    /// bytes copied, at most `buf.len()` and never past end of file.
    pub fn read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, Error> {
        if handle.state != HandleState::Open {
            return Err(Error::Closed);
        }
        let total = buf.len().min(handle.remaining_to_read as usize);
        if total == 0 {
            return Ok(0);
        }

        let csz = self.volume.cluster_size() as u32;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut copied = 0usize;
        while copied < total {
            if handle.read_offset_in_cluster == csz {
                let next = self.fat.next(handle.cur_read_cluster)?;
                if is_end_of_chain(next) {
                    break;
                }
                if next < 2 {
                    return Err(Error::CorruptChain);
                }
                handle.cur_read_cluster = next;
                handle.read_offset_in_cluster = 0;
            }
            let sector = self.volume.sector_of_cluster(handle.cur_read_cluster)
                + handle.read_offset_in_cluster / SECTOR_SIZE as u32;
            let in_sector = handle.read_offset_in_cluster as usize % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - in_sector).min(total - copied);

            self.read_sector(sector, &mut sector_buf)?;
            buf[copied..copied + chunk].copy_from_slice(&sector_buf[in_sector..in_sector + chunk]);

            copied += chunk;
            handle.read_offset_in_cluster += chunk as u32;
        }
        handle.remaining_to_read -= copied as u32;
        Ok(copied)
    }

    /// Put the read cursor back at offset 0.
    pub fn rewind(&self, handle: &mut FileHandle) -> Result<(), Error> {
        if handle.state != HandleState::Open {
            return Err(Error::Closed);
        }
        handle.cur_read_cluster = handle.first_cluster;
        handle.read_offset_in_cluster = 0;
        handle.remaining_to_read = handle.file_size;
        Ok(())
    }
}
