//! The append writer.
//!
//! Appending runs in two phases. First the planner builds a compressed
//! chain of free clusters in memory: starting at the volume's next-free
//! hint it collects one candidate per needed cluster, merging
//! consecutive cluster numbers into [`ClusterRun`]s, consulting the
//! free-cluster bitmap between picks and falling back to a FAT scan
//! (with a bitmap refill) when the bitmap window runs dry. A planning
//! failure discards the runs, restores the hint and leaves the disk
//! untouched.
//!
//! Then the payload is written into the tail cluster's free bytes and
//! the planned runs (whole sectors in bulk, the final partial sector
//! padded through a scratch buffer), and only afterwards is the FAT
//! stitched: for a previously empty file the FDI's first-cluster field
//! is committed first, then each run is linked behind its predecessor
//! with writes batched per FAT sector, and the final cluster receives
//! the end-of-chain mark.
//!
//! The stitch order bounds the damage of power loss: payload clusters
//! that were written but not yet linked are leaked free clusters, never
//! corruption, and once the links complete the file is intact even if
//! the closing FSINFO update is lost.

use alloc::vec::Vec;

use log::trace;

use crate::file::{tail_free_bytes, FileHandle, HandleState};
use crate::fs::FileSystem;
use crate::{Error, END_OF_CLUSTER, FILE_MAX_SIZE, NO_FREE_HINT, SECTOR_SIZE};

/// An inclusive run of consecutive cluster numbers in a planned
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRun {
    pub start: u32,
    pub end: u32,
}

impl ClusterRun {
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Append `clu` to the planned chain, extending the last run when the
/// numbers are consecutive.
pub(crate) fn push_cluster(runs: &mut Vec<ClusterRun>, clu: u32) {
    if let Some(last) = runs.last_mut() {
        if clu == last.end + 1 {
            last.end = clu;
            return;
        }
    }
    runs.push(ClusterRun {
        start: clu,
        end: clu,
    });
}

/// Clusters an append of `len` bytes needs beyond the existing chain.
pub(crate) fn clusters_to_allocate(
    file_size: u32,
    tail_free: u32,
    len: u32,
    cluster_size: u32,
) -> u32 {
    let csz = cluster_size as u64;
    if file_size == 0 {
        ((len as u64 + csz - 1) / csz) as u32
    } else if len <= tail_free {
        0
    } else {
        (((len - tail_free) as u64 + csz - 1) / csz) as u32
    }
}

impl FileSystem {
    /// Append `buf` to the open file. Returns the number of bytes
    /// written, which is less than `buf.len()` only when the 4 GiB - 1
    /// file-size ceiling truncates the request.
    pub fn write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize, Error> {
        if handle.state != HandleState::Open {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Err(Error::ZeroLength);
        }

        let csz = self.volume.cluster_size() as u32;
        let headroom = FILE_MAX_SIZE - handle.file_size;
        if headroom == 0 {
            return Err(Error::OutOfSpace);
        }
        let len = (buf.len() as u64).min(headroom as u64) as u32;
        let data = &buf[..len as usize];

        let to_alloc = clusters_to_allocate(handle.file_size, handle.tail_free, len, csz);
        trace!(
            "fat32: append {} bytes, size {}, tail_free {}, allocating {}",
            len,
            handle.file_size,
            handle.tail_free,
            to_alloc
        );

        let runs = if to_alloc > 0 {
            self.plan_runs(to_alloc)?
        } else {
            Vec::new()
        };

        let was_empty = handle.file_size == 0;
        let old_tail = handle.tail_cluster;

        if was_empty {
            self.write_runs_payload(&runs, data)?;
        } else if to_alloc == 0 {
            self.write_tail_payload(handle, data)?;
        } else {
            let fill = handle.tail_free as usize;
            if fill > 0 {
                self.write_tail_payload(handle, &data[..fill])?;
            }
            self.write_runs_payload(&runs, &data[fill..])?;
        }

        if to_alloc > 0 {
            self.stitch_chain(handle, runs)?;
        }

        // Commit: recompute the tail through the fast walk (which also
        // verifies the fresh links), then the FDI size, then FSINFO.
        let walk_start = if was_empty {
            handle.first_cluster
        } else {
            old_tail
        };
        let new_size = handle.file_size + len;
        handle.tail_cluster = self.fat.follow_chain_fast(walk_start)?;
        handle.file_size = new_size;
        handle.remaining_to_read += len;
        handle.tail_free = tail_free_bytes(new_size, csz);
        self.patch_fdi(handle.fdi_sector, handle.fdi_offset, |e| {
            e.set_file_size(new_size)
        })?;

        if to_alloc > 0 {
            self.volume.free_cluster_count -= to_alloc;
            self.volume.persist_fsinfo(&self.device)?;
            self.refresh_bitmap()?;
        }
        self.tail_cache.record(handle.key(), handle.tail_cluster);
        Ok(len as usize)
    }

    /// Phase one: collect `count` free clusters into runs, starting at
    /// the next-free hint. On failure every planned node is dropped,
    /// the hint is restored and the bitmap re-aimed; nothing on disk
    /// has changed.
    pub(crate) fn plan_runs(&mut self, count: u32) -> Result<Vec<ClusterRun>, Error> {
        debug_assert!(count > 0);
        if self.volume.free_cluster_count < count {
            return Err(Error::OutOfSpace);
        }
        let hint_backup = self.volume.next_free_cluster;
        let mut clu = self.valid_hint()?;
        let mut runs: Vec<ClusterRun> = Vec::new();
        for i in 0..count {
            push_cluster(&mut runs, clu);
            if i + 1 == count {
                // Move the hint past the planned chain. The volume
                // being exactly full now is fine; the hint just goes
                // empty.
                self.volume.next_free_cluster =
                    self.advance_free(clu)?.unwrap_or(NO_FREE_HINT);
                break;
            }
            match self.advance_free(clu)? {
                Some(next) => clu = next,
                None => {
                    self.volume.next_free_cluster = hint_backup;
                    self.refresh_bitmap()?;
                    return Err(Error::OutOfSpace);
                }
            }
        }
        Ok(runs)
    }

    /// Write into the free bytes of the tail cluster. The first sector
    /// is spliced read-modify-write when the append starts mid-sector;
    /// whole sectors go out in bulk; a trailing partial sector is
    /// zero-padded in scratch.
    fn write_tail_payload(&self, handle: &FileHandle, data: &[u8]) -> Result<(), Error> {
        debug_assert!(data.len() <= handle.tail_free as usize);
        let csz = self.volume.cluster_size();
        let used = csz - handle.tail_free as usize;
        let base = self.volume.sector_of_cluster(handle.tail_cluster);
        let mut off_sec = (used / SECTOR_SIZE) as u32;
        let off_byte = used % SECTOR_SIZE;
        let total = data.len();
        let mut written = 0usize;
        let mut sector_buf = [0u8; SECTOR_SIZE];

        if off_byte != 0 {
            let chunk = (SECTOR_SIZE - off_byte).min(total);
            self.read_sector(base + off_sec, &mut sector_buf)?;
            sector_buf[off_byte..off_byte + chunk].copy_from_slice(&data[..chunk]);
            self.write_sector(base + off_sec, &sector_buf)?;
            written += chunk;
            off_sec += 1;
        }

        let whole = (total - written) / SECTOR_SIZE;
        if whole > 0 {
            self.device.write_sectors(
                &data[written..written + whole * SECTOR_SIZE],
                base + off_sec,
                whole,
            )?;
            written += whole * SECTOR_SIZE;
            off_sec += whole as u32;
        }

        let rem = total - written;
        if rem > 0 {
            sector_buf.fill(0);
            sector_buf[..rem].copy_from_slice(&data[written..]);
            self.write_sector(base + off_sec, &sector_buf)?;
        }
        Ok(())
    }

    /// Write payload across the planned runs in order.
    fn write_runs_payload(&self, runs: &[ClusterRun], data: &[u8]) -> Result<(), Error> {
        let spc = self.volume.sectors_per_cluster as usize;
        let total = data.len();
        let mut written = 0usize;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for run in runs {
            if written == total {
                break;
            }
            let base = self.volume.sector_of_cluster(run.start);
            let span = run.len() as usize * spc * SECTOR_SIZE;
            let chunk = span.min(total - written);
            let whole = chunk / SECTOR_SIZE;
            if whole > 0 {
                self.device.write_sectors(
                    &data[written..written + whole * SECTOR_SIZE],
                    base,
                    whole,
                )?;
            }
            let rem = chunk % SECTOR_SIZE;
            if rem > 0 {
                sector_buf.fill(0);
                sector_buf[..rem]
                    .copy_from_slice(&data[written + whole * SECTOR_SIZE..written + chunk]);
                self.write_sector(base + whole as u32, &sector_buf)?;
            }
            written += chunk;
        }
        debug_assert_eq!(written, total);
        Ok(())
    }

    /// Phase two: link the planned runs into the on-disk FAT.
    ///
    /// For a previously empty file the FDI's first-cluster field is
    /// rewritten first, committing the file's existence to its first
    /// payload cluster, and that cluster is consumed from the head of
    /// the chain. Then predecessor -> run.start and the intra-run links
    /// are written, batched per FAT sector, and the final cluster gets
    /// the end-of-chain mark.
    fn stitch_chain(&mut self, handle: &mut FileHandle, runs: Vec<ClusterRun>) -> Result<(), Error> {
        let mut runs = runs;
        let mut pred = if handle.file_size == 0 {
            let boot = runs[0].start;
            self.patch_fdi(handle.fdi_sector, handle.fdi_offset, |e| {
                e.set_first_cluster(boot)
            })?;
            handle.first_cluster = boot;
            handle.cur_read_cluster = boot;
            if runs[0].start == runs[0].end {
                runs.remove(0);
            } else {
                runs[0].start += 1;
            }
            boot
        } else {
            handle.tail_cluster
        };

        let mut batch = self.fat.batch();
        for run in &runs {
            batch.set(pred, run.start)?;
            let mut c = run.start;
            while c < run.end {
                batch.set(c, c + 1)?;
                c += 1;
            }
            pred = run.end;
        }
        batch.set(pred, END_OF_CLUSTER)?;
        batch.flush()?;
        Ok(())
    }
}
