//! The mounted file system: one [`FileSystem`] per volume, plus a
//! process-wide registry of volumes mounted under drive names.
//!
//! A `FileSystem` owns every piece of per-volume state (geometry,
//! FSINFO mirror, FAT accessor, free-cluster bitmap, open table, tail
//! cache) and holds no locks of its own. Operations on one volume are
//! strictly sequential; callers that share a volume across contexts
//! wrap it in the `Arc<RwLock<_>>` that [`mount_named`] hands out.
//!
//! Path arguments follow POSIX form with `/` (or `\`) separators. A
//! leading separator starts at the root directory, anything else at the
//! volume's current working directory.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use log::info;
use spin::{Mutex, RwLock};

use crate::bitmap::FreeClusterIndex;
use crate::block_dev::BlockDevice;
use crate::dir::SlotSearch;
use crate::entry::{short_name_from_str, DirEntry};
use crate::fat::FatTable;
use crate::file::{tail_free_bytes, FileHandle, HandleState};
use crate::open_table::{FdiKey, OpenTable};
use crate::path::split_path;
use crate::tail_cache::TailCache;
use crate::volume::Volume;
use crate::{
    Error, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, END_OF_CLUSTER, NO_FREE_HINT, SECTOR_SIZE,
};

pub struct FileSystem {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) volume: Volume,
    pub(crate) fat: FatTable,
    pub(crate) bitmap: FreeClusterIndex,
    pub(crate) open_table: OpenTable,
    pub(crate) tail_cache: TailCache,
}

impl core::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileSystem")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// Attach a block device: parse its metadata, recover the free
    /// count if FSINFO reports it unknown, and prime the free-cluster
    /// hint and bitmap.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self, Error> {
        let mut volume = Volume::detect(&device)?;
        let fat = FatTable::new(Arc::clone(&device), &volume);

        if volume.free_cluster_count == NO_FREE_HINT {
            volume.free_cluster_count = fat.count_free()?;
        }
        volume.next_free_cluster = fat.find_first_free()?.unwrap_or(NO_FREE_HINT);

        let mut bitmap = FreeClusterIndex::new(volume.fat1_start_sector);
        if volume.next_free_cluster != NO_FREE_HINT {
            bitmap.fill(&device, volume.fat_sector_of_cluster(volume.next_free_cluster))?;
        }

        Ok(Self {
            device,
            volume,
            fat,
            bitmap,
            open_table: OpenTable::new(),
            tail_cache: TailCache::new(),
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub(crate) fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        self.device.read_sectors(buf, sector, 1)?;
        Ok(())
    }

    pub(crate) fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        self.device.write_sectors(buf, sector, 1)?;
        Ok(())
    }

    /// Read-modify-write one directory entry in place.
    pub(crate) fn patch_fdi(
        &self,
        sector: u32,
        offset: usize,
        f: impl FnOnce(&mut DirEntry),
    ) -> Result<(), Error> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sector(sector, &mut buf)?;
        let mut entry = DirEntry::from_slice(&buf[offset..]);
        f(&mut entry);
        buf[offset..offset + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
        self.write_sector(sector, &buf)
    }

    /// Zero-fill a data cluster.
    pub(crate) fn zero_cluster(&self, cluster: u32) -> Result<(), Error> {
        let zero = [0u8; SECTOR_SIZE];
        let base = self.volume.sector_of_cluster(cluster);
        for i in 0..self.volume.sectors_per_cluster {
            self.write_sector(base + i, &zero)?;
        }
        Ok(())
    }

    /// Free cluster strictly after `after`: bitmap first, then the FAT
    /// itself (wrapping); a FAT hit re-aims the bitmap at its sector.
    pub(crate) fn advance_free(&mut self, after: u32) -> Result<Option<u32>, Error> {
        if let Some(clu) = self.bitmap.next_free_after(after) {
            return Ok(Some(clu));
        }
        match self.fat.find_next_free(after)? {
            Some(clu) => {
                self.bitmap
                    .fill(&self.device, self.volume.fat_sector_of_cluster(clu))?;
                Ok(Some(clu))
            }
            None => Ok(None),
        }
    }

    /// Current hint if usable, else a fresh scan from the FAT start.
    pub(crate) fn valid_hint(&mut self) -> Result<u32, Error> {
        let hint = self.volume.next_free_cluster;
        if hint >= 2 && hint <= self.fat.max_cluster() {
            return Ok(hint);
        }
        let clu = self.fat.find_first_free()?.ok_or(Error::OutOfSpace)?;
        self.bitmap
            .fill(&self.device, self.volume.fat_sector_of_cluster(clu))?;
        Ok(clu)
    }

    /// Take the hinted free cluster and move the hint past it. The
    /// caller owns writing the cluster's FAT entry and adjusting the
    /// free count.
    pub(crate) fn take_free_cluster(&mut self) -> Result<u32, Error> {
        if self.volume.free_cluster_count == 0 {
            return Err(Error::OutOfSpace);
        }
        let clu = self.valid_hint()?;
        self.volume.next_free_cluster = self.advance_free(clu)?.unwrap_or(NO_FREE_HINT);
        Ok(clu)
    }

    /// Re-aim the bitmap at the hint's FAT sector after the FAT was
    /// mutated outside of write planning.
    pub(crate) fn refresh_bitmap(&mut self) -> Result<(), Error> {
        let hint = self.volume.next_free_cluster;
        if hint >= 2 && hint <= self.fat.max_cluster() {
            self.bitmap
                .fill(&self.device, self.volume.fat_sector_of_cluster(hint))?;
        } else {
            self.bitmap.invalidate();
        }
        Ok(())
    }

    /// Open a file for reading and appending.
    pub fn open(&mut self, path: &str) -> Result<FileHandle, Error> {
        let (dir_path, leaf) = split_path(path)?;
        if crate::is_illegal(leaf) {
            return Err(Error::InvalidName);
        }
        let dir = self.resolve(dir_path, self.volume.cwd)?;
        let (entry, fdi_sector, fdi_offset) = self
            .dir_find_entry(dir, leaf)?
            .ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::NotFound);
        }
        let key = FdiKey {
            sector: fdi_sector,
            offset: fdi_offset as u16,
        };

        let size = entry.file_size();
        let first = entry.first_cluster();
        if size > 0 && first < 2 {
            // Sized file with no chain: the entry is damaged.
            return Err(Error::CorruptChain);
        }
        let (tail, tail_free) = if size == 0 {
            (0, 0)
        } else {
            let tail = match self.tail_cache.lookup(&key) {
                // A stale cached tail whose cluster was since freed
                // makes the fast walk fail; retry from the start.
                Some(cached) => self
                    .fat
                    .follow_chain_fast(cached)
                    .or_else(|_| self.fat.follow_chain_fast(first))?,
                None => self.fat.follow_chain_fast(first)?,
            };
            (tail, tail_free_bytes(size, self.volume.cluster_size() as u32))
        };

        self.open_table.register(key)?;
        if tail >= 2 {
            self.tail_cache.record(key, tail);
        }

        Ok(FileHandle {
            first_cluster: first,
            cur_read_cluster: first,
            read_offset_in_cluster: 0,
            file_size: size,
            remaining_to_read: size,
            tail_cluster: tail,
            tail_free,
            fdi_sector,
            fdi_offset,
            state: HandleState::Open,
        })
    }

    /// Release the handle's open-table slot and invalidate it.
    pub fn close(&mut self, handle: &mut FileHandle) -> Result<(), Error> {
        if handle.state != HandleState::Open {
            return Err(Error::Closed);
        }
        self.open_table.release(&handle.key());
        handle.reset_closed();
        Ok(())
    }

    pub fn create_file(&mut self, path: &str) -> Result<(), Error> {
        self.create_entry(path, ATTR_ARCHIVE)
    }

    pub fn create_dir(&mut self, path: &str) -> Result<(), Error> {
        self.create_entry(path, ATTR_DIRECTORY)
    }

    fn create_entry(&mut self, path: &str, attr: u8) -> Result<(), Error> {
        let (dir_path, leaf) = split_path(path)?;
        if leaf == "." || leaf == ".." {
            return Err(Error::InvalidName);
        }
        let name = short_name_from_str(leaf)?;
        let parent = self.resolve(dir_path, self.volume.cwd)?;

        let slot = self.dir_locate_slot(parent, leaf)?;
        if matches!(slot, SlotSearch::Exists) {
            return Err(Error::AlreadyExists);
        }
        let is_dir = attr & ATTR_DIRECTORY != 0;
        let needed =
            u32::from(matches!(slot, SlotSearch::NeedExtend { .. })) + u32::from(is_dir);
        if self.volume.free_cluster_count < needed {
            return Err(Error::OutOfSpace);
        }

        let mut entry = DirEntry::new(name, attr);
        let own_cluster = if is_dir {
            let c = self.take_free_cluster()?;
            entry.set_first_cluster(c);
            Some(c)
        } else {
            None
        };

        match slot {
            SlotSearch::Free { sector, offset } => {
                self.write_fdi_at(sector, offset, &entry)?;
            }
            SlotSearch::NeedExtend { tail_cluster } => {
                let ext = self.take_free_cluster()?;
                self.fat.set(tail_cluster, ext)?;
                self.fat.set(ext, END_OF_CLUSTER)?;
                self.zero_cluster(ext)?;
                let sector = self.volume.sector_of_cluster(ext);
                self.write_fdi_at(sector, 0, &entry)?;
            }
            SlotSearch::Exists => unreachable!(),
        }

        if let Some(c) = own_cluster {
            self.fat.set(c, END_OF_CLUSTER)?;
            self.zero_cluster(c)?;
            self.write_dot_entries(c, parent)?;
        }

        if needed > 0 {
            self.volume.free_cluster_count -= needed;
            self.volume.persist_fsinfo(&self.device)?;
            self.refresh_bitmap()?;
        }
        Ok(())
    }

    /// Delete a file: refuse while open, mark its FDI free, then give
    /// its chain back to the free pool. A zero-length file touches only
    /// the FDI.
    pub fn delete_file(&mut self, path: &str) -> Result<(), Error> {
        let (dir_path, leaf) = split_path(path)?;
        let parent = self.resolve(dir_path, self.volume.cwd)?;
        let (entry, sector, offset) = self
            .dir_find_entry(parent, leaf)?
            .ok_or(Error::NotFound)?;
        if entry.is_dir() {
            return Err(Error::NotFound);
        }
        let key = FdiKey {
            sector,
            offset: offset as u16,
        };
        if self.open_table.is_open(&key) {
            return Err(Error::OpenWhileDelete);
        }

        let first = entry.first_cluster();
        self.patch_fdi(sector, offset, |e| e.mark_deleted())?;
        self.tail_cache.forget(&key);

        if first >= 2 {
            let freed = self.fat.destroy_chain(first)?;
            self.volume.free_cluster_count += freed;
            self.volume.persist_fsinfo(&self.device)?;
            self.refresh_bitmap()?;
        }
        Ok(())
    }

    /// Rewrite the 11 name bytes of a file's or directory's entry in
    /// place. The entry keeps its chain, size and attributes. A live
    /// entry already carrying the new display name refuses the rename;
    /// names stay unique within a directory.
    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<(), Error> {
        if new_name == "." || new_name == ".." {
            return Err(Error::InvalidName);
        }
        let name = short_name_from_str(new_name)?;
        let (dir_path, leaf) = split_path(path)?;
        let parent = self.resolve(dir_path, self.volume.cwd)?;
        let (_, sector, offset) = self
            .dir_find_entry(parent, leaf)?
            .ok_or(Error::NotFound)?;
        if let Some((_, hit_sector, hit_offset)) = self.dir_find_entry(parent, new_name)? {
            // Renaming an entry to its own name is a no-op, not a
            // collision.
            if (hit_sector, hit_offset) != (sector, offset) {
                return Err(Error::AlreadyExists);
            }
        }
        self.patch_fdi(sector, offset, |e| e.set_name_raw(name))
    }

    /// Resolve `path` and commit it as the working directory.
    pub fn change_dir(&mut self, path: &str) -> Result<u32, Error> {
        let clu = self.resolve(path, self.volume.cwd)?;
        self.volume.cwd = clu;
        Ok(clu)
    }

    pub fn current_dir(&self) -> u32 {
        self.volume.cwd
    }

    /// Display names and attribute bytes of every live entry in the
    /// directory `path` resolves to.
    pub fn list_dir(&self, path: &str) -> Result<Vec<(String, u8)>, Error> {
        let clu = self.resolve(path, self.volume.cwd)?;
        self.dir_list(clu)
    }
}

lazy_static! {
    static ref MOUNT_TABLE: Mutex<BTreeMap<String, Arc<RwLock<FileSystem>>>> =
        Mutex::new(BTreeMap::new());
}

/// Mount a device under a drive name and register it in the
/// process-wide table.
pub fn mount_named(
    name: &str,
    device: Arc<dyn BlockDevice>,
) -> Result<Arc<RwLock<FileSystem>>, Error> {
    let mut table = MOUNT_TABLE.lock();
    if table.contains_key(name) {
        return Err(Error::AlreadyMounted);
    }
    let fs = Arc::new(RwLock::new(FileSystem::mount(device)?));
    table.insert(String::from(name), Arc::clone(&fs));
    info!("fat32: mounted volume '{}'", name);
    Ok(fs)
}

/// Look up a mounted volume by drive name.
pub fn volume_named(name: &str) -> Option<Arc<RwLock<FileSystem>>> {
    MOUNT_TABLE.lock().get(name).cloned()
}

/// Drop a volume from the registry. Outstanding `Arc` handles keep the
/// file system alive until released.
pub fn unmount_named(name: &str) -> Result<(), Error> {
    match MOUNT_TABLE.lock().remove(name) {
        Some(_) => {
            info!("fat32: unmounted volume '{}'", name);
            Ok(())
        }
        None => Err(Error::NotMounted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{format_disk, fresh_fs, MemDisk};
    use crate::{ATTR_VOLUME_ID, MAX_OPEN_FILES, ROOT_CLUSTER};
    use alloc::vec;

    /// Scenario: a freshly formatted 64 MiB volume mounts with the
    /// whole data area free except the root cluster, cwd at root, and
    /// nothing but the volume label in the root directory.
    #[test]
    fn mount_empty_volume() {
        let fs = fresh_fs();
        assert_eq!(fs.current_dir(), ROOT_CLUSTER);
        assert_eq!(
            fs.volume().free_cluster_cnt(),
            fs.volume().data_cluster_cnt() - 1
        );
        let listing = fs.list_dir("/").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].1, ATTR_VOLUME_ID);
    }

    /// Scenario: create `./A.TXT`, write 513 bytes of 0xAB, close,
    /// reopen, read back.
    #[test]
    fn write_close_reopen_read() {
        let mut fs = fresh_fs();
        fs.create_file("./A.TXT").unwrap();
        let mut fh = fs.open("./A.TXT").unwrap();
        let payload = vec![0xABu8; 513];
        assert_eq!(fs.write(&mut fh, &payload).unwrap(), 513);
        fs.close(&mut fh).unwrap();

        let mut fh = fs.open("A.TXT").unwrap();
        assert_eq!(fh.file_size(), 513);
        let mut back = vec![0u8; 600];
        let n = fs.read(&mut fh, &mut back).unwrap();
        assert_eq!(n, 513);
        assert!(back[..513].iter().all(|&b| b == 0xAB));

        // One cluster when the cluster holds >= 513 bytes, and the
        // tail entry carries the end-of-chain mark.
        assert!(fs.volume().cluster_size() >= 1024);
        let first = fh.first_cluster;
        assert_eq!(fs.fat.next(first).unwrap(), END_OF_CLUSTER);
        assert_eq!(fh.tail_cluster, first);
        fs.close(&mut fh).unwrap();
    }

    /// Scenario: appending CSZ + 1 bytes to a file of exactly CSZ bytes
    /// (tail full) allocates two clusters for a chain of three.
    #[test]
    fn append_grows_chain_by_two() {
        let mut fs = fresh_fs();
        let csz = fs.volume().cluster_size();
        fs.create_file("/BIG.BIN").unwrap();
        let mut fh = fs.open("/BIG.BIN").unwrap();
        fs.write(&mut fh, &vec![1u8; csz]).unwrap();
        assert_eq!(fh.tail_free, 0);

        let free_before = fs.volume().free_cluster_cnt();
        fs.write(&mut fh, &vec![2u8; csz + 1]).unwrap();
        assert_eq!(free_before - fs.volume().free_cluster_cnt(), 2);
        assert_eq!(fh.file_size() as usize, 2 * csz + 1);

        let mut chain = vec![fh.first_cluster];
        loop {
            let next = fs.fat.next(*chain.last().unwrap()).unwrap();
            if crate::is_end_of_chain(next) {
                break;
            }
            chain.push(next);
        }
        assert_eq!(chain.len(), 3);
        fs.close(&mut fh).unwrap();
    }

    /// Scenario: two 300-byte writes with SPC = 8; only the first one
    /// allocates, and the tail keeps 4096 - 600 free bytes.
    #[test]
    fn small_appends_share_one_cluster() {
        let device = MemDisk::new(131072);
        crate::mkfs::format(&device, 131072, Some(8)).unwrap();
        let mut fs = FileSystem::mount(device).unwrap();
        assert_eq!(fs.volume().cluster_size(), 4096);

        fs.create_file("/TWO.DAT").unwrap();
        let mut fh = fs.open("/TWO.DAT").unwrap();
        let free0 = fs.volume().free_cluster_cnt();
        fs.write(&mut fh, &[7u8; 300]).unwrap();
        assert_eq!(free0 - fs.volume().free_cluster_cnt(), 1);
        fs.write(&mut fh, &[8u8; 300]).unwrap();
        assert_eq!(free0 - fs.volume().free_cluster_cnt(), 1);
        assert_eq!(fh.file_size(), 600);
        assert_eq!(fh.tail_free, 3496);
        fs.close(&mut fh).unwrap();
    }

    /// Scenario: five directories, a file in D3, renamed in place.
    #[test]
    fn create_dirs_and_rename() {
        let mut fs = fresh_fs();
        for d in ["/D1", "/D2", "/D3", "/D4", "/D5"] {
            fs.create_dir(d).unwrap();
        }
        fs.create_file("/D3/F.TXT").unwrap();
        fs.rename("/D3/F.TXT", "G.TX").unwrap();

        let mut fh = fs.open("/D3/G.TX").unwrap();
        fs.close(&mut fh).unwrap();
        assert_eq!(fs.open("/D3/F.TXT").unwrap_err(), Error::NotFound);
    }

    /// Renaming onto a live name must not leave two entries with the
    /// same display name in one directory.
    #[test]
    fn rename_refuses_name_collisions() {
        let mut fs = fresh_fs();
        fs.create_file("/A.TXT").unwrap();
        fs.create_file("/B.TXT").unwrap();
        assert_eq!(
            fs.rename("/A.TXT", "B.TXT").unwrap_err(),
            Error::AlreadyExists
        );
        // Both originals are still live under their own names.
        let mut fh = fs.open("/A.TXT").unwrap();
        fs.close(&mut fh).unwrap();
        let mut fh = fs.open("/B.TXT").unwrap();
        fs.close(&mut fh).unwrap();

        // Directories share the same name space.
        fs.create_dir("/D.TXT").unwrap();
        assert_eq!(
            fs.rename("/A.TXT", "D.TXT").unwrap_err(),
            Error::AlreadyExists
        );
        // Renaming an entry to its own name stays a no-op.
        fs.rename("/A.TXT", "A.TXT").unwrap();
        let mut fh = fs.open("/A.TXT").unwrap();
        fs.close(&mut fh).unwrap();
    }

    /// Scenario: a nearly full volume refuses a two-cluster append and
    /// mutates nothing.
    #[test]
    fn out_of_space_leaves_no_trace() {
        let device = MemDisk::new(4096);
        crate::mkfs::format(&device, 4096, Some(1)).unwrap();
        let mut fs = FileSystem::mount(device).unwrap();
        let csz = fs.volume().cluster_size();

        fs.create_file("/FILL.BIN").unwrap();
        let mut filler = fs.open("/FILL.BIN").unwrap();
        let almost_all = (fs.volume().free_cluster_cnt() - 1) as usize * csz;
        fs.write(&mut filler, &vec![0u8; almost_all]).unwrap();
        fs.close(&mut filler).unwrap();
        assert_eq!(fs.volume().free_cluster_cnt(), 1);

        fs.create_file("/NEW.BIN").unwrap();
        let mut fh = fs.open("/NEW.BIN").unwrap();
        let hint = fs.volume().next_free_cluster;
        assert_eq!(
            fs.write(&mut fh, &vec![0u8; 2 * csz]).unwrap_err(),
            Error::OutOfSpace
        );
        assert_eq!(fs.volume().free_cluster_cnt(), 1);
        assert_eq!(fs.volume().next_free_cluster, hint);
        // The file was never committed to a first cluster.
        assert_eq!(fh.first_cluster, 0);
        assert_eq!(fs.fat.next(hint).unwrap(), crate::FREE_CLUSTER);
        fs.close(&mut fh).unwrap();
    }

    #[test]
    fn zero_length_write_rejected() {
        let mut fs = fresh_fs();
        fs.create_file("/Z.BIN").unwrap();
        let mut fh = fs.open("/Z.BIN").unwrap();
        let free = fs.volume().free_cluster_cnt();
        assert_eq!(fs.write(&mut fh, &[]).unwrap_err(), Error::ZeroLength);
        assert_eq!(fs.volume().free_cluster_cnt(), free);
        fs.close(&mut fh).unwrap();
    }

    #[test]
    fn exact_tail_fill_allocates_nothing() {
        let mut fs = fresh_fs();
        fs.create_file("/T.BIN").unwrap();
        let mut fh = fs.open("/T.BIN").unwrap();
        fs.write(&mut fh, &[1u8; 100]).unwrap();
        let free = fs.volume().free_cluster_cnt();
        let fill = fh.tail_free as usize;
        fs.write(&mut fh, &vec![2u8; fill]).unwrap();
        assert_eq!(fs.volume().free_cluster_cnt(), free);
        assert_eq!(fh.tail_free, 0);
        fs.close(&mut fh).unwrap();
    }

    #[test]
    fn open_table_limit() {
        let mut fs = fresh_fs();
        let mut handles = Vec::new();
        for i in 0..MAX_OPEN_FILES {
            let path = alloc::format!("/F{}.BIN", i);
            fs.create_file(&path).unwrap();
            handles.push(fs.open(&path).unwrap());
        }
        fs.create_file("/F9.BIN").unwrap();
        assert_eq!(fs.open("/F9.BIN").unwrap_err(), Error::TooManyOpen);
        for fh in handles.iter_mut() {
            fs.close(fh).unwrap();
        }
        let mut fh = fs.open("/F9.BIN").unwrap();
        fs.close(&mut fh).unwrap();
    }

    #[test]
    fn delete_semantics() {
        let mut fs = fresh_fs();
        fs.create_file("/D.BIN").unwrap();
        let mut fh = fs.open("/D.BIN").unwrap();
        assert_eq!(fs.delete_file("/D.BIN").unwrap_err(), Error::OpenWhileDelete);
        fs.close(&mut fh).unwrap();

        // Zero-length delete touches no FAT state.
        let free = fs.volume().free_cluster_cnt();
        fs.delete_file("/D.BIN").unwrap();
        assert_eq!(fs.volume().free_cluster_cnt(), free);
        assert_eq!(fs.open("/D.BIN").unwrap_err(), Error::NotFound);

        // Recreate under the same name.
        fs.create_file("/D.BIN").unwrap();
        let mut fh = fs.open("/D.BIN").unwrap();
        fs.write(&mut fh, &[3u8; 5000]).unwrap();
        fs.close(&mut fh).unwrap();

        // Deleting a file with data returns its clusters.
        let free = fs.volume().free_cluster_cnt();
        let clusters = (5000 + fs.volume().cluster_size() - 1) / fs.volume().cluster_size();
        fs.delete_file("/D.BIN").unwrap();
        assert_eq!(
            fs.volume().free_cluster_cnt(),
            free + clusters as u32
        );
    }

    /// Appends keep the full read-back law: reading the file yields the
    /// concatenation of everything written.
    #[test]
    fn append_read_back_law() {
        let mut fs = fresh_fs();
        fs.create_file("/LAW.BIN").unwrap();
        let mut fh = fs.open("/LAW.BIN").unwrap();
        let mut expected = Vec::new();
        for (i, len) in [1usize, 511, 512, 513, 2048, 7].iter().enumerate() {
            let chunk = vec![i as u8 + 1; *len];
            fs.write(&mut fh, &chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }
        fs.close(&mut fh).unwrap();

        let mut fh = fs.open("/LAW.BIN").unwrap();
        let mut back = vec![0u8; expected.len()];
        assert_eq!(fs.read(&mut fh, &mut back).unwrap(), expected.len());
        assert_eq!(back, expected);
        fs.close(&mut fh).unwrap();
    }

    #[test]
    fn free_count_matches_fat_scan_after_mutations() {
        let mut fs = fresh_fs();
        fs.create_dir("/A").unwrap();
        fs.create_file("/A/F.BIN").unwrap();
        let mut fh = fs.open("/A/F.BIN").unwrap();
        fs.write(&mut fh, &vec![9u8; 3 * fs.volume().cluster_size() + 10])
            .unwrap();
        fs.close(&mut fh).unwrap();
        fs.delete_file("/A/F.BIN").unwrap();
        assert_eq!(fs.volume().free_cluster_cnt(), fs.fat.count_free().unwrap());
    }

    #[test]
    fn change_dir_tracks_cwd() {
        let mut fs = fresh_fs();
        fs.create_dir("/X").unwrap();
        fs.create_dir("/X/Y").unwrap();
        let x = fs.change_dir("/X").unwrap();
        assert_eq!(fs.current_dir(), x);
        fs.create_file("Y/IN.TXT").unwrap();
        let mut fh = fs.open("/X/Y/IN.TXT").unwrap();
        fs.close(&mut fh).unwrap();
        fs.change_dir("..").unwrap();
        assert_eq!(fs.current_dir(), ROOT_CLUSTER);
    }

    #[test]
    fn named_mount_registry() {
        let device = format_disk(131072);
        let fs = mount_named("sd0", Arc::clone(&device)).unwrap();
        assert!(volume_named("sd0").is_some());
        assert_eq!(
            mount_named("sd0", device).unwrap_err(),
            Error::AlreadyMounted
        );
        fs.write().create_file("/NAMED.TXT").unwrap();
        unmount_named("sd0").unwrap();
        assert!(volume_named("sd0").is_none());
        assert_eq!(unmount_named("sd0").unwrap_err(), Error::NotMounted);
    }
}
