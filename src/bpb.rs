//! On-disk metadata records: the DBR (boot sector / BIOS parameter
//! block), the MBR partition table, and the FSINFO sector.
//!
//! The first important data structure on a FAT volume is the BPB, located
//! in the first sector of the volume in its reserved region. On a
//! partitioned disk that sector sits at the partition start and absolute
//! sector 0 carries an MBR instead; the driver distinguishes the two by
//! the `EB 58 90` jump instruction a FAT32 DBR begins with.
//!
//! Note that on a FAT32 volume `root_ent_cnt` is always 0 and the FAT
//! size always lives in the 32-bit `fat_sz32` field; the 16-bit legacy
//! fields must read 0. [`BiosParameterBlock::is_valid`] enforces exactly
//! that, which is the one and only FAT-type check this driver performs:
//! there is no such thing as a FAT32 volume with fewer than 65,525
//! clusters, and volumes that violate the rule are rejected at mount.
//!
//! The FSINFO sector (usually sector 1 of the partition) carries the
//! last known free-cluster count and a next-free hint. If the free count
//! reads `0xFFFFFFFF` it is unknown and must be recomputed by scanning
//! the FAT.

use crate::{
    read_le_u16, read_le_u32, write_le_u32, Error, BOOT_SIGNATURE_OFFSET, LEAD_SIGNATURE,
    MBR_PARTITION_ENTRY_SIZE, MBR_PARTITION_TABLE_OFFSET, SECTOR_SIZE, STRUCT_SIGNATURE,
    TRAIL_SIGNATURE,
};

/// Parsed DBR fields. Only the fields this driver consumes are kept;
/// the boot code and geometry hints for INT 13h stay on disk.
#[derive(Debug, Clone, Copy)]
pub struct BiosParameterBlock {
    pub(crate) byts_per_sec: u16,
    pub(crate) sec_per_clus: u8,
    pub(crate) rsvd_sec_cnt: u16,
    pub(crate) num_fats: u8,
    pub(crate) root_ent_cnt: u16,
    pub(crate) tot_sec16: u16,
    pub(crate) media: u8,
    pub(crate) fat_sz16: u16,
    pub(crate) tot_sec32: u32,
    pub(crate) fat_sz32: u32,
    pub(crate) root_clus: u32,
    pub(crate) fs_info: u16,
}

impl BiosParameterBlock {
    /// Decode the BPB fields out of a raw boot sector.
    pub fn parse(sector: &[u8]) -> Result<Self, Error> {
        if sector.len() < SECTOR_SIZE {
            return Err(Error::InvalidVolume);
        }
        if read_le_u16(&sector[BOOT_SIGNATURE_OFFSET..]) != 0xAA55 {
            return Err(Error::InvalidVolume);
        }
        Ok(Self {
            byts_per_sec: read_le_u16(&sector[11..]),
            sec_per_clus: sector[13],
            rsvd_sec_cnt: read_le_u16(&sector[14..]),
            num_fats: sector[16],
            root_ent_cnt: read_le_u16(&sector[17..]),
            tot_sec16: read_le_u16(&sector[19..]),
            media: sector[21],
            fat_sz16: read_le_u16(&sector[22..]),
            tot_sec32: read_le_u32(&sector[32..]),
            fat_sz32: read_le_u32(&sector[36..]),
            root_clus: read_le_u32(&sector[44..]),
            fs_info: read_le_u16(&sector[48..]),
        })
    }

    /// The legacy 16-bit fields must be zero and the 32-bit ones
    /// populated, or this is not a FAT32 volume.
    pub fn is_valid(&self) -> bool {
        self.root_ent_cnt == 0
            && self.tot_sec16 == 0
            && self.fat_sz16 == 0
            && self.tot_sec32 != 0
            && self.fat_sz32 != 0
            && self.byts_per_sec as usize == SECTOR_SIZE
            && self.sec_per_clus != 0
            && self.sec_per_clus.is_power_of_two()
            && self.num_fats != 0
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.byts_per_sec as usize
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sec_per_clus as u32
    }

    pub fn reserved_sector_cnt(&self) -> u32 {
        self.rsvd_sec_cnt as u32
    }

    pub fn fat_cnt(&self) -> u32 {
        self.num_fats as u32
    }

    pub fn total_sector_cnt(&self) -> u32 {
        self.tot_sec32
    }

    pub fn sectors_per_fat(&self) -> u32 {
        self.fat_sz32
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_clus
    }

    pub fn fsinfo_sector(&self) -> u32 {
        self.fs_info as u32
    }
}

/// Does absolute sector 0 hold a DBR rather than an MBR?
/// A FAT32 boot sector starts with the x86 jump `EB 58 90`.
pub fn sector0_is_dbr(sector: &[u8]) -> bool {
    sector[0] == 0xEB && sector[1] == 0x58 && sector[2] == 0x90
}

/// Start sectors of the up-to-four MBR partitions; 0 marks an empty
/// slot. Partition entries live at offset 446 + 16 i, with the start
/// sector at +8 inside each entry.
pub fn partition_start_sectors(sector: &[u8]) -> [u32; 4] {
    let mut parts = [0u32; 4];
    for (i, part) in parts.iter_mut().enumerate() {
        let off = MBR_PARTITION_TABLE_OFFSET + i * MBR_PARTITION_ENTRY_SIZE;
        *part = read_le_u32(&sector[off + 8..]);
    }
    parts
}

/// FSINFO free-count / next-free pair.
#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub(crate) free_count: u32,
    pub(crate) next_free: u32,
}

impl FsInfo {
    /// Byte offsets of the two bookkeeping fields within the sector.
    const FREE_COUNT_OFFSET: usize = 488;
    const NEXT_FREE_OFFSET: usize = 492;

    pub fn parse(sector: &[u8]) -> Result<Self, Error> {
        if !Self::check_signature(sector) {
            return Err(Error::InvalidVolume);
        }
        Ok(Self {
            free_count: read_le_u32(&sector[Self::FREE_COUNT_OFFSET..]),
            next_free: read_le_u32(&sector[Self::NEXT_FREE_OFFSET..]),
        })
    }

    /// Lead, structure and trail signatures validate that this is in
    /// fact an FSINFO sector.
    pub fn check_signature(sector: &[u8]) -> bool {
        read_le_u32(&sector[0..]) == LEAD_SIGNATURE
            && read_le_u32(&sector[484..]) == STRUCT_SIGNATURE
            && read_le_u32(&sector[508..]) == TRAIL_SIGNATURE
    }

    /// Patch the two bookkeeping fields into an FSINFO sector image,
    /// leaving signatures and reserved bytes as read.
    pub fn apply_to(&self, sector: &mut [u8]) {
        write_le_u32(&mut sector[Self::FREE_COUNT_OFFSET..], self.free_count);
        write_le_u32(&mut sector[Self::NEXT_FREE_OFFSET..], self.next_free);
    }

    /// Write the full canonical FSINFO layout into a zeroed sector.
    pub fn write_fresh(&self, sector: &mut [u8]) {
        sector.fill(0);
        write_le_u32(&mut sector[0..], LEAD_SIGNATURE);
        write_le_u32(&mut sector[484..], STRUCT_SIGNATURE);
        write_le_u32(&mut sector[508..], TRAIL_SIGNATURE);
        self.apply_to(sector);
    }
}
