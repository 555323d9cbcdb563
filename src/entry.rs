//! 32-byte FAT directory entries (short 8.3 form) and the name rules
//! around them.
//!
//! Special notes about the first byte of an entry:
//! - `0xE5`: the entry is free (the file was deleted).
//! - `0x00`: the entry is free and there are no allocated entries after
//!   this one in the directory, so traversal may stop.
//!
//! The name field is 8 + 3 bytes, trailing-space padded, with an
//! implied `.` between the main part and the extension. A zero-length
//! file has first-cluster 0 in its entry; directories always carry a
//! file size of 0 and are sized by following their cluster chains.
//!
//! Display names round-trip: generating a short name from a display
//! name produced by [`DirEntry::display_name`] yields the original
//! 11 bytes. Matching is byte-exact and case-sensitive; no case folding
//! is applied in either direction.

use alloc::string::String;

use crate::{
    is_illegal, read_le_u16, read_le_u32, write_le_u16, write_le_u32, Error, ATTR_DIRECTORY,
    ATTR_VOLUME_ID, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED, SPACE,
};

#[derive(Clone, Copy)]
pub struct DirEntry {
    bytes: [u8; DIRENT_SIZE],
}

impl DirEntry {
    const ATTR_OFFSET: usize = 11;
    const CASE_OFFSET: usize = 12;
    const FST_CLUS_HI_OFFSET: usize = 20;
    const FST_CLUS_LO_OFFSET: usize = 26;
    const FILE_SIZE_OFFSET: usize = 28;

    pub fn from_bytes(bytes: [u8; DIRENT_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes.copy_from_slice(&slice[..DIRENT_SIZE]);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; DIRENT_SIZE] {
        &self.bytes
    }

    /// A fresh entry: name + attribute, first cluster 0, size 0.
    pub fn new(name: [u8; 11], attr: u8) -> Self {
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes[..11].copy_from_slice(&name);
        bytes[Self::ATTR_OFFSET] = attr;
        // Case flag as the original stamps it; dot entries get 0.
        if name[0] != b'.' {
            bytes[Self::CASE_OFFSET] = if attr & ATTR_DIRECTORY != 0 { 0x08 } else { 0x10 };
        }
        Self { bytes }
    }

    pub fn volume_label(label: [u8; 11]) -> Self {
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes[..11].copy_from_slice(&label);
        bytes[Self::ATTR_OFFSET] = ATTR_VOLUME_ID;
        Self { bytes }
    }

    /// First byte 0x00: nothing allocated from here on.
    pub fn is_end(&self) -> bool {
        self.bytes[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_deleted(&self) -> bool {
        self.bytes[0] == DIR_ENTRY_UNUSED
    }

    pub fn attr(&self) -> u8 {
        self.bytes[Self::ATTR_OFFSET]
    }

    pub fn is_dir(&self) -> bool {
        self.attr() & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr() & ATTR_VOLUME_ID != 0
    }

    pub fn name_raw(&self) -> [u8; 11] {
        let mut name = [0u8; 11];
        name.copy_from_slice(&self.bytes[..11]);
        name
    }

    pub fn set_name_raw(&mut self, name: [u8; 11]) {
        self.bytes[..11].copy_from_slice(&name);
    }

    pub fn first_cluster(&self) -> u32 {
        let hi = read_le_u16(&self.bytes[Self::FST_CLUS_HI_OFFSET..]) as u32;
        let lo = read_le_u16(&self.bytes[Self::FST_CLUS_LO_OFFSET..]) as u32;
        (hi << 16) | lo
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        write_le_u16(
            &mut self.bytes[Self::FST_CLUS_HI_OFFSET..],
            (cluster >> 16) as u16,
        );
        write_le_u16(
            &mut self.bytes[Self::FST_CLUS_LO_OFFSET..],
            (cluster & 0xFFFF) as u16,
        );
    }

    pub fn file_size(&self) -> u32 {
        read_le_u32(&self.bytes[Self::FILE_SIZE_OFFSET..])
    }

    pub fn set_file_size(&mut self, size: u32) {
        write_le_u32(&mut self.bytes[Self::FILE_SIZE_OFFSET..], size);
    }

    /// Mark deleted and clear the high first-cluster word, as delete
    /// requires.
    pub fn mark_deleted(&mut self) {
        self.bytes[0] = DIR_ENTRY_UNUSED;
        self.bytes[Self::FST_CLUS_HI_OFFSET] = 0;
        self.bytes[Self::FST_CLUS_HI_OFFSET + 1] = 0;
    }

    /// `NAME.EXT` form: trailing spaces trimmed from the 8-byte part,
    /// dot and extension omitted when the extension is all spaces.
    pub fn display_name(&self) -> String {
        display_name(&self.name_raw())
    }
}

pub fn display_name(raw: &[u8; 11]) -> String {
    let mut out = String::new();
    for &b in raw[..8].iter() {
        if b == SPACE {
            break;
        }
        out.push(b as char);
    }
    if raw[8] != SPACE {
        out.push('.');
        for &b in raw[8..].iter() {
            if b == SPACE {
                break;
            }
            out.push(b as char);
        }
    }
    out
}

/// Build the 11 on-disk name bytes from a display name holding at most
/// one dot. An over-long base keeps its first 7 bytes plus `~`; an
/// over-long extension keeps its first 2 plus `~`. The reserved names
/// `.` and `..` bypass the transformation.
pub fn short_name_from_str(name: &str) -> Result<[u8; 11], Error> {
    let mut out = [SPACE; 11];
    if name == "." || name == ".." {
        out[..name.len()].copy_from_slice(name.as_bytes());
        return Ok(out);
    }
    if name.is_empty() || is_illegal(name) || !name.is_ascii() {
        return Err(Error::InvalidName);
    }
    let (base, ext) = match name.find('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, ""),
    };
    if base.is_empty() || ext.contains('.') {
        return Err(Error::InvalidName);
    }

    let base = base.as_bytes();
    if base.len() <= 8 {
        out[..base.len()].copy_from_slice(base);
    } else {
        out[..7].copy_from_slice(&base[..7]);
        out[7] = b'~';
    }

    let ext = ext.as_bytes();
    if ext.len() <= 3 {
        out[8..8 + ext.len()].copy_from_slice(ext);
    } else {
        out[8..10].copy_from_slice(&ext[..2]);
        out[10] = b'~';
    }
    Ok(out)
}
