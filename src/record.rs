//! Per-entry file-info record (`GmPackageFileInfoItem` in the original tool)
//! and the wire codec for the strings it carries.
//!
//! Field order on disk is fixed and must not change:
//! `filename, position:i64, compressedLen:i64, originalLen:i64,
//! permissions:i32, tag:i32, compressFlag:u8, deleteFlag:u8, isSymlink:u8,
//! symlinkTarget`. Strings use a 4-byte length prefix followed by UTF-16LE
//! code units, or the sentinel length `0xFFFF_FFFF` for a null string — the
//! layout `QDataStream` produces for `QString`, kept bit-compatible here.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::GmPackError;

pub const PERM_READ_OWNER: i32 = 0x4000;
pub const PERM_WRITE_OWNER: i32 = 0x2000;
pub const PERM_EXEC_OWNER: i32 = 0x1000;
pub const PERM_READ_USER: i32 = 0x0400;
pub const PERM_WRITE_USER: i32 = 0x0200;
pub const PERM_EXEC_USER: i32 = 0x0100;
pub const PERM_READ_GROUP: i32 = 0x0040;
pub const PERM_WRITE_GROUP: i32 = 0x0020;
pub const PERM_EXEC_GROUP: i32 = 0x0010;
pub const PERM_READ_OTHER: i32 = 0x0004;
pub const PERM_WRITE_OTHER: i32 = 0x0002;
pub const PERM_EXEC_OTHER: i32 = 0x0001;

/// Converts a Unix `st_mode & 0o777` into the record's 12-bit permission
/// bitmask. Owner and "user" map to the same rwx triplet — the original
/// format carries both fields but this crate only ever populates them
/// identically, since Unix has no third distinct owner/user concept.
pub fn permissions_from_mode(mode: u32) -> i32 {
    let mut perm = 0;
    if mode & 0o400 != 0 {
        perm |= PERM_READ_OWNER | PERM_READ_USER;
    }
    if mode & 0o200 != 0 {
        perm |= PERM_WRITE_OWNER | PERM_WRITE_USER;
    }
    if mode & 0o100 != 0 {
        perm |= PERM_EXEC_OWNER | PERM_EXEC_USER;
    }
    if mode & 0o040 != 0 {
        perm |= PERM_READ_GROUP;
    }
    if mode & 0o020 != 0 {
        perm |= PERM_WRITE_GROUP;
    }
    if mode & 0o010 != 0 {
        perm |= PERM_EXEC_GROUP;
    }
    if mode & 0o004 != 0 {
        perm |= PERM_READ_OTHER;
    }
    if mode & 0o002 != 0 {
        perm |= PERM_WRITE_OTHER;
    }
    if mode & 0o001 != 0 {
        perm |= PERM_EXEC_OTHER;
    }
    perm
}

pub fn permissions_to_mode(perm: i32) -> u32 {
    let mut mode = 0u32;
    if perm & (PERM_READ_OWNER | PERM_READ_USER) != 0 {
        mode |= 0o400;
    }
    if perm & (PERM_WRITE_OWNER | PERM_WRITE_USER) != 0 {
        mode |= 0o200;
    }
    if perm & (PERM_EXEC_OWNER | PERM_EXEC_USER) != 0 {
        mode |= 0o100;
    }
    if perm & PERM_READ_GROUP != 0 {
        mode |= 0o040;
    }
    if perm & PERM_WRITE_GROUP != 0 {
        mode |= 0o020;
    }
    if perm & PERM_EXEC_GROUP != 0 {
        mode |= 0o010;
    }
    if perm & PERM_READ_OTHER != 0 {
        mode |= 0o004;
    }
    if perm & PERM_WRITE_OTHER != 0 {
        mode |= 0o002;
    }
    if perm & PERM_EXEC_OTHER != 0 {
        mode |= 0o001;
    }
    mode
}

pub const DEFAULT_PERMISSIONS: i32 = PERM_READ_OWNER | PERM_WRITE_OWNER | PERM_EXEC_OWNER;

const NULL_STRING_LEN: u32 = 0xFFFF_FFFF;

pub fn write_string<W: Write>(w: &mut W, s: Option<&str>) -> io::Result<()> {
    match s {
        None => w.write_u32::<LittleEndian>(NULL_STRING_LEN),
        Some(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            w.write_u32::<LittleEndian>((units.len() * 2) as u32)?;
            for unit in units {
                w.write_u16::<LittleEndian>(unit)?;
            }
            Ok(())
        }
    }
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<Option<String>> {
    let byte_len = r.read_u32::<LittleEndian>()?;
    if byte_len == NULL_STRING_LEN {
        return Ok(None);
    }
    let unit_count = (byte_len / 2) as usize;
    let mut units = Vec::with_capacity(unit_count);
    for _ in 0..unit_count {
        units.push(r.read_u16::<LittleEndian>()?);
    }
    Ok(Some(String::from_utf16_lossy(&units)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    /// Payload start offset, relative to the archive start (excludes any
    /// host prefix).
    pub position: i64,
    pub compressed_len: i64,
    pub original_len: i64,
    pub permissions: i32,
    pub tag: i32,
    pub compress_flag: bool,
    pub delete_flag: bool,
    pub is_symlink: bool,
    pub symlink_target: Option<String>,
}

impl FileRecord {
    pub fn new(filename: impl Into<String>) -> Self {
        FileRecord {
            filename: filename.into(),
            position: 0,
            compressed_len: 0,
            original_len: 0,
            permissions: DEFAULT_PERMISSIONS,
            tag: 0,
            compress_flag: false,
            delete_flag: false,
            is_symlink: false,
            symlink_target: None,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, Some(&self.filename))?;
        w.write_i64::<LittleEndian>(self.position)?;
        w.write_i64::<LittleEndian>(self.compressed_len)?;
        w.write_i64::<LittleEndian>(self.original_len)?;
        w.write_i32::<LittleEndian>(self.permissions)?;
        w.write_i32::<LittleEndian>(self.tag)?;
        w.write_u8(self.compress_flag as u8)?;
        w.write_u8(self.delete_flag as u8)?;
        w.write_u8(self.is_symlink as u8)?;
        write_string(w, self.symlink_target.as_deref())?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, GmPackError> {
        let filename = read_string(r)?.unwrap_or_default();
        let position = r.read_i64::<LittleEndian>()?;
        let compressed_len = r.read_i64::<LittleEndian>()?;
        let original_len = r.read_i64::<LittleEndian>()?;
        let permissions = r.read_i32::<LittleEndian>()?;
        let tag = r.read_i32::<LittleEndian>()?;
        let compress_flag = r.read_u8()? != 0;
        let delete_flag = r.read_u8()? != 0;
        let is_symlink = r.read_u8()? != 0;
        let symlink_target = read_string(r)?;
        Ok(FileRecord {
            filename,
            position,
            compressed_len,
            original_len,
            permissions,
            tag,
            compress_flag,
            delete_flag,
            is_symlink,
            symlink_target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip_with_non_ascii() {
        let mut buf = Vec::new();
        write_string(&mut buf, Some("dir/résumé.txt")).unwrap();
        let back = read_string(&mut &buf[..]).unwrap();
        assert_eq!(back.as_deref(), Some("dir/résumé.txt"));
    }

    #[test]
    fn null_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, None).unwrap();
        assert_eq!(read_string(&mut &buf[..]).unwrap(), None);
    }

    #[test]
    fn record_round_trip() {
        let mut rec = FileRecord::new("a/b.txt");
        rec.position = 134;
        rec.compressed_len = 40;
        rec.original_len = 100;
        rec.tag = 7;
        rec.compress_flag = true;
        let mut buf = Vec::new();
        rec.write(&mut buf).unwrap();
        let back = FileRecord::read(&mut &buf[..]).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn symlink_record_round_trip() {
        let mut rec = FileRecord::new("link");
        rec.is_symlink = true;
        rec.symlink_target = Some("../target".to_string());
        let mut buf = Vec::new();
        rec.write(&mut buf).unwrap();
        let back = FileRecord::read(&mut &buf[..]).unwrap();
        assert_eq!(back.symlink_target.as_deref(), Some("../target"));
    }

    #[test]
    fn permission_mode_round_trip() {
        for mode in [0o755u32, 0o644, 0o600, 0o777, 0o400] {
            let perm = permissions_from_mode(mode);
            assert_eq!(permissions_to_mode(perm), mode);
        }
    }
}
