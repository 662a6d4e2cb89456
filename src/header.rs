//! Package header: the fixed preamble written right after any host prefix,
//! before the first payload block. Never XOR-obfuscated.
//!
//! Byte layout (little-endian):
//!
//! ```text
//! version:i32
//! bodyCompressFlag:u8
//! -- v2 only --
//! encryptionFlag:u8
//! identification:[u8; 128]
//! ```
//!
//! v1 archives (predating the identification string) end after the compress
//! flag; this crate always writes v2 but can still read v1.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::GmPackError;

pub const IDENTIFICATION_TEXT: &[u8] = b"GMTOOLKITPACKAGEFILE";
pub const IDENTIFICATION_LEN: usize = 128;
pub const CURRENT_VERSION: i32 = 2;

#[derive(Debug, Clone)]
pub struct PackageHeader {
    pub version: i32,
    pub body_compress_flag: bool,
    pub encryption_flag: bool,
    pub identification: [u8; IDENTIFICATION_LEN],
}

impl Default for PackageHeader {
    fn default() -> Self {
        let mut identification = [0u8; IDENTIFICATION_LEN];
        identification[..IDENTIFICATION_TEXT.len()].copy_from_slice(IDENTIFICATION_TEXT);
        PackageHeader {
            version: CURRENT_VERSION,
            body_compress_flag: false,
            encryption_flag: true,
            identification,
        }
    }
}

impl PackageHeader {
    /// Size in bytes this header occupies on disk, given its own version.
    pub fn encoded_len(&self) -> i64 {
        match self.version {
            1 => 5,
            _ => 4 + 1 + 1 + IDENTIFICATION_LEN as i64,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), GmPackError> {
        w.write_i32::<LittleEndian>(self.version)?;
        w.write_u8(self.body_compress_flag as u8)?;
        if self.version >= 2 {
            w.write_u8(self.encryption_flag as u8)?;
            w.write_all(&self.identification)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self, GmPackError> {
        let version = r.read_i32::<LittleEndian>()?;
        let body_compress_flag = r.read_u8()? != 0;
        let (encryption_flag, identification) = if version >= 2 {
            let encryption_flag = r.read_u8()? != 0;
            let mut identification = [0u8; IDENTIFICATION_LEN];
            r.read_exact(&mut identification)?;
            (encryption_flag, identification)
        } else {
            (true, [0u8; IDENTIFICATION_LEN])
        };
        Ok(PackageHeader {
            version,
            body_compress_flag,
            encryption_flag,
            identification,
        })
    }
}

/// Fixed 20-byte trailer: `recordCount:i32, indexStart:i64, totalSize:i64`.
#[derive(Debug, Clone, Copy)]
pub struct PackageTrailer {
    pub record_count: i32,
    pub index_start: i64,
    pub total_size: i64,
}

pub const TRAILER_LEN: i64 = 4 + 8 + 8;

impl PackageTrailer {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(self.record_count)?;
        w.write_i64::<LittleEndian>(self.index_start)?;
        w.write_i64::<LittleEndian>(self.total_size)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let record_count = r.read_i32::<LittleEndian>()?;
        let index_start = r.read_i64::<LittleEndian>()?;
        let total_size = r.read_i64::<LittleEndian>()?;
        Ok(PackageTrailer {
            record_count,
            index_start,
            total_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_v2() {
        let header = PackageHeader {
            body_compress_flag: true,
            ..PackageHeader::default()
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len() as i64, header.encoded_len());
        let back = PackageHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(back.version, header.version);
        assert_eq!(back.body_compress_flag, header.body_compress_flag);
        assert_eq!(back.encryption_flag, header.encryption_flag);
        assert_eq!(back.identification, header.identification);
    }

    #[test]
    fn header_round_trip_v1() {
        let mut buf = Vec::new();
        buf.write_i32::<LittleEndian>(1).unwrap();
        buf.write_u8(1).unwrap();
        let back = PackageHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(back.version, 1);
        assert!(back.body_compress_flag);
        assert_eq!(back.encoded_len(), 5);
    }

    #[test]
    fn trailer_round_trip() {
        let trailer = PackageTrailer {
            record_count: 3,
            index_start: 1024,
            total_size: 2048,
        };
        let mut buf = Vec::new();
        trailer.write(&mut buf).unwrap();
        assert_eq!(buf.len() as i64, TRAILER_LEN);
        let back = PackageTrailer::read(&mut &buf[..]).unwrap();
        assert_eq!(back.record_count, trailer.record_count);
        assert_eq!(back.index_start, trailer.index_start);
        assert_eq!(back.total_size, trailer.total_size);
    }
}
