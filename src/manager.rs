//! The package manager: owns the on-disk layout, the live record list, and
//! every read/write/filter operation the builder and installer compose.
//!
//! # Obfuscation is a format constant, not a runtime flag
//!
//! The original tool reads the index region with obfuscation unconditionally
//! applied — at load time the header (which carries the real
//! `encryptionFlag`) hasn't been read yet, so the load path always assumes
//! obfuscation is on. Every archive this crate has ever produced sets
//! `encryptionFlag = 1` by default and nothing in the original tool's CLI
//! ever turns it off. Rather than reproduce the read/write asymmetry this
//! creates in the source tool (index writes respect the flag, index reads
//! don't), this port treats obfuscation of payload blocks and the index
//! region as always-on. `PackageHeader::encryption_flag` is kept and
//! round-tripped for on-disk compatibility, but no code path here branches
//! on it. See `DESIGN.md` for the full writeup.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::WriteBytesExt;
use tracing::debug;

use crate::codec;
use crate::error::GmPackError;
use crate::header::{PackageHeader, PackageTrailer, TRAILER_LEN};
use crate::record::FileRecord;

#[derive(Debug)]
pub struct PackageManager {
    path: Option<PathBuf>,
    header: PackageHeader,
    records: Vec<FileRecord>,
    /// Distance from the start of the host file to the start of the
    /// archive; nonzero when the archive was concatenated onto a prefix
    /// (e.g. a loader binary).
    start_offset: i64,
    compression_level: i32,
}

impl Default for PackageManager {
    fn default() -> Self {
        PackageManager {
            path: None,
            header: PackageHeader::default(),
            records: Vec::new(),
            start_offset: 0,
            compression_level: 9,
        }
    }
}

fn dir_prefix(dir: &str) -> String {
    if dir.is_empty() {
        String::new()
    } else if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

impl PackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an existing package file and loads its record list.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GmPackError> {
        let mut manager = Self::new();
        manager.set_filename(path);
        manager.load()?;
        Ok(manager)
    }

    pub fn set_filename(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn filename(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_compress_flag(&mut self, flag: bool) {
        self.header.body_compress_flag = flag;
    }

    pub fn compress_flag(&self) -> bool {
        self.header.body_compress_flag
    }

    /// Clamps to `-1..=9`, matching `qCompress`'s accepted range; anything
    /// else falls back to the default level.
    pub fn set_compression_level(&mut self, level: i32) {
        self.compression_level = match level {
            -1 => -1,
            0..=9 => level,
            _ => 9,
        };
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn version(&self) -> i32 {
        self.header.version
    }

    pub fn is_valid(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    /// Resets `start_offset` to zero for a from-scratch build, discarding
    /// any previously loaded records.
    pub fn reset(&mut self) {
        self.records.clear();
        self.start_offset = 0;
    }

    // ---- load / self-locate --------------------------------------------

    pub fn load(&mut self) -> Result<(), GmPackError> {
        let path = self.path.clone().ok_or(GmPackError::InvalidPackage)?;
        let mut file = File::open(&path).map_err(|_| GmPackError::IoOpen(path.clone()))?;
        let host_size = file
            .metadata()
            .map_err(|_| GmPackError::IoRead(path.clone()))?
            .len() as i64;

        if host_size < TRAILER_LEN {
            return Err(GmPackError::FormatTruncated(path));
        }

        file.seek(SeekFrom::Start((host_size - TRAILER_LEN) as u64))?;
        let trailer = PackageTrailer::read(&mut file)?;

        if trailer.record_count <= 0 || trailer.total_size <= 0 || trailer.index_start < 0 {
            return Err(GmPackError::FormatTrailer(
                "trailer field is non-positive".to_string(),
            ));
        }
        if host_size < trailer.total_size {
            return Err(GmPackError::FormatTrailer(
                "host file is smaller than the recorded archive size".to_string(),
            ));
        }

        let start_offset = host_size - trailer.total_size;
        let index_abs = trailer.index_start + start_offset;
        let index_region_len = trailer.total_size - trailer.index_start - TRAILER_LEN;
        if index_region_len < 1 {
            return Err(GmPackError::FormatTrailer(
                "index region has non-positive length".to_string(),
            ));
        }

        file.seek(SeekFrom::Start(index_abs as u64))?;
        let mut flag_byte = [0u8; 1];
        file.read_exact(&mut flag_byte)?;
        let index_compress_flag = flag_byte[0] != 0;

        let mut index_buf = vec![0u8; (index_region_len - 1) as usize];
        file.read_exact(&mut index_buf)?;
        codec::obfuscate(&mut index_buf);

        let record_buf = if index_compress_flag {
            codec::decompress(&index_buf)?
        } else {
            index_buf
        };

        let mut cursor = &record_buf[..];
        let mut records = Vec::with_capacity(trailer.record_count.max(0) as usize);
        for _ in 0..trailer.record_count {
            records.push(FileRecord::read(&mut cursor)?);
        }

        file.seek(SeekFrom::Start(start_offset as u64))?;
        let header = PackageHeader::read(&mut file)?;

        debug!(
            path = %path.display(),
            start_offset,
            record_count = records.len(),
            "loaded package"
        );

        self.records = records;
        self.header = header;
        self.start_offset = start_offset;
        Ok(())
    }

    // ---- header ----------------------------------------------------------

    pub fn write_header(&self, file: &mut File, start_offset: i64) -> Result<(), GmPackError> {
        file.seek(SeekFrom::Start(start_offset as u64))?;
        self.header.write(file)?;
        Ok(())
    }

    // ---- payload I/O -------------------------------------------------------

    fn write_data_block(&self, file: &mut File, data: &[u8]) -> Result<(), GmPackError> {
        let mut buf = data.to_vec();
        codec::obfuscate(&mut buf);
        file.write_all(&buf)?;
        Ok(())
    }

    fn read_data_block(&self, file: &mut File, len: usize) -> Result<Vec<u8>, GmPackError> {
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        codec::obfuscate(&mut buf);
        Ok(buf)
    }

    /// Writes `data` at the file's current position, filling in
    /// `record.position/compressedLen/originalLen/compressFlag`. The caller
    /// must already have set `record.filename`/`permissions`/`tag`.
    pub fn write_data_file(
        &self,
        file: &mut File,
        data: &[u8],
        record: &mut FileRecord,
    ) -> Result<(), GmPackError> {
        let abs_pos = file.stream_position()?;
        record.position = abs_pos as i64 - self.start_offset;
        record.original_len = data.len() as i64;

        let attempt_compress =
            self.header.body_compress_flag && record.original_len <= codec::MAX_COMPRESSIBLE_LEN;

        let payload = if attempt_compress {
            let compressed = codec::compress(data, self.compression_level)?;
            if compressed.is_empty() {
                record.compress_flag = false;
                record.compressed_len = record.original_len;
                data.to_vec()
            } else {
                record.compress_flag = true;
                record.compressed_len = compressed.len() as i64;
                compressed
            }
        } else {
            record.compress_flag = false;
            record.compressed_len = record.original_len;
            data.to_vec()
        };

        debug!(
            filename = %record.filename,
            position = record.position,
            compressed = record.compress_flag,
            len = record.compressed_len,
            "writing data file"
        );
        self.write_data_block(file, &payload)
    }

    /// Reads back the payload for `record`. Empty files (`originalLen == 0`)
    /// return an empty vector without any seek or read.
    pub fn read_data_file(&self, file: &mut File, record: &FileRecord) -> Result<Vec<u8>, GmPackError> {
        if record.original_len == 0 {
            return Ok(Vec::new());
        }
        let abs_pos = record.position + self.start_offset;
        file.seek(SeekFrom::Start(abs_pos as u64))?;
        let raw = self.read_data_block(file, record.compressed_len as usize)?;
        if record.compress_flag {
            codec::decompress_expect(&raw, record.original_len)
        } else {
            Ok(raw)
        }
    }

    // ---- record list maintenance -----------------------------------------

    pub fn append_file_info(&mut self, record: FileRecord) -> Result<(), GmPackError> {
        if self
            .records
            .iter()
            .any(|r| !r.delete_flag && r.filename == record.filename)
        {
            return Err(GmPackError::DuplicateFilename(record.filename));
        }
        self.records.push(record);
        Ok(())
    }

    /// Tombstones the first live record matching `filename`. Returns whether
    /// a match was found; no physical reclaim happens.
    pub fn remove_data_file(&mut self, filename: &str) -> bool {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| !r.delete_flag && r.filename == filename)
        {
            record.delete_flag = true;
            true
        } else {
            false
        }
    }

    pub fn set_global_tag(&mut self, tag: i32) {
        for record in self.records.iter_mut().filter(|r| !r.delete_flag) {
            record.tag = tag;
        }
    }

    /// The offset, relative to the archive start, right past the last byte
    /// of payload data — i.e. where the index region belongs. Must be
    /// derived from the *maximum* of `position + compressedLen` across all
    /// records, not from `records.last()`: symlink and empty-file records
    /// never go through `write_data_file`, so they keep `position == 0`,
    /// and the walker deliberately orders symlinks after regular files.
    fn payload_end(&self) -> Result<i64, GmPackError> {
        self.records
            .iter()
            .map(|r| r.position + r.compressed_len)
            .max()
            .ok_or_else(|| GmPackError::FormatTrailer("no file information to save".to_string()))
    }

    /// Serializes the whole record list (live and tombstoned) to the index
    /// region right after the last payload block, then (re)writes the
    /// trailer and truncates the file.
    pub fn save_file_info(&mut self, file: &mut File) -> Result<(), GmPackError> {
        let index_start = self.payload_end()?;
        let abs_pos = index_start + self.start_offset;
        file.seek(SeekFrom::Start(abs_pos as u64))?;

        let mut record_buf = Vec::new();
        for record in &self.records {
            record.write(&mut record_buf)?;
        }

        let (index_compress_flag, index_payload) = if self.header.body_compress_flag {
            let compressed = codec::compress(&record_buf, self.compression_level)?;
            if compressed.is_empty() {
                (false, record_buf)
            } else {
                (true, compressed)
            }
        } else {
            (false, record_buf)
        };

        let mut obfuscated = index_payload;
        codec::obfuscate(&mut obfuscated);
        file.write_u8(index_compress_flag as u8)?;
        file.write_all(&obfuscated)?;

        let end_pos = file.stream_position()? as i64;
        let trailer = PackageTrailer {
            record_count: self.records.len() as i32,
            index_start,
            total_size: end_pos - self.start_offset + TRAILER_LEN,
        };
        trailer.write(file)?;
        file.flush()?;
        file.set_len(file.stream_position()?)?;

        debug!(
            record_count = trailer.record_count,
            index_start = trailer.index_start,
            total_size = trailer.total_size,
            "saved file info"
        );
        Ok(())
    }

    /// Appends every live record of `other`'s package onto the current one,
    /// opened read-write at `file`.
    pub fn append_package(&mut self, file: &mut File, other_path: &Path) -> Result<(), GmPackError> {
        let mut other = PackageManager::open(other_path)?;
        let mut other_file =
            File::open(other_path).map_err(|_| GmPackError::IoOpen(other_path.to_path_buf()))?;

        let seek_pos = self.payload_end()? + self.start_offset;
        file.seek(SeekFrom::Start(seek_pos as u64))?;

        let other_records: Vec<FileRecord> = other
            .records
            .iter()
            .filter(|r| !r.delete_flag)
            .cloned()
            .collect();

        for other_record in other_records {
            let mut new_record = other_record.clone();
            if other_record.original_len == 0 {
                self.append_file_info(new_record)?;
            } else {
                let data = other.read_data_file(&mut other_file, &other_record)?;
                self.write_data_file(file, &data, &mut new_record)?;
                self.append_file_info(new_record)?;
            }
        }

        self.save_file_info(file)
    }

    // ---- accessors ---------------------------------------------------------

    pub fn file_exists(&self, filename: &str) -> bool {
        self.records.iter().any(|r| !r.delete_flag && r.filename == filename)
    }

    pub fn index_of(&self, filename: &str) -> Option<usize> {
        self.records.iter().position(|r| !r.delete_flag && r.filename == filename)
    }

    pub fn file_info(&self, index: usize) -> Option<&FileRecord> {
        self.records.get(index).filter(|r| !r.delete_flag)
    }

    pub fn file_info_by_name(&self, filename: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| !r.delete_flag && r.filename == filename)
    }

    pub fn filenames(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.delete_flag)
            .map(|r| r.filename.clone())
            .collect()
    }

    pub fn file_number(&self) -> usize {
        self.records.iter().filter(|r| !r.delete_flag).count()
    }

    pub fn file_number_for_tags(&self, tags: &[i32]) -> usize {
        self.records
            .iter()
            .filter(|r| !r.delete_flag && tags.contains(&r.tag))
            .count()
    }

    pub fn file_data_size(&self, records: &[FileRecord]) -> i64 {
        records.iter().map(|r| r.original_len).sum()
    }

    /// First-level subdirectory names directly under `start_dir` (empty
    /// string means the archive root).
    pub fn dir_names(&self, start_dir: &str) -> Vec<String> {
        let prefix = dir_prefix(start_dir);
        let mut set = BTreeSet::new();
        for record in self.records.iter().filter(|r| !r.delete_flag) {
            let name = if prefix.is_empty() {
                record.filename.as_str()
            } else if let Some(rest) = record.filename.strip_prefix(&prefix) {
                rest
            } else {
                continue;
            };
            if let Some(idx) = name.find('/') {
                if idx > 0 {
                    set.insert(name[..idx].to_string());
                }
            }
        }
        set.into_iter().collect()
    }

    /// Records directly (or recursively) under `dir`, matching the
    /// `getFileInfoList(dirName, containsSubdir, ...)` overload.
    pub fn file_info_list_in_dir(&self, dir: &str, contains_subdir: bool) -> Vec<FileRecord> {
        let prefix = dir_prefix(dir);
        self.records
            .iter()
            .filter(|r| !r.delete_flag)
            .filter(|r| {
                if prefix.is_empty() {
                    return true;
                }
                match r.filename.strip_prefix(&prefix) {
                    Some(rest) => contains_subdir || !rest.contains('/'),
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    /// The 3-way filter used at install time: tag list narrows the base set;
    /// directory list (always recursive) and filename list are then unioned
    /// together, falling back to the tag-filtered base when both are empty.
    pub fn filtered_file_info_list(
        &self,
        tags: &[i32],
        dirs: &[String],
        filenames: &[String],
    ) -> Vec<FileRecord> {
        let base: Vec<&FileRecord> = self
            .records
            .iter()
            .filter(|r| !r.delete_flag)
            .filter(|r| tags.is_empty() || tags.contains(&r.tag))
            .collect();

        let by_dir: Vec<&FileRecord> = if dirs.is_empty() {
            Vec::new()
        } else {
            base.iter()
                .copied()
                .filter(|r| dirs.iter().any(|d| r.filename.starts_with(&dir_prefix(d))))
                .collect()
        };

        let by_name: Vec<&FileRecord> = if filenames.is_empty() {
            Vec::new()
        } else {
            base.iter()
                .copied()
                .filter(|r| filenames.iter().any(|f| f == &r.filename))
                .collect()
        };

        if !by_dir.is_empty() || !by_name.is_empty() {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for record in by_dir.into_iter().chain(by_name) {
                if seen.insert(record.filename.clone()) {
                    out.push(record.clone());
                }
            }
            out
        } else {
            base.into_iter().cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn build_minimal_package(compress: bool) -> (PackageManager, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let mut file = tmp.reopen().unwrap();
        let mut manager = PackageManager::new();
        manager.set_compress_flag(compress);
        manager.write_header(&mut file, 0).unwrap();

        let mut record = FileRecord::new("hello.txt");
        manager.write_data_file(&mut file, b"hello, world!", &mut record).unwrap();
        manager.append_file_info(record).unwrap();
        manager.save_file_info(&mut file).unwrap();
        (manager, tmp)
    }

    #[test]
    fn round_trips_a_single_file_uncompressed() {
        let (_manager, tmp) = build_minimal_package(false);
        let mut loaded = PackageManager::open(tmp.path()).unwrap();
        assert!(loaded.is_valid());
        assert_eq!(loaded.file_number(), 1);
        let mut file = File::open(tmp.path()).unwrap();
        let record = loaded.file_info_by_name("hello.txt").unwrap().clone();
        let data = loaded.read_data_file(&mut file, &record).unwrap();
        assert_eq!(data, b"hello, world!");
        let _ = &mut loaded;
    }

    #[test]
    fn round_trips_a_single_file_compressed() {
        let (_manager, tmp) = build_minimal_package(true);
        let loaded = PackageManager::open(tmp.path()).unwrap();
        let mut file = File::open(tmp.path()).unwrap();
        let record = loaded.file_info_by_name("hello.txt").unwrap().clone();
        let data = loaded.read_data_file(&mut file, &record).unwrap();
        assert_eq!(data, b"hello, world!");
    }

    #[test]
    fn tombstone_survives_reload() {
        let (_manager, tmp) = build_minimal_package(false);
        let mut loaded = PackageManager::open(tmp.path()).unwrap();
        assert!(loaded.remove_data_file("hello.txt"));
        assert!(!loaded.file_exists("hello.txt"));

        let mut file = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
        loaded.save_file_info(&mut file).unwrap();
        drop(file);

        let reloaded = PackageManager::open(tmp.path()).unwrap();
        assert!(!reloaded.file_exists("hello.txt"));
        assert_eq!(reloaded.records().len(), 1);
        assert!(reloaded.records()[0].delete_flag);
    }

    #[test]
    fn duplicate_filename_is_rejected() {
        let mut manager = PackageManager::new();
        manager.append_file_info(FileRecord::new("a.txt")).unwrap();
        let err = manager.append_file_info(FileRecord::new("a.txt")).unwrap_err();
        assert!(matches!(err, GmPackError::DuplicateFilename(_)));
    }

    #[test]
    fn offset_tolerant_load_after_prefix_concatenation() {
        let (_manager, tmp) = build_minimal_package(false);
        let archive_bytes = std::fs::read(tmp.path()).unwrap();

        let mut combined = NamedTempFile::new().unwrap();
        combined.write_all(b"#!/bin/sh\nexit 0\n").unwrap();
        combined.write_all(&archive_bytes).unwrap();
        combined.flush().unwrap();

        let loaded = PackageManager::open(combined.path()).unwrap();
        assert!(loaded.start_offset() > 0);
        assert!(loaded.file_exists("hello.txt"));
    }

    #[test]
    fn filtered_file_info_list_unions_dir_and_name() {
        let mut manager = PackageManager::new();
        let mut a = FileRecord::new("docs/a.txt");
        a.tag = 1;
        let mut b = FileRecord::new("docs/sub/b.txt");
        b.tag = 1;
        let mut c = FileRecord::new("src/c.txt");
        c.tag = 2;
        manager.append_file_info(a).unwrap();
        manager.append_file_info(b).unwrap();
        manager.append_file_info(c).unwrap();

        let filtered =
            manager.filtered_file_info_list(&[], &["docs".to_string()], &["src/c.txt".to_string()]);
        let names: HashSet<_> = filtered.iter().map(|r| r.filename.clone()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains("docs/a.txt"));
        assert!(names.contains("docs/sub/b.txt"));
        assert!(names.contains("src/c.txt"));
    }

    #[test]
    fn dir_names_lists_immediate_children_only() {
        let mut manager = PackageManager::new();
        manager.append_file_info(FileRecord::new("docs/a.txt")).unwrap();
        manager.append_file_info(FileRecord::new("docs/sub/b.txt")).unwrap();
        manager.append_file_info(FileRecord::new("src/c.txt")).unwrap();

        let mut top = manager.dir_names("");
        top.sort();
        assert_eq!(top, vec!["docs".to_string(), "src".to_string()]);

        let docs = manager.dir_names("docs");
        assert_eq!(docs, vec!["sub".to_string()]);
    }
}
