//! Builds a fresh package from a directory tree, or appends further trees
//! onto an existing one. Grounded on
//! `original_source/gmpackagebuilder.{h,cpp}`.

use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::GmPackError;
use crate::manager::PackageManager;
use crate::progress::{NullSink, ProgressSink};
use crate::record::{self, FileRecord};
use crate::walker::{walk_tree, WalkedEntry};

pub struct Builder {
    file_sort: i32,
    compress_flag: bool,
    compression_level: i32,
    start_dir: Option<PathBuf>,
    file_list: Vec<WalkedEntry>,
    package_filename: PathBuf,
    errors: Vec<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            file_sort: 0,
            compress_flag: true,
            compression_level: 9,
            start_dir: None,
            file_list: Vec::new(),
            package_filename: PathBuf::new(),
            errors: Vec::new(),
        }
    }
}

fn lexically_normalize(path: &Path) -> PathBuf {
    let mut stack: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(stack.last(), Some(Component::Normal(_))) {
                    stack.pop();
                } else {
                    stack.push(component);
                }
            }
            Component::CurDir => {}
            other => stack.push(other),
        }
    }
    stack.iter().collect()
}

fn path_to_record_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn unix_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode() & 0o777
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &fs::Metadata) -> u32 {
    record::permissions_to_mode(record::DEFAULT_PERMISSIONS)
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_compress_flag(&mut self, flag: bool) {
        self.compress_flag = flag;
    }

    pub fn compress_flag(&self) -> bool {
        self.compress_flag
    }

    pub fn set_compression_level(&mut self, level: i32) {
        self.compression_level = level;
    }

    pub fn set_package_file_sort(&mut self, tag: i32) {
        self.file_sort = tag;
    }

    pub fn set_package_filename(&mut self, filename: impl Into<PathBuf>) {
        self.package_filename = filename.into();
    }

    /// Collects the file list for `source_dir` itself via `walk_tree`; the
    /// caller doesn't need to do it separately.
    pub fn set_source_dir(&mut self, source_dir: impl AsRef<Path>) -> Result<(), GmPackError> {
        let root = source_dir.as_ref();
        let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        self.file_list = walk_tree(root)?;
        self.start_dir = Some(canonical);
        Ok(())
    }

    pub fn clear_error_message(&mut self) {
        self.errors.clear();
    }

    pub fn error_message(&self) -> &[String] {
        &self.errors
    }

    pub fn build_package(&mut self) -> bool {
        self.build_package_with(&NullSink)
    }

    pub fn build_package_with(&mut self, sink: &dyn ProgressSink) -> bool {
        self.errors.clear();
        let ok = match self.build_inner(sink) {
            Ok(()) => true,
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        };
        sink.on_finished(ok);
        ok
    }

    fn build_inner(&mut self, sink: &dyn ProgressSink) -> Result<(), GmPackError> {
        let root = self
            .start_dir
            .clone()
            .ok_or(GmPackError::InvalidPackage)?;

        let mut file = File::create(&self.package_filename)
            .map_err(|_| GmPackError::IoOpen(self.package_filename.clone()))?;

        let mut manager = PackageManager::new();
        manager.set_compress_flag(self.compress_flag);
        manager.set_compression_level(self.compression_level);
        manager.write_header(&mut file, 0)?;

        let file_list = self.file_list.clone();
        for (index, entry) in file_list.iter().enumerate() {
            let display_name = entry.relative_path.to_string_lossy().into_owned();
            sink.on_file(&display_name, index);

            let mut record = FileRecord::new(path_to_record_name(&entry.relative_path));
            record.tag = self.file_sort;

            if entry.is_symlink {
                self.append_symlink_entry(&mut manager, &root, entry, &mut record)?;
                sink.on_progress(&display_name, 100);
                continue;
            }

            let abs_path = root.join(&entry.relative_path);
            let metadata = fs::symlink_metadata(&abs_path)?;
            record.permissions = record::permissions_from_mode(unix_mode(&metadata));

            let data = fs::read(&abs_path)?;
            if data.is_empty() {
                manager.append_file_info(record)?;
            } else {
                manager.write_data_file(&mut file, &data, &mut record)?;
                manager.append_file_info(record)?;
            }
            sink.on_progress(&display_name, 100);
        }

        manager.save_file_info(&mut file)
    }

    fn append_symlink_entry(
        &self,
        manager: &mut PackageManager,
        root: &Path,
        entry: &WalkedEntry,
        record: &mut FileRecord,
    ) -> Result<(), GmPackError> {
        let target = entry.symlink_target.clone().unwrap_or_default();
        let abs_path = root.join(&entry.relative_path);
        let resolved = lexically_normalize(&abs_path.parent().unwrap_or(root).join(&target));
        let root_norm = lexically_normalize(root);

        if let Ok(root_relative) = resolved.strip_prefix(&root_norm) {
            record.is_symlink = true;
            record.symlink_target = Some(path_to_record_name(root_relative));
        } else {
            warn!(
                file = %entry.relative_path.display(),
                target = %target.display(),
                "symlink target escapes the source tree, storing an empty file instead"
            );
        }
        manager.append_file_info(record.clone())
    }

    /// Appends `source_dir`'s file tree onto the existing package, or builds
    /// one from scratch if the package doesn't exist yet. Unlike a fresh
    /// build, per-file read failures are skipped rather than aborting the
    /// whole operation, and symlinks are not carried over (an asymmetry
    /// inherited from the original tool's append path).
    pub fn append_file_list_to_package(&mut self) -> bool {
        self.append_file_list_to_package_with(&NullSink)
    }

    pub fn append_file_list_to_package_with(&mut self, sink: &dyn ProgressSink) -> bool {
        self.errors.clear();
        if !self.package_filename.exists() {
            return self.build_package_with(sink);
        }
        let ok = match self.append_inner(sink) {
            Ok(()) => true,
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        };
        sink.on_finished(ok);
        ok
    }

    fn append_inner(&mut self, sink: &dyn ProgressSink) -> Result<(), GmPackError> {
        let root = self
            .start_dir
            .clone()
            .ok_or(GmPackError::InvalidPackage)?;

        let mut manager = PackageManager::open(&self.package_filename)?;
        if !manager.is_valid() {
            return self.build_inner(sink);
        }
        manager.set_compression_level(self.compression_level);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.package_filename)
            .map_err(|_| GmPackError::IoOpen(self.package_filename.clone()))?;

        let file_list = self.file_list.clone();
        for (index, entry) in file_list.iter().enumerate() {
            if entry.is_symlink {
                continue;
            }
            let display_name = entry.relative_path.to_string_lossy().into_owned();
            sink.on_file(&display_name, index);

            let abs_path = root.join(&entry.relative_path);
            let data = match fs::read(&abs_path) {
                Ok(data) => data,
                Err(e) => {
                    self.errors.push(format!("{}: {}", display_name, e));
                    continue;
                }
            };
            let metadata = match fs::symlink_metadata(&abs_path) {
                Ok(m) => m,
                Err(e) => {
                    self.errors.push(format!("{}: {}", display_name, e));
                    continue;
                }
            };

            let mut record = FileRecord::new(path_to_record_name(&entry.relative_path));
            record.tag = self.file_sort;
            record.permissions = record::permissions_from_mode(unix_mode(&metadata));

            if data.is_empty() {
                if let Err(e) = manager.append_file_info(record) {
                    self.errors.push(e.to_string());
                }
            } else {
                let result = manager
                    .write_data_file(&mut file, &data, &mut record)
                    .and_then(|()| manager.append_file_info(record));
                if let Err(e) = result {
                    self.errors.push(e.to_string());
                }
            }
            sink.on_progress(&display_name, 100);
        }

        manager.save_file_info(&mut file)?;
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(GmPackError::PartialFailure(format!(
                "{} of {} file(s) failed to append",
                self.errors.len(),
                file_list.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn builds_a_package_from_a_tree() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"aaa").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), b"bbb").unwrap();
        fs::write(src.path().join("empty.txt"), b"").unwrap();

        let out_dir = tempdir().unwrap();
        let package_path = out_dir.path().join("out.pkg");

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());

        let manager = PackageManager::open(&package_path).unwrap();
        assert_eq!(manager.file_number(), 3);
        assert!(manager.file_exists("a.txt"));
        assert!(manager.file_exists("sub/b.txt"));
        assert!(manager.file_exists("empty.txt"));
    }

    #[test]
    fn symlink_inside_tree_is_preserved() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("real.txt"), b"data").unwrap();
        symlink("real.txt", src.path().join("link.txt")).unwrap();

        let out_dir = tempdir().unwrap();
        let package_path = out_dir.path().join("out.pkg");

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());

        let manager = PackageManager::open(&package_path).unwrap();
        let link = manager.file_info_by_name("link.txt").unwrap();
        assert!(link.is_symlink);
        assert_eq!(link.symlink_target.as_deref(), Some("real.txt"));
    }

    #[test]
    fn symlink_escaping_tree_becomes_empty_file() {
        let src = tempdir().unwrap();
        symlink("/etc/passwd", src.path().join("escape.txt")).unwrap();

        let out_dir = tempdir().unwrap();
        let package_path = out_dir.path().join("out.pkg");

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());

        let manager = PackageManager::open(&package_path).unwrap();
        let record = manager.file_info_by_name("escape.txt").unwrap();
        assert!(!record.is_symlink);
        assert_eq!(record.original_len, 0);
    }

    #[test]
    fn append_adds_to_an_existing_package() {
        let src1 = tempdir().unwrap();
        fs::write(src1.path().join("a.txt"), b"aaa").unwrap();
        let src2 = tempdir().unwrap();
        fs::write(src2.path().join("b.txt"), b"bbb").unwrap();

        let out_dir = tempdir().unwrap();
        let package_path = out_dir.path().join("out.pkg");

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_source_dir(src1.path()).unwrap();
        assert!(builder.build_package());

        builder.set_source_dir(src2.path()).unwrap();
        assert!(builder.append_file_list_to_package());

        let manager = PackageManager::open(&package_path).unwrap();
        assert_eq!(manager.file_number(), 2);
        assert!(manager.file_exists("a.txt"));
        assert!(manager.file_exists("b.txt"));
    }
}
