//! Reconstructs a directory tree from a package. Grounded on
//! `original_source/gmpackageinstaller.{h,cpp}`.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::GmPackError;
use crate::manager::PackageManager;
use crate::progress::{NullSink, ProgressSink};
use crate::record::{self, FileRecord};

pub struct Installer {
    start_dir: PathBuf,
    package_filename: PathBuf,
    sort_list: Vec<i32>,
    dir_name_list: Vec<String>,
    filename_list: Vec<String>,
    errors: Vec<String>,
}

impl Installer {
    pub fn new(start_dir: impl Into<PathBuf>) -> Self {
        Installer {
            start_dir: start_dir.into(),
            package_filename: PathBuf::new(),
            sort_list: Vec::new(),
            dir_name_list: Vec::new(),
            filename_list: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn set_start_dir_name(&mut self, dir: impl Into<PathBuf>) {
        self.start_dir = dir.into();
    }

    pub fn set_package_filename(&mut self, filename: impl Into<PathBuf>) {
        self.package_filename = filename.into();
    }

    pub fn set_sort_list(&mut self, tags: Vec<i32>) {
        self.sort_list = tags;
    }

    pub fn clear_sort_list(&mut self) {
        self.sort_list.clear();
    }

    pub fn set_dir_name_list(&mut self, dirs: Vec<String>) {
        self.dir_name_list = dirs;
    }

    pub fn clear_dir_name_list(&mut self) {
        self.dir_name_list.clear();
    }

    pub fn set_filename_list(&mut self, filenames: Vec<String>) {
        self.filename_list = filenames;
    }

    pub fn clear_filename_list(&mut self) {
        self.filename_list.clear();
    }

    pub fn clear_error_message(&mut self) {
        self.errors.clear();
    }

    pub fn error_message(&self) -> &[String] {
        &self.errors
    }

    /// Live file count the package holds, restricted to `sort_list` when
    /// it is non-empty. Doesn't touch directory/filename filters.
    pub fn package_file_number(&self) -> Result<usize, GmPackError> {
        let manager = PackageManager::open(&self.package_filename)?;
        Ok(if self.sort_list.is_empty() {
            manager.file_number()
        } else {
            manager.file_number_for_tags(&self.sort_list)
        })
    }

    pub fn install_package(&mut self) -> bool {
        self.install_package_with(&NullSink)
    }

    pub fn install_package_with(&mut self, sink: &dyn ProgressSink) -> bool {
        self.errors.clear();
        let ok = match self.install_inner(sink) {
            Ok(()) => true,
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        };
        sink.on_finished(ok);
        ok
    }

    fn install_inner(&mut self, sink: &dyn ProgressSink) -> Result<(), GmPackError> {
        let manager = PackageManager::open(&self.package_filename)?;
        if !manager.is_valid() {
            return Err(GmPackError::InvalidPackage);
        }
        let mut file = File::open(&self.package_filename)
            .map_err(|_| GmPackError::IoOpen(self.package_filename.clone()))?;

        let filtered =
            manager.filtered_file_info_list(&self.sort_list, &self.dir_name_list, &self.filename_list);
        if filtered.is_empty() {
            return Err(GmPackError::FilterMiss);
        }

        for (index, record) in filtered.iter().enumerate() {
            sink.on_file(&record.filename, index);
            if let Err(e) = self.install_record(&manager, &mut file, record) {
                self.errors.push(format!("{}: {}", record.filename, e));
            }
            sink.on_progress(&record.filename, 100);
        }
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(GmPackError::PartialFailure(format!(
                "{} of {} file(s) failed to install",
                self.errors.len(),
                filtered.len()
            )))
        }
    }

    /// Installs a single named file, regardless of `sort_list`/directory
    /// filters already configured.
    pub fn install_file(&mut self, filename: &str) -> bool {
        self.errors.clear();
        let ok = match self.install_file_inner(filename) {
            Ok(()) => true,
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        };
        ok
    }

    fn install_file_inner(&self, filename: &str) -> Result<(), GmPackError> {
        let manager = PackageManager::open(&self.package_filename)?;
        let record = manager
            .file_info_by_name(filename)
            .cloned()
            .ok_or(GmPackError::FilterMiss)?;
        let mut file = File::open(&self.package_filename)
            .map_err(|_| GmPackError::IoOpen(self.package_filename.clone()))?;
        self.install_record(&manager, &mut file, &record)
    }

    /// Installs every live record directly or recursively under `dir`.
    pub fn install_files_in_dir(&mut self, dir: &str, contains_subdir: bool) -> bool {
        self.errors.clear();
        let ok = match self.install_files_in_dir_inner(dir, contains_subdir) {
            Ok(()) => true,
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        };
        ok
    }

    fn install_files_in_dir_inner(&self, dir: &str, contains_subdir: bool) -> Result<(), GmPackError> {
        let manager = PackageManager::open(&self.package_filename)?;
        let records = manager.file_info_list_in_dir(dir, contains_subdir);
        if records.is_empty() {
            return Err(GmPackError::FilterMiss);
        }
        let mut file = File::open(&self.package_filename)
            .map_err(|_| GmPackError::IoOpen(self.package_filename.clone()))?;
        for record in &records {
            self.install_record(&manager, &mut file, record)?;
        }
        Ok(())
    }

    fn install_record(
        &self,
        manager: &PackageManager,
        file: &mut File,
        record: &FileRecord,
    ) -> Result<(), GmPackError> {
        let dest = self.start_dir.join(&record.filename);
        let parent = dest.parent().unwrap_or(&self.start_dir).to_path_buf();
        self.create_path(&parent)?;
        self.make_writable_if_exists(&dest)?;

        if record.is_symlink {
            // A broken symlink (target not yet installed, or target created
            // after the link) is reported but does not abort the install.
            if let Err(e) = self.create_symlink(&dest, record) {
                warn!(file = %record.filename, error = %e, "failed to create symlink, continuing");
            }
        } else if record.original_len == 0 {
            self.create_empty_file(&dest, record)?;
        } else {
            let data = manager.read_data_file(file, record)?;
            self.create_data_file(&dest, &data, record)?;
        }
        Ok(())
    }

    fn create_path(&self, dir: &Path) -> Result<(), GmPackError> {
        if dir.exists() && !dir.is_dir() {
            return Err(GmPackError::PathConflict(dir.to_path_buf()));
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }

    #[cfg(unix)]
    fn make_writable_if_exists(&self, path: &Path) -> Result<(), GmPackError> {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::symlink_metadata(path) {
            if metadata.is_file() {
                let mut perms = metadata.permissions();
                if perms.mode() & 0o200 == 0 {
                    perms.set_mode(perms.mode() | 0o200);
                    fs::set_permissions(path, perms)?;
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn make_writable_if_exists(&self, _path: &Path) -> Result<(), GmPackError> {
        Ok(())
    }

    /// `record.symlink_target` is stored relative to the package root (see
    /// `builder::append_symlink_entry`), so it must be resolved against
    /// `self.start_dir` and then re-expressed relative to the link's own
    /// parent directory before it's written to disk, matching
    /// `QDir::relativeFilePath` in the original's `createSymbolicLink`.
    #[cfg(unix)]
    fn create_symlink(&self, dest: &Path, record: &FileRecord) -> Result<(), GmPackError> {
        use std::os::unix::fs::symlink;
        let root_relative_target = record.symlink_target.as_deref().unwrap_or_default();
        let absolute_target = lexically_normalize(&self.start_dir.join(root_relative_target));
        let link_parent = dest.parent().unwrap_or(&self.start_dir);
        let target = relative_from(link_parent, &absolute_target);

        if let Ok(existing) = fs::read_link(dest) {
            if existing == target {
                return Ok(());
            }
            fs::remove_file(dest)?;
        }
        symlink(&target, dest)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _dest: &Path, _record: &FileRecord) -> Result<(), GmPackError> {
        Ok(())
    }

    fn create_empty_file(&self, dest: &Path, record: &FileRecord) -> Result<(), GmPackError> {
        File::create(dest).map_err(|_| GmPackError::PermissionDenied(dest.to_path_buf()))?;
        self.apply_permissions(dest, record)
    }

    fn create_data_file(&self, dest: &Path, data: &[u8], record: &FileRecord) -> Result<(), GmPackError> {
        fs::write(dest, data).map_err(|_| GmPackError::PermissionDenied(dest.to_path_buf()))?;
        self.apply_permissions(dest, record)
    }

    #[cfg(unix)]
    fn apply_permissions(&self, dest: &Path, record: &FileRecord) -> Result<(), GmPackError> {
        use std::os::unix::fs::PermissionsExt;
        let mode = record::permissions_to_mode(record.permissions);
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_permissions(&self, _dest: &Path, _record: &FileRecord) -> Result<(), GmPackError> {
        Ok(())
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

/// Path from `base_dir` to `target`, both already absolute, without
/// touching the filesystem (the target may not exist yet).
fn relative_from(base_dir: &Path, target: &Path) -> PathBuf {
    let base_dir = lexically_normalize(base_dir);
    let target = lexically_normalize(target);

    let base_components: Vec<_> = base_dir.components().collect();
    let target_components: Vec<_> = target.components().collect();

    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..base_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component.as_os_str());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;

    fn build_sample_package(path: &Path) {
        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"aaa").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/b.txt"), b"bbb").unwrap();
        fs::write(src.path().join("empty.txt"), b"").unwrap();
        symlink("a.txt", src.path().join("link.txt")).unwrap();

        let mut builder = Builder::new();
        builder.set_package_filename(path);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());
    }

    #[test]
    fn installs_a_full_package() {
        let pkg_dir = tempdir().unwrap();
        let package_path = pkg_dir.path().join("out.pkg");
        build_sample_package(&package_path);

        let install_dir = tempdir().unwrap();
        let mut installer = Installer::new(install_dir.path());
        installer.set_package_filename(&package_path);
        assert!(installer.install_package());

        assert_eq!(fs::read(install_dir.path().join("a.txt")).unwrap(), b"aaa");
        assert_eq!(fs::read(install_dir.path().join("sub/b.txt")).unwrap(), b"bbb");
        assert_eq!(fs::read(install_dir.path().join("empty.txt")).unwrap(), b"");
        assert_eq!(
            fs::read_link(install_dir.path().join("link.txt")).unwrap(),
            Path::new("a.txt")
        );
    }

    #[test]
    fn install_restores_permissions() {
        let pkg_dir = tempdir().unwrap();
        let package_path = pkg_dir.path().join("out.pkg");

        let src = tempdir().unwrap();
        let exe_path = src.path().join("run.sh");
        fs::write(&exe_path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe_path, fs::Permissions::from_mode(0o755)).unwrap();

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());

        let install_dir = tempdir().unwrap();
        let mut installer = Installer::new(install_dir.path());
        installer.set_package_filename(&package_path);
        assert!(installer.install_package());

        let mode = fs::metadata(install_dir.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn install_file_installs_only_the_named_entry() {
        let pkg_dir = tempdir().unwrap();
        let package_path = pkg_dir.path().join("out.pkg");
        build_sample_package(&package_path);

        let install_dir = tempdir().unwrap();
        let mut installer = Installer::new(install_dir.path());
        installer.set_package_filename(&package_path);
        assert!(installer.install_file("sub/b.txt"));

        assert!(install_dir.path().join("sub/b.txt").exists());
        assert!(!install_dir.path().join("a.txt").exists());
    }

    #[test]
    fn tag_filtered_install_only_installs_matching_tags() {
        let pkg_dir = tempdir().unwrap();
        let package_path = pkg_dir.path().join("out.pkg");

        let src = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"aaa").unwrap();
        fs::write(src.path().join("b.txt"), b"bbb").unwrap();

        let mut builder = Builder::new();
        builder.set_package_filename(&package_path);
        builder.set_package_file_sort(1);
        builder.set_source_dir(src.path()).unwrap();
        assert!(builder.build_package());

        {
            use crate::manager::PackageManager;
            let mut manager = PackageManager::open(&package_path).unwrap();
            manager.set_global_tag(1);
            let mut file = fs::OpenOptions::new().write(true).open(&package_path).unwrap();
            manager.save_file_info(&mut file).unwrap();
        }

        let install_dir = tempdir().unwrap();
        let mut installer = Installer::new(install_dir.path());
        installer.set_package_filename(&package_path);
        installer.set_sort_list(vec![1]);
        assert!(installer.install_package());
        assert!(install_dir.path().join("a.txt").exists());
        assert!(install_dir.path().join("b.txt").exists());
    }
}
