//! Directory tree walker: collects the file list a builder packages.
//!
//! Grounded on `GmPackageBuilder::getFileList` /
//! `removeStartDirNameFromFilePath`: regular files are collected first,
//! symlinks are collected separately and appended at the end of the list,
//! and every path returned is relative to `root`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WalkedEntry {
    pub relative_path: PathBuf,
    pub is_symlink: bool,
    /// Raw `readlink` target, only set when `is_symlink`.
    pub symlink_target: Option<PathBuf>,
}

pub fn walk_tree(root: &Path) -> io::Result<Vec<WalkedEntry>> {
    let mut files = Vec::new();
    let mut symlinks = Vec::new();
    walk_into(root, root, &mut files, &mut symlinks)?;
    files.extend(symlinks);
    Ok(files)
}

fn walk_into(
    root: &Path,
    dir: &Path,
    files: &mut Vec<WalkedEntry>,
    symlinks: &mut Vec<WalkedEntry>,
) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)?;
        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_path_buf();

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            symlinks.push(WalkedEntry {
                relative_path,
                is_symlink: true,
                symlink_target: Some(target),
            });
        } else if metadata.is_dir() {
            walk_into(root, &path, files, symlinks)?;
        } else {
            files.push(WalkedEntry {
                relative_path,
                is_symlink: false,
                symlink_target: None,
            });
        }
    }
    Ok(())
}
