//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// Read file contents with standardized error handling.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

/// Copy the tree under `source` into `dest`, skipping VCS metadata.
///
/// `dest` is created if missing. Symlinks are recreated, not followed.
/// Returns the number of files copied.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    let io_err = |e: String| Error::internal_io(e, Some(format!("copy {}", source.display())));

    fs::create_dir_all(dest).map_err(|e| io_err(e.to_string()))?;

    let mut copied = 0usize;
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_vcs_dir(entry.file_name()));

    for entry in walker {
        let entry = entry.map_err(|e| io_err(e.to_string()))?;
        let relative = entry.path().strip_prefix(source).map_err(|e| io_err(e.to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(e.to_string()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| io_err(e.to_string()))?;
            copy_symlink(&link, &target).map_err(|e| io_err(e.to_string()))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_err(e.to_string()))?;
            copied += 1;
        }
    }

    Ok(copied)
}

fn is_vcs_dir(name: &std::ffi::OsStr) -> bool {
    matches!(name.to_str(), Some(".git" | ".svn" | ".hg"))
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(_link: &Path, target: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {}", target.display()),
    ))
}

/// Remove a file or directory, ignoring errors.
///
/// Returns whether something was removed.
pub fn remove_quietly(path: &Path) -> bool {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return false,
    };
    result.is_ok()
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("open {}", path.display()))))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buf)
            .map_err(|e| Error::internal_io(e.to_string(), Some(format!("read {}", path.display()))))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn read_file_returns_error_for_missing_file() {
        let err = read_file(Path::new("/nonexistent/path.txt"), "test read").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }

    #[test]
    fn copy_tree_skips_git_metadata() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(src.path().join("public/css")).unwrap();
        fs::write(src.path().join("index.php"), "<?php").unwrap();
        fs::write(src.path().join("public/css/app.css"), "body{}").unwrap();

        let dest = TempDir::new().unwrap();
        let target = dest.path().join("1_2_20240101_000000");
        let copied = copy_tree(src.path(), &target).unwrap();

        assert_eq!(copied, 2);
        assert!(target.join("index.php").is_file());
        assert!(target.join("public/css/app.css").is_file());
        assert!(!target.join(".git").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_preserves_symlinks() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", src.path().join("alias.txt")).unwrap();

        let dest = TempDir::new().unwrap();
        copy_tree(src.path(), dest.path()).unwrap();

        let link = fs::read_link(dest.path().join("alias.txt")).unwrap();
        assert_eq!(link, Path::new("real.txt"));
    }

    #[test]
    fn remove_quietly_handles_files_dirs_and_missing() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("stage");
        fs::create_dir_all(nested.join("a")).unwrap();
        let file = dir.path().join("pkg.zip");
        fs::write(&file, "zip").unwrap();

        assert!(remove_quietly(&nested));
        assert!(remove_quietly(&file));
        assert!(!remove_quietly(&file));
        assert!(!nested.exists());
    }

    #[test]
    fn sha256_of_known_content() {
        let mut temp = NamedTempFile::new().unwrap();
        write!(temp, "abc").unwrap();
        assert_eq!(
            sha256_file(temp.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
