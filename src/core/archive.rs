//! Release packaging.
//!
//! The staging directory is packed into a single zip archive which every
//! host unpacks into its release directory.

use glob_match::glob_match;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::utils::{parser, shell};

/// How a project's pattern list is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Patterns name paths left out of the package.
    #[default]
    Exclude,
    /// Patterns name the only paths put in the package.
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    mode: FilterMode,
    patterns: Vec<String>,
}

impl FileFilter {
    pub fn new(mode: FilterMode, patterns: Vec<String>) -> Self {
        Self { mode, patterns }
    }

    /// Patterns one per line; comment lines are ignored.
    pub fn from_block(block: &str, mode: FilterMode) -> Self {
        Self::new(mode, parser::parse_commands(block))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `relative` (slash-separated, relative to the package root)
    /// belongs in the package. A path matches when it, its file name, or
    /// any ancestor directory matches a pattern.
    pub fn allows(&self, relative: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let matched = self.matches(relative);
        match self.mode {
            FilterMode::Exclude => !matched,
            FilterMode::Include => matched,
        }
    }

    fn matches(&self, relative: &str) -> bool {
        let mut candidates = vec![relative];
        let mut rest = relative;
        while let Some(idx) = rest.rfind('/') {
            rest = &rest[..idx];
            candidates.push(rest);
        }
        if let Some(name) = relative.rsplit('/').next() {
            candidates.push(name);
        }

        self.patterns.iter().any(|pattern| {
            let pattern = pattern.trim_end_matches('/');
            candidates
                .iter()
                .any(|candidate| candidate == &pattern || glob_match(pattern, candidate))
        })
    }
}

pub trait Archiver: Send + Sync {
    /// Pack `source_dir` into `archive`, honoring `filter`. Returns the number
    /// of files written.
    fn pack(&self, archive: &Path, source_dir: &Path, filter: &FileFilter) -> Result<usize>;

    /// Shell command that unpacks `archive` into `dest` on a host.
    fn unpack_command(&self, archive: &str, dest: &str) -> String;

    /// File extension of produced archives, without the dot.
    fn extension(&self) -> &'static str;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZipArchiver;

impl Archiver for ZipArchiver {
    fn pack(&self, archive: &Path, source_dir: &Path, filter: &FileFilter) -> Result<usize> {
        let package_err = |e: String| Error::deploy_package_failed(e);

        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent).map_err(|e| package_err(e.to_string()))?;
        }
        let file = File::create(archive).map_err(|e| package_err(e.to_string()))?;
        let mut zip = ZipWriter::new(file);
        let base = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut written = 0usize;
        for entry in WalkDir::new(source_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| package_err(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| package_err(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");

            if !filter.allows(&relative) {
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                zip.add_directory(format!("{}/", relative), base)
                    .map_err(|e| package_err(e.to_string()))?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| package_err(e.to_string()))?;
                zip.add_symlink(relative, target.to_string_lossy(), base)
                    .map_err(|e| package_err(e.to_string()))?;
            } else {
                let options = with_mode(base, entry.path());
                zip.start_file(relative, options)
                    .map_err(|e| package_err(e.to_string()))?;
                let mut source = File::open(entry.path()).map_err(|e| package_err(e.to_string()))?;
                io::copy(&mut source, &mut zip).map_err(|e| package_err(e.to_string()))?;
                written += 1;
            }
        }

        zip.finish().map_err(|e| package_err(e.to_string()))?;
        Ok(written)
    }

    fn unpack_command(&self, archive: &str, dest: &str) -> String {
        format!(
            "mkdir -p {dest} && unzip -oq {archive} -d {dest} && rm -f {archive}",
            dest = shell::quote_path(dest),
            archive = shell::quote_path(archive),
        )
    }

    fn extension(&self) -> &'static str {
        "zip"
    }
}

#[cfg(unix)]
fn with_mode(options: FileOptions, path: &Path) -> FileOptions {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => options.unix_permissions(meta.permissions().mode()),
        Err(_) => options,
    }
}

#[cfg(not(unix))]
fn with_mode(options: FileOptions, _path: &Path) -> FileOptions {
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn exclude(patterns: &[&str]) -> FileFilter {
        FileFilter::new(
            FilterMode::Exclude,
            patterns.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = FileFilter::from_block("\n# nothing\n", FilterMode::Include);
        assert!(filter.is_empty());
        assert!(filter.allows("anything/at/all.txt"));
    }

    #[test]
    fn exclude_matches_names_globs_and_ancestors() {
        let filter = exclude(&["node_modules", "*.log", "tests/"]);
        assert!(!filter.allows("node_modules"));
        assert!(!filter.allows("node_modules/left-pad/index.js"));
        assert!(!filter.allows("var/debug.log"));
        assert!(!filter.allows("tests/unit/a_test.php"));
        assert!(filter.allows("src/main.php"));
    }

    #[test]
    fn include_keeps_only_matches() {
        let filter = FileFilter::new(
            FilterMode::Include,
            vec!["public".to_string(), "*.env.example".to_string()],
        );
        assert!(filter.allows("public/index.html"));
        assert!(filter.allows("config/.env.example"));
        assert!(!filter.allows("src/secret.rs"));
    }

    #[test]
    fn pack_honors_filter() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("public")).unwrap();
        fs::create_dir_all(src.path().join("logs")).unwrap();
        fs::write(src.path().join("public/index.html"), "<h1>hi</h1>").unwrap();
        fs::write(src.path().join("logs/app.log"), "noise").unwrap();
        fs::write(src.path().join("README.md"), "docs").unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join("pkg/3_9_20240101_000000.zip");
        let written = ZipArchiver
            .pack(&archive, src.path(), &exclude(&["logs"]))
            .unwrap();
        assert_eq!(written, 2);

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let names: Vec<String> = zip.file_names().map(str::to_string).collect();
        assert!(names.contains(&"public/index.html".to_string()));
        assert!(names.contains(&"README.md".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("logs")));

        let mut body = String::new();
        zip.by_name("public/index.html")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "<h1>hi</h1>");
    }

    #[test]
    fn unpack_command_quotes_paths() {
        assert_eq!(
            ZipArchiver.unpack_command("/srv/r/v1.zip", "/srv/r/v1"),
            "mkdir -p '/srv/r/v1' && unzip -oq '/srv/r/v1.zip' -d '/srv/r/v1' && rm -f '/srv/r/v1.zip'"
        );
    }
}
