use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::types::Result;

/// Maps versions to `<base>.<version>` file names inside one directory.
#[derive(Clone, Debug)]
pub struct LogFilesHelper {
    dir: PathBuf,
    base_name: String,
}

impl LogFilesHelper {
    /// Creates a helper for `dir/<base_name>.<version>`.
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
        }
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Logical name shared by every version.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Path of the file for `version`; the file may not exist.
    pub fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base_name, version))
    }

    /// Extracts the version from a file name, or `None` if the name does
    /// not follow the `<base>.<digits>` pattern.
    pub fn version_of(&self, file_name: &str) -> Option<u64> {
        let suffix = file_name.strip_prefix(&self.base_name)?.strip_prefix('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    /// Returns true if the file for `version` exists.
    pub fn exists(&self, version: u64) -> bool {
        self.path_for(version).is_file()
    }

    /// All matching files, ordered by version. Other entries are ignored.
    pub fn matched_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(version) = self.version_of(name) {
                files.push((version, entry.path()));
            }
        }
        files.sort_by_key(|(version, _)| *version);
        Ok(files)
    }

    /// Versions of all matching files, ascending.
    pub fn matched_versions(&self) -> Result<Vec<u64>> {
        Ok(self
            .matched_files()?
            .into_iter()
            .map(|(version, _)| version)
            .collect())
    }

    /// Highest existing version, or `None` when there are no files.
    pub fn highest_version(&self) -> Result<Option<u64>> {
        Ok(self.matched_versions()?.last().copied())
    }

    /// Lowest existing version, or `None` when there are no files.
    pub fn lowest_version(&self) -> Result<Option<u64>> {
        Ok(self.matched_versions()?.first().copied())
    }
}
