//! Filesystem-backed persistence for rdeck.
//!
//! Each attribute group lives in its own small file inside the data
//! directory. Files are replaced atomically: contents go to a temporary file
//! next to the target which is then renamed over it.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use rd_core::{CoreError, CoreResult, DeskRepository, FieldGroup};

mod export;
mod settings;

pub use export::{export_csv, export_csv_file, export_json_file, import_json_file, ImportSummary, SettingsExport};
pub use settings::{
    default_data_dir, relocate_data_dir, resolve_data_dir, resolve_data_dir_from, Settings,
    DATA_DIR_ENV, SETTINGS_FILE_NAME,
};

/// Directory name used under the platform data directory.
pub const APP_DIR_NAME: &str = "rdeck";

const SHARE_DIR_NAME: &str = "temp_share";

/// Filesystem-backed desk repository.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at the provided data directory.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the data directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Check if the data directory exists.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the data directory if needed.
    pub fn init(&self) -> CoreResult<()> {
        fs::create_dir_all(&self.root).map_err(|err| CoreError::Storage(err.to_string()))
    }

    /// Directory holding shareable template copies.
    pub fn share_dir(&self) -> PathBuf {
        self.root.join(SHARE_DIR_NAME)
    }

    /// File backing an attribute group.
    pub fn group_path(&self, group: FieldGroup) -> PathBuf {
        self.root.join(group_file_name(group))
    }

    /// Remove share copies older than `max_age`. Returns how many were removed.
    pub fn cleanup_shares(&self, max_age: Duration) -> CoreResult<usize> {
        let dir = self.share_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok());
            let Some(modified) = modified else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) => warn!(path = %entry.path().display(), error = %err, "failed to remove share file"),
                }
            }
        }
        debug!(removed, "share directory cleaned");
        Ok(removed)
    }

    fn read_lines(&self, group: FieldGroup) -> CoreResult<Vec<String>> {
        let path = self.group_path(group);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(contents
            .lines()
            .map(|line| line.trim_start_matches('\u{feff}').to_string())
            .filter(|line| !line.trim().is_empty())
            .collect())
    }
}

fn group_file_name(group: FieldGroup) -> &'static str {
    match group {
        FieldGroup::Machines => "pcs.txt",
        FieldGroup::LastUsed => "last_used.txt",
        FieldGroup::Descriptions => "descriptions.txt",
        FieldGroup::ConnectionPaths => "machine_rdp.txt",
        FieldGroup::Addresses => "addresses.txt",
        FieldGroup::Categories => "categories.txt",
        FieldGroup::CategoryColors => "category_colors.yaml",
        FieldGroup::MachineCategories => "machine_categories.txt",
        FieldGroup::Tags => "tags.txt",
        FieldGroup::MachineTags => "machine_tags.txt",
    }
}

impl DeskRepository for FsStore {
    fn load_list(&self, group: FieldGroup) -> CoreResult<Vec<String>> {
        Ok(self
            .read_lines(group)?
            .into_iter()
            .map(|line| line.trim().to_string())
            .collect())
    }

    fn save_list(&self, group: FieldGroup, items: &[String]) -> CoreResult<()> {
        let mut contents = String::new();
        for item in items {
            contents.push_str(item);
            contents.push('\n');
        }
        write_atomic(&self.group_path(group), &contents)
    }

    fn load_map(&self, group: FieldGroup) -> CoreResult<Vec<(String, String)>> {
        if group == FieldGroup::CategoryColors {
            let path = self.group_path(group);
            if !path.exists() {
                return Ok(Vec::new());
            }
            let contents =
                fs::read_to_string(&path).map_err(|err| CoreError::Storage(err.to_string()))?;
            if contents.trim().is_empty() {
                return Ok(Vec::new());
            }
            let colors: BTreeMap<String, String> = serde_yaml::from_str(&contents)
                .map_err(|err| CoreError::Storage(err.to_string()))?;
            return Ok(colors.into_iter().collect());
        }

        let mut entries = Vec::new();
        for line in self.read_lines(group)? {
            match line.split_once(':') {
                Some((key, value)) if !key.trim().is_empty() => {
                    entries.push((key.trim().to_string(), value.trim_end().to_string()));
                }
                _ => warn!(file = group_file_name(group), line = %line, "skipping malformed line"),
            }
        }
        Ok(entries)
    }

    fn save_map(&self, group: FieldGroup, entries: &[(String, String)]) -> CoreResult<()> {
        let contents = if group == FieldGroup::CategoryColors {
            let colors: BTreeMap<&str, &str> = entries
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect();
            serde_yaml::to_string(&colors).map_err(|err| CoreError::Storage(err.to_string()))?
        } else {
            let mut contents = String::new();
            for (key, value) in entries {
                contents.push_str(key);
                contents.push(':');
                contents.push_str(value);
                contents.push('\n');
            }
            contents
        };
        write_atomic(&self.group_path(group), &contents)
    }
}

/// Replace `path` with `contents` without ever exposing a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> CoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CoreError::Storage(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| CoreError::Storage(err.to_string()))?;
    let mut file =
        NamedTempFile::new_in(parent).map_err(|err| CoreError::Storage(err.to_string()))?;
    file.write_all(contents.as_bytes())
        .map_err(|err| CoreError::Storage(err.to_string()))?;
    file.as_file()
        .sync_all()
        .map_err(|err| CoreError::Storage(err.to_string()))?;
    file.persist(path)
        .map_err(|err| CoreError::Storage(err.error.to_string()))?;
    Ok(())
}
