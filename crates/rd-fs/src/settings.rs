use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use rd_core::{CoreError, CoreResult};

use crate::{write_atomic, APP_DIR_NAME};

/// Settings file name, both in the data directory and the bootstrap location.
pub const SETTINGS_FILE_NAME: &str = "settings.txt";
/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "RDECK_DATA_DIR";

const DEFAULT_PORT: u16 = 3389;
const DEFAULT_TIMEOUT_SECS: u64 = 3;
const DEFAULT_REFRESH_SECS: u64 = 5;

const KEY_DATA_DIR: &str = "data_dir";
const KEY_RDP_PATH: &str = "rdp_path";
const KEY_CLIENT: &str = "client";
const KEY_PORT: &str = "probe_port";
const KEY_TIMEOUT: &str = "probe_timeout_secs";
const KEY_REFRESH: &str = "refresh_interval_secs";

/// Application settings stored as `key=value` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding every data file.
    pub data_dir: PathBuf,
    /// Default connection template.
    pub rdp_path: Option<PathBuf>,
    /// Remote desktop client program.
    pub client: String,
    /// Port probed for reachability.
    pub probe_port: u16,
    /// Per-probe connect timeout.
    pub probe_timeout: Duration,
    /// Delay between status refreshes.
    pub refresh_interval: Duration,
    extra: BTreeMap<String, String>,
}

impl Settings {
    /// Default settings for a data directory.
    pub fn defaults(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            rdp_path: None,
            client: default_client().to_string(),
            probe_port: DEFAULT_PORT,
            probe_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            extra: BTreeMap::new(),
        }
    }

    /// Parse settings text. Unreadable values fall back to defaults.
    pub fn parse(data_dir: PathBuf, contents: &str) -> Self {
        let mut settings = Self::defaults(data_dir);
        for line in contents.lines() {
            let line = line.trim_start_matches('\u{feff}').trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = %line, "skipping malformed settings line");
                continue;
            };
            if let Err(err) = settings.set(key.trim(), value.trim()) {
                warn!(key = %key, error = %err, "ignoring unreadable setting");
            }
        }
        settings
    }

    /// Load `<data_dir>/settings.txt`, or defaults when it is missing.
    /// The directory itself always wins over a stored `data_dir` value.
    pub fn load(data_dir: &Path) -> CoreResult<Self> {
        let path = data_dir.join(SETTINGS_FILE_NAME);
        let mut settings = if path.exists() {
            let contents =
                fs::read_to_string(&path).map_err(|err| CoreError::Storage(err.to_string()))?;
            Self::parse(data_dir.to_path_buf(), &contents)
        } else {
            Self::defaults(data_dir.to_path_buf())
        };
        settings.data_dir = data_dir.to_path_buf();
        Ok(settings)
    }

    /// Write settings into the data directory.
    pub fn save(&self) -> CoreResult<()> {
        write_atomic(&self.data_dir.join(SETTINGS_FILE_NAME), &self.render())
    }

    /// Set a value by key. Unknown keys are kept verbatim.
    pub fn set(&mut self, key: &str, value: &str) -> CoreResult<()> {
        match key {
            KEY_DATA_DIR => {
                if value.is_empty() {
                    return Err(CoreError::Validation("data_dir cannot be empty".into()));
                }
                self.data_dir = PathBuf::from(value);
            }
            KEY_RDP_PATH => {
                self.rdp_path = Some(PathBuf::from(value)).filter(|path| !path.as_os_str().is_empty());
            }
            KEY_CLIENT => {
                if value.is_empty() {
                    return Err(CoreError::Validation("client cannot be empty".into()));
                }
                self.client = value.to_string();
            }
            KEY_PORT => {
                self.probe_port = value
                    .parse()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| CoreError::Validation(format!("invalid port: {value}")))?;
            }
            KEY_TIMEOUT => self.probe_timeout = parse_secs(key, value)?,
            KEY_REFRESH => self.refresh_interval = parse_secs(key, value)?,
            _ => {
                if key.is_empty() || key.contains(['=', '\n']) {
                    return Err(CoreError::Validation(format!("invalid settings key: {key}")));
                }
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Every setting as key/value pairs, known keys first.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            (KEY_DATA_DIR.to_string(), self.data_dir.display().to_string()),
            (
                KEY_RDP_PATH.to_string(),
                self.rdp_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
            ),
            (KEY_CLIENT.to_string(), self.client.clone()),
            (KEY_PORT.to_string(), self.probe_port.to_string()),
            (KEY_TIMEOUT.to_string(), self.probe_timeout.as_secs().to_string()),
            (KEY_REFRESH.to_string(), self.refresh_interval.as_secs().to_string()),
        ];
        entries.extend(
            self.extra
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        entries
    }

    /// Render as `key=value` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.entries() {
            out.push_str(&key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }
}

fn parse_secs(key: &str, value: &str) -> CoreResult<Duration> {
    value
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .ok_or_else(|| CoreError::Validation(format!("invalid {key}: {value}")))
}

fn default_client() -> &'static str {
    if cfg!(windows) {
        "mstsc"
    } else {
        "xfreerdp"
    }
}

/// Platform default data directory.
pub fn default_data_dir() -> CoreResult<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| CoreError::Storage("unable to resolve local data directory".into()))
}

/// Resolve the data directory from the environment, the bootstrap settings
/// file, or the platform default.
pub fn resolve_data_dir() -> CoreResult<PathBuf> {
    let default_dir = default_data_dir()?;
    resolve_data_dir_from(&default_dir, env::var(DATA_DIR_ENV).ok())
}

/// Resolve the data directory given the bootstrap location and an optional
/// override. A bootstrap pointing at a vanished directory is reset to the
/// default.
pub fn resolve_data_dir_from(default_dir: &Path, override_dir: Option<String>) -> CoreResult<PathBuf> {
    if let Some(dir) = override_dir.filter(|dir| !dir.trim().is_empty()) {
        debug!(dir = %dir, "data directory from environment");
        return Ok(PathBuf::from(dir));
    }

    fs::create_dir_all(default_dir).map_err(|err| CoreError::Storage(err.to_string()))?;
    let bootstrap = Settings::load(default_dir)?;
    let stored = stored_data_dir(default_dir)?;
    match stored {
        Some(dir) if dir.is_dir() => Ok(dir),
        Some(dir) => {
            warn!(dir = %dir.display(), "configured data directory missing, using default");
            bootstrap.save()?;
            Ok(default_dir.to_path_buf())
        }
        None => {
            bootstrap.save()?;
            Ok(default_dir.to_path_buf())
        }
    }
}

fn stored_data_dir(default_dir: &Path) -> CoreResult<Option<PathBuf>> {
    let path = default_dir.join(SETTINGS_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path).map_err(|err| CoreError::Storage(err.to_string()))?;
    Ok(Some(Settings::parse(default_dir.to_path_buf(), &contents).data_dir))
}

/// Move every data file into `new_dir` and point the bootstrap settings at
/// it. Returns the updated settings and how many files moved.
pub fn relocate_data_dir(
    settings: &Settings,
    default_dir: &Path,
    new_dir: &Path,
) -> CoreResult<(Settings, usize)> {
    fs::create_dir_all(new_dir).map_err(|err| CoreError::Storage(err.to_string()))?;
    let old_dir = settings.data_dir.clone();
    let mut moved = 0;
    if fs::canonicalize(&old_dir).ok() != fs::canonicalize(new_dir).ok() && old_dir.is_dir() {
        for entry in WalkDir::new(&old_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let is_data = entry.file_type().is_file()
                && matches!(
                    entry.path().extension().and_then(|ext| ext.to_str()),
                    Some("txt" | "yaml")
                );
            if !is_data {
                continue;
            }
            let target = new_dir.join(entry.file_name());
            move_file(entry.path(), &target)?;
            moved += 1;
        }
    }

    let mut relocated = settings.clone();
    relocated.data_dir = new_dir.to_path_buf();
    relocated.save()?;

    if fs::canonicalize(default_dir).ok() != fs::canonicalize(new_dir).ok() {
        let mut bootstrap = Settings::defaults(default_dir.to_path_buf());
        bootstrap.data_dir = new_dir.to_path_buf();
        write_atomic(&default_dir.join(SETTINGS_FILE_NAME), &bootstrap.render())?;
    }
    info!(from = %old_dir.display(), to = %new_dir.display(), moved, "data directory relocated");
    Ok((relocated, moved))
}

fn move_file(from: &Path, to: &Path) -> CoreResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|err| CoreError::Storage(err.to_string()))?;
    fs::remove_file(from).map_err(|err| CoreError::Storage(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_keeps_unknown_keys() {
        let settings = Settings::parse(
            PathBuf::from("/data"),
            "data_dir=/elsewhere\nrdp_path=C:\\rdp\\default.rdp\ntheme=dark\nprobe_port=3390\ngarbage\n",
        );
        assert_eq!(settings.data_dir, PathBuf::from("/elsewhere"));
        assert_eq!(settings.rdp_path, Some(PathBuf::from("C:\\rdp\\default.rdp")));
        assert_eq!(settings.probe_port, 3390);
        assert!(settings.render().contains("theme=dark\n"));
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let settings = Settings::parse(
            PathBuf::from("/data"),
            "probe_timeout_secs=soon\nrefresh_interval_secs=0\n",
        );
        assert_eq!(settings.probe_timeout, Duration::from_secs(3));
        assert_eq!(settings.refresh_interval, Duration::from_secs(5));
    }

    #[test]
    fn set_rejects_invalid_port() {
        let mut settings = Settings::defaults(PathBuf::from("/data"));
        assert!(matches!(
            settings.set("probe_port", "99999"),
            Err(CoreError::Validation(_))
        ));
        assert_eq!(settings.probe_port, 3389);
    }

    #[test]
    fn environment_override_wins() {
        let temp = TempDir::new().expect("temp dir");
        let resolved =
            resolve_data_dir_from(temp.path(), Some("/custom/rdeck".into())).unwrap();
        assert_eq!(resolved, PathBuf::from("/custom/rdeck"));
        assert!(!temp.path().join(SETTINGS_FILE_NAME).exists());
    }

    #[test]
    fn first_run_writes_bootstrap() {
        let temp = TempDir::new().expect("temp dir");
        let default_dir = temp.path().join("rdeck");
        let resolved = resolve_data_dir_from(&default_dir, None).unwrap();
        assert_eq!(resolved, default_dir);
        let contents = fs::read_to_string(default_dir.join(SETTINGS_FILE_NAME)).unwrap();
        assert!(contents.starts_with(&format!("data_dir={}\n", default_dir.display())));
    }

    #[test]
    fn missing_target_resets_to_default() {
        let temp = TempDir::new().expect("temp dir");
        let default_dir = temp.path().join("rdeck");
        fs::create_dir_all(&default_dir).unwrap();
        fs::write(
            default_dir.join(SETTINGS_FILE_NAME),
            format!("data_dir={}\n", temp.path().join("gone").display()),
        )
        .unwrap();
        assert_eq!(resolve_data_dir_from(&default_dir, None).unwrap(), default_dir);
    }

    #[test]
    fn relocation_moves_data_files_and_updates_bootstrap() {
        let temp = TempDir::new().expect("temp dir");
        let default_dir = temp.path().join("rdeck");
        let new_dir = temp.path().join("shared");
        fs::create_dir_all(&default_dir).unwrap();
        fs::write(default_dir.join("pcs.txt"), "Alpha\n").unwrap();
        fs::write(default_dir.join("category_colors.yaml"), "Lab: '#112233'\n").unwrap();
        fs::write(default_dir.join("rdeck.log"), "log line\n").unwrap();
        let mut settings = Settings::defaults(default_dir.clone());
        settings.set("theme", "dark").unwrap();
        settings.save().unwrap();

        let (relocated, moved) = relocate_data_dir(&settings, &default_dir, &new_dir).unwrap();
        assert_eq!(moved, 3);
        assert_eq!(relocated.data_dir, new_dir);
        assert!(new_dir.join("pcs.txt").exists());
        assert!(new_dir.join("category_colors.yaml").exists());
        assert!(default_dir.join("rdeck.log").exists());
        assert_eq!(resolve_data_dir_from(&default_dir, None).unwrap(), new_dir);
        let reloaded = Settings::load(&new_dir).unwrap();
        assert!(reloaded.render().contains("theme=dark\n"));
    }
}
