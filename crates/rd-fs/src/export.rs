use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rd_core::{Action, CoreError, CoreResult, Desk, DeskRepository};
use rd_utils::format_last_used;

use crate::{write_atomic, Settings};

const CSV_HEADER: [&str; 4] = ["Machine Name", "Description", "Last Used", "Custom RDP Path"];

/// Portable snapshot of settings and per-machine attributes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsExport {
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub machine_rdp_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,
}

impl SettingsExport {
    /// Capture the current settings and machine attributes.
    pub fn capture<R: DeskRepository>(desk: &Desk<R>, settings: &Settings) -> Self {
        let mut export = Self {
            settings: settings.entries().into_iter().collect(),
            ..Self::default()
        };
        for record in desk.records().records() {
            if let Some(path) = &record.connection_path {
                export
                    .machine_rdp_paths
                    .insert(record.name.clone(), path.display().to_string());
            }
            if let Some(description) = &record.description {
                export
                    .descriptions
                    .insert(record.name.clone(), description.clone());
            }
        }
        export
    }
}

/// Counts from a settings import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub settings: usize,
    pub paths: usize,
    pub descriptions: usize,
    pub skipped: usize,
}

/// Write the machine list as CSV.
pub fn export_csv<R: DeskRepository>(desk: &Desk<R>, writer: impl Write) -> CoreResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER)
        .map_err(|err| CoreError::Storage(err.to_string()))?;
    for record in desk.records().records() {
        let last_used = format_last_used(record.last_used);
        let path = record
            .connection_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "Default".into());
        csv.write_record([
            record.name.as_str(),
            record.description.as_deref().unwrap_or(""),
            last_used.as_str(),
            path.as_str(),
        ])
        .map_err(|err| CoreError::Storage(err.to_string()))?;
    }
    csv.flush().map_err(|err| CoreError::Storage(err.to_string()))
}

/// Write the machine list as CSV to a file.
pub fn export_csv_file<R: DeskRepository>(desk: &Desk<R>, path: &Path) -> CoreResult<()> {
    let mut buffer = Vec::new();
    export_csv(desk, &mut buffer)?;
    let contents = String::from_utf8(buffer).map_err(|err| CoreError::Storage(err.to_string()))?;
    write_atomic(path, &contents)?;
    info!(path = %path.display(), machines = desk.records().len(), "exported csv");
    Ok(())
}

/// Write settings and machine attributes as pretty JSON.
pub fn export_json_file<R: DeskRepository>(
    desk: &Desk<R>,
    settings: &Settings,
    path: &Path,
) -> CoreResult<()> {
    let export = SettingsExport::capture(desk, settings);
    let contents =
        serde_json::to_string_pretty(&export).map_err(|err| CoreError::Storage(err.to_string()))?;
    write_atomic(path, &contents)?;
    info!(path = %path.display(), "exported settings");
    Ok(())
}

/// Merge an exported JSON file into the current settings and machines.
///
/// Settings are merged key by key, except `data_dir`, which only
/// [`crate::relocate_data_dir`] changes. Paths and descriptions for unknown
/// machines are skipped. Settings are saved when anything merged.
pub fn import_json_file<R: DeskRepository>(
    desk: &mut Desk<R>,
    settings: &mut Settings,
    path: &Path,
) -> CoreResult<ImportSummary> {
    let contents = fs::read_to_string(path).map_err(|err| CoreError::Storage(err.to_string()))?;
    let import: SettingsExport = serde_json::from_str(&contents)
        .map_err(|err| CoreError::Validation(format!("invalid export file: {err}")))?;

    let mut summary = ImportSummary::default();
    for (key, value) in &import.settings {
        if key == "data_dir" {
            continue;
        }
        match settings.set(key, value) {
            Ok(()) => summary.settings += 1,
            Err(err) => {
                warn!(key = %key, error = %err, "skipping imported setting");
                summary.skipped += 1;
            }
        }
    }
    if summary.settings > 0 {
        settings.save()?;
    }

    for (machine, value) in import.machine_rdp_paths {
        let path = Some(PathBuf::from(value)).filter(|path| !path.as_os_str().is_empty());
        let outcome = desk.dispatch(Action::SetConnectionPath { machine, path })?;
        if outcome.is_applied() {
            summary.paths += 1;
        } else {
            summary.skipped += 1;
        }
    }
    for (machine, text) in import.descriptions {
        let outcome = desk.dispatch(Action::SetDescription { machine, text })?;
        if outcome.is_applied() {
            summary.descriptions += 1;
        } else {
            summary.skipped += 1;
        }
    }
    info!(?summary, "imported settings");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsStore;
    use tempfile::TempDir;

    fn desk_in(dir: &Path) -> Desk<FsStore> {
        let mut desk = Desk::open(FsStore::new(dir.to_path_buf())).expect("open");
        desk.dispatch(Action::AddMachines("Alpha Beta".into())).unwrap();
        desk.dispatch(Action::SetDescription {
            machine: "Alpha".into(),
            text: "build, test".into(),
        })
        .unwrap();
        desk.dispatch(Action::SetConnectionPath {
            machine: "Beta".into(),
            path: Some(PathBuf::from(r"C:\rdp\beta.rdp")),
        })
        .unwrap();
        desk
    }

    #[test]
    fn csv_uses_placeholders() {
        let temp = TempDir::new().expect("temp dir");
        let desk = desk_in(temp.path());
        let mut out = Vec::new();
        export_csv(&desk, &mut out).unwrap();
        let csv = String::from_utf8(out).unwrap();
        insta::assert_snapshot!(csv, @r###"
        Machine Name,Description,Last Used,Custom RDP Path
        Alpha,"build, test",Never,Default
        Beta,,Never,C:\rdp\beta.rdp
        "###);
    }

    #[test]
    fn json_export_then_import_into_fresh_desk() {
        let source = TempDir::new().expect("temp dir");
        let desk = desk_in(source.path());
        let mut settings = Settings::defaults(source.path().to_path_buf());
        settings.set("probe_port", "3390").unwrap();
        let file = source.path().join("export.json");
        export_json_file(&desk, &settings, &file).unwrap();

        let target = TempDir::new().expect("temp dir");
        let mut fresh = Desk::open(FsStore::new(target.path().to_path_buf())).unwrap();
        fresh.dispatch(Action::AddMachine("Beta".into())).unwrap();
        let mut fresh_settings = Settings::defaults(target.path().to_path_buf());

        let summary = import_json_file(&mut fresh, &mut fresh_settings, &file).unwrap();
        assert_eq!(summary.paths, 1);
        assert_eq!(summary.descriptions, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fresh_settings.probe_port, 3390);
        assert_eq!(fresh_settings.data_dir, target.path());
        assert_eq!(
            fresh.records().get("Beta").unwrap().connection_path,
            Some(PathBuf::from(r"C:\rdp\beta.rdp"))
        );
        assert!(target.path().join("settings.txt").exists());
    }

    #[test]
    fn import_rejects_malformed_json() {
        let temp = TempDir::new().expect("temp dir");
        let file = temp.path().join("broken.json");
        fs::write(&file, "{ not json").unwrap();
        let mut desk = Desk::open(FsStore::new(temp.path().to_path_buf())).unwrap();
        let mut settings = Settings::defaults(temp.path().to_path_buf());
        assert!(matches!(
            import_json_file(&mut desk, &mut settings, &file),
            Err(CoreError::Validation(_))
        ));
    }
}
