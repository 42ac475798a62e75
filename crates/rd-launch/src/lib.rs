//! Starting remote desktop sessions and preparing shareable templates.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Local;
use tracing::{debug, info};

use rd_core::{Action, CoreError, CoreResult, Desk, DeskRepository, Launcher};
use rd_utils::{file_stem, read_template, rewrite_full_address, write_template, UtilsError};

/// Spawns the remote desktop client as `<program> <template> /v:<machine>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLauncher {
    program: String,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, machine: &str, template: &Path) -> CoreResult<()> {
        let child = Command::new(&self.program)
            .arg(template)
            .arg(format!("/v:{machine}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| CoreError::Launch(format!("failed to start {}: {err}", self.program)))?;
        info!(machine, program = %self.program, pid = child.id(), "session started");
        Ok(())
    }
}

/// A template copy pointed at one machine, ready to hand to someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedTemplate {
    pub path: PathBuf,
    pub text: String,
}

/// Resolves the effective template for a machine and starts sessions.
#[derive(Debug, Clone)]
pub struct ConnectionLauncher<L> {
    launcher: L,
    default_template: Option<PathBuf>,
}

impl<L: Launcher> ConnectionLauncher<L> {
    pub fn new(launcher: L, default_template: Option<PathBuf>) -> Self {
        Self {
            launcher,
            default_template,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// The machine's own template if set, otherwise the global default.
    /// The template must exist on disk.
    pub fn resolve_template<R: DeskRepository>(
        &self,
        desk: &Desk<R>,
        machine: &str,
    ) -> CoreResult<PathBuf> {
        let record = desk
            .records()
            .get(machine)
            .ok_or_else(|| CoreError::NotFound(format!("machine {machine}")))?;
        let template = record
            .connection_path
            .clone()
            .or_else(|| self.default_template.clone())
            .ok_or_else(|| CoreError::NotFound("no connection template configured".into()))?;
        if !template.is_file() {
            return Err(CoreError::NotFound(format!(
                "connection template {}",
                template.display()
            )));
        }
        Ok(template)
    }

    /// Start a session and stamp the machine as used. A failed launch leaves
    /// the last-used time untouched.
    pub fn connect<R: DeskRepository>(&self, desk: &mut Desk<R>, machine: &str) -> CoreResult<PathBuf> {
        let template = self.resolve_template(desk, machine)?;
        self.launcher.launch(machine, &template)?;
        desk.dispatch(Action::RecordUsed(machine.to_string()))?;
        Ok(template)
    }

    /// Write `<share_dir>/<machine>_<YYYYmmdd_HHMMSS>.rdp` pointing at the
    /// machine, re-encoded as UTF-8.
    pub fn prepare_shareable<R: DeskRepository>(
        &self,
        desk: &Desk<R>,
        machine: &str,
        share_dir: &Path,
    ) -> CoreResult<SharedTemplate> {
        let template = self.resolve_template(desk, machine)?;
        let contents = read_template(&template).map_err(template_error)?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = share_dir.join(format!("{}_{stamp}.rdp", file_stem(machine)));
        write_template(&path, &rewrite_full_address(&contents, machine)).map_err(template_error)?;
        debug!(machine, path = %path.display(), "shareable template written");

        Ok(SharedTemplate {
            text: share_text(machine, &path),
            path,
        })
    }
}

fn template_error(err: UtilsError) -> CoreError {
    match err {
        UtilsError::Io(err) => CoreError::Storage(err.to_string()),
        UtilsError::Parse(message) => CoreError::Validation(message),
    }
}

/// Instructions for connecting to a machine with a shared template.
pub fn share_text(machine: &str, template: &Path) -> String {
    format!(
        "Remote Desktop Connection for {machine}\n\
         1. Use the RDP file located at: {}\n\
         2. Or connect using: mstsc /v:{machine}",
        template.display()
    )
}
