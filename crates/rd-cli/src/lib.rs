use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use rd_core::{Action, Color, Desk, Outcome};
use rd_fs::{
    default_data_dir, export_csv_file, export_json_file, import_json_file, relocate_data_dir,
    resolve_data_dir, FsStore, Settings,
};
use rd_launch::{ConnectionLauncher, ProcessLauncher};
use rd_probe::{run_probes, TcpProber};
use rd_utils::format_last_used;

pub mod logging;

#[derive(Parser)]
#[command(name = "rdeck", version, about = "Remote desktop machine manager")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory, optionally moving it to a new path.
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Add one or more machines.
    Add {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Delete a machine with its category, tags and attributes.
    Remove { name: String },
    /// List machines in order, optionally filtered.
    List {
        #[arg(long)]
        category: Option<String>,
        /// Only machines carrying every given tag.
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Set a machine description. No text clears it.
    Describe {
        name: String,
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Set or clear a per-machine connection template.
    SetPath { name: String, path: Option<PathBuf> },
    /// Move a machine to a position in the list.
    Move { name: String, index: usize },
    /// Manage categories.
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
    /// Manage tags.
    Tag {
        #[command(subcommand)]
        command: TagCommand,
    },
    /// Probe every machine once and print reachability.
    Status {
        /// Connect timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Start a remote desktop session.
    Connect { name: String },
    /// Write a shareable connection template for a machine.
    Share { name: String },
    /// Export machines or settings.
    Export {
        #[arg(value_enum)]
        format: ExportFormat,
        path: PathBuf,
    },
    /// Merge settings, templates and descriptions from a JSON export.
    Import { path: PathBuf },
    /// Move the data directory.
    Relocate { dir: PathBuf },
    /// Show or change settings.
    Settings {
        #[command(subcommand)]
        command: Option<SettingsCommand>,
    },
}

#[derive(Subcommand)]
enum CategoryCommand {
    Add {
        name: String,
        /// Display color as #rrggbb.
        #[arg(long)]
        color: Option<String>,
    },
    Remove { name: String },
    Rename { from: String, to: String },
    Assign { machine: String, category: String },
    /// Return a machine to the default category.
    Clear { machine: String },
    /// Set a category color, or clear it when omitted.
    Color { category: String, color: Option<String> },
}

#[derive(Subcommand)]
enum TagCommand {
    Add { name: String },
    Remove { name: String },
    Assign { machine: String, tag: String },
    Unassign { machine: String, tag: String },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Set { key: String, value: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

struct Session {
    desk: Desk<FsStore>,
    settings: Settings,
}

impl Session {
    fn open() -> Result<Self> {
        let data_dir = resolve_data_dir().context("failed to resolve data directory")?;
        let store = FsStore::new(data_dir.clone());
        store.init().context("failed to create data directory")?;
        let settings = Settings::load(&data_dir).context("failed to read settings")?;
        let desk = Desk::open(store).context("failed to load machines")?;
        Ok(Self { desk, settings })
    }

    fn apply(&mut self, action: Action, rejected: &str) -> Result<Outcome> {
        let outcome = self.desk.dispatch(action)?;
        if !outcome.is_applied() {
            bail!("{rejected}");
        }
        Ok(outcome)
    }

    fn launcher(&self) -> ConnectionLauncher<ProcessLauncher> {
        ConnectionLauncher::new(
            ProcessLauncher::new(self.settings.client.clone()),
            self.settings.rdp_path.clone(),
        )
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        let data_dir = resolve_data_dir().context("failed to resolve data directory")?;
        let _guard = logging::init_file(&data_dir)?;
        return rd_tui::run(data_dir);
    };
    logging::init_stderr();

    if let Command::Init { path } = &command {
        return init(path.clone());
    }
    if let Command::Relocate { dir } = &command {
        return relocate(dir.clone());
    }

    let mut session = Session::open()?;
    match command {
        Command::Add { names } => {
            if let Outcome::Added(added) = session.desk.dispatch(Action::AddMachines(names.join(" ")))? {
                for name in &added {
                    println!("added {name}");
                }
                if added.len() < names.len() {
                    eprintln!("{} name(s) skipped (empty, invalid or duplicate)", names.len() - added.len());
                }
            }
            Ok(())
        }
        Command::Remove { name } => {
            session.apply(Action::DeleteMachine(name.clone()), &format!("no machine named {name}"))?;
            Ok(())
        }
        Command::List { category, tag } => list(&mut session, category, tag),
        Command::Describe { name, text } => {
            session.apply(
                Action::SetDescription {
                    machine: name.clone(),
                    text: text.join(" "),
                },
                &format!("no machine named {name}"),
            )?;
            Ok(())
        }
        Command::SetPath { name, path } => {
            if let Some(path) = &path {
                if !path.is_file() {
                    bail!("template {} does not exist", path.display());
                }
            }
            session.apply(
                Action::SetConnectionPath {
                    machine: name.clone(),
                    path,
                },
                &format!("no machine named {name}"),
            )?;
            Ok(())
        }
        Command::Move { name, index } => {
            session.apply(
                Action::MoveMachine {
                    machine: name.clone(),
                    index,
                },
                &format!("no machine named {name}"),
            )?;
            Ok(())
        }
        Command::Category { command } => category(&mut session, command),
        Command::Tag { command } => tag(&mut session, command),
        Command::Status { timeout } => status(&mut session, timeout),
        Command::Connect { name } => {
            let template = session
                .launcher()
                .connect(&mut session.desk, &name)
                .with_context(|| format!("failed to connect to {name}"))?;
            println!("connecting to {name} with {}", template.display());
            Ok(())
        }
        Command::Share { name } => {
            let share_dir = session.desk.repository().share_dir();
            let shared = session
                .launcher()
                .prepare_shareable(&session.desk, &name, &share_dir)
                .with_context(|| format!("failed to prepare share for {name}"))?;
            println!("{}", shared.text);
            Ok(())
        }
        Command::Export { format, path } => {
            match format {
                ExportFormat::Csv => export_csv_file(&session.desk, &path),
                ExportFormat::Json => export_json_file(&session.desk, &session.settings, &path),
            }
            .with_context(|| format!("failed to export to {}", path.display()))?;
            println!("exported to {}", path.display());
            Ok(())
        }
        Command::Import { path } => {
            let summary = import_json_file(&mut session.desk, &mut session.settings, &path)
                .with_context(|| format!("failed to import {}", path.display()))?;
            println!(
                "imported {} setting(s), {} template(s), {} description(s); skipped {}",
                summary.settings, summary.paths, summary.descriptions, summary.skipped
            );
            Ok(())
        }
        Command::Settings { command } => {
            if let Some(SettingsCommand::Set { key, value }) = command {
                if key == "data_dir" {
                    bail!("use `rdeck relocate <dir>` to move the data directory");
                }
                session.settings.set(&key, &value)?;
                session.settings.save().context("failed to save settings")?;
            }
            for (key, value) in session.settings.entries() {
                println!("{key}={value}");
            }
            Ok(())
        }
        Command::Init { .. } | Command::Relocate { .. } => unreachable!("handled above"),
    }
}

fn init(path: Option<PathBuf>) -> Result<()> {
    let current = resolve_data_dir().context("failed to resolve data directory")?;
    let target = path.unwrap_or_else(|| current.clone());
    if target != current {
        return relocate(target);
    }
    FsStore::new(target.clone())
        .init()
        .context("failed to create data directory")?;
    Settings::load(&target)?.save().context("failed to write settings")?;
    println!("Data directory ready at {}", target.display());
    Ok(())
}

fn relocate(dir: PathBuf) -> Result<()> {
    let current = resolve_data_dir().context("failed to resolve data directory")?;
    let settings = Settings::load(&current).context("failed to read settings")?;
    let default_dir = default_data_dir()?;
    let (_, moved) = relocate_data_dir(&settings, &default_dir, &dir)
        .with_context(|| format!("failed to move data to {}", dir.display()))?;
    println!("Moved {moved} file(s) to {}", dir.display());
    Ok(())
}

fn list(session: &mut Session, category: Option<String>, tags: Vec<String>) -> Result<()> {
    if let Some(category) = category {
        session.apply(
            Action::ToggleCategoryFilter(category.clone()),
            &format!("unknown category {category}"),
        )?;
    }
    for tag in tags.into_iter().collect::<BTreeSet<_>>() {
        session.apply(Action::ToggleTagFilter(tag.clone()), &format!("unknown tag {tag}"))?;
    }

    let desk = &session.desk;
    for name in desk.view() {
        let record = desk
            .records()
            .get(name)
            .ok_or_else(|| anyhow!("machine {name} vanished"))?;
        println!(
            "{}\t{}\t{}\t{}\t{}",
            name,
            desk.categories().category_of(name),
            desk.tags().tags_of(name).join(","),
            format_last_used(record.last_used),
            record.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn parse_color(color: Option<String>) -> Result<Option<Color>> {
    color
        .map(|color| Color::parse(color).context("invalid color"))
        .transpose()
}

fn category(session: &mut Session, command: CategoryCommand) -> Result<()> {
    match command {
        CategoryCommand::Add { name, color } => {
            let color = parse_color(color)?;
            session.apply(
                Action::AddCategory {
                    name: name.clone(),
                    color,
                },
                &format!("category {name} is empty, reserved or already exists"),
            )?;
        }
        CategoryCommand::Remove { name } => {
            session.apply(
                Action::DeleteCategory(name.clone()),
                &format!("category {name} cannot be deleted"),
            )?;
        }
        CategoryCommand::Rename { from, to } => {
            session.apply(
                Action::RenameCategory {
                    from: from.clone(),
                    to: to.clone(),
                },
                &format!("cannot rename {from} to {to}"),
            )?;
        }
        CategoryCommand::Assign { machine, category } => {
            session.apply(
                Action::AssignCategory {
                    machine: machine.clone(),
                    category: category.clone(),
                },
                &format!("cannot put {machine} in {category}"),
            )?;
        }
        CategoryCommand::Clear { machine } => {
            session.apply(
                Action::ClearCategory(machine.clone()),
                &format!("no machine named {machine}"),
            )?;
        }
        CategoryCommand::Color { category, color } => {
            let color = parse_color(color)?;
            session.apply(
                Action::SetCategoryColor {
                    category: category.clone(),
                    color,
                },
                &format!("unknown category {category}"),
            )?;
        }
    }
    Ok(())
}

fn tag(session: &mut Session, command: TagCommand) -> Result<()> {
    match command {
        TagCommand::Add { name } => {
            session.apply(
                Action::AddTag(name.clone()),
                &format!("tag {name} is empty, invalid or already exists"),
            )?;
        }
        TagCommand::Remove { name } => {
            session.apply(Action::DeleteTag(name.clone()), &format!("unknown tag {name}"))?;
        }
        TagCommand::Assign { machine, tag } => {
            session.apply(
                Action::AssignTag {
                    machine: machine.clone(),
                    tag: tag.clone(),
                },
                &format!("cannot tag {machine} with {tag}"),
            )?;
        }
        TagCommand::Unassign { machine, tag } => {
            session.apply(
                Action::UnassignTag {
                    machine: machine.clone(),
                    tag: tag.clone(),
                },
                &format!("{machine} is not tagged {tag}"),
            )?;
        }
    }
    Ok(())
}

fn status(session: &mut Session, timeout: Option<u64>) -> Result<()> {
    let timeout = timeout.map_or(session.settings.probe_timeout, Duration::from_secs);
    let prober = Arc::new(TcpProber::new(session.settings.probe_port, timeout));
    let refresh = session.desk.begin_refresh();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to initialize runtime")?;
    let reports = runtime.block_on(run_probes(prober, refresh));
    for report in reports {
        session.desk.dispatch(Action::ApplyProbe(report))?;
    }

    let status = session.desk.status();
    for name in session.desk.records().list() {
        let Some(entry) = status.get(&name) else {
            continue;
        };
        let state = if entry.reachable { "online" } else { "offline" };
        let address = entry
            .address
            .map_or_else(|| "-".to_string(), |address| address.to_string());
        match entry.address_change {
            Some(change) => println!("{name}\t{state}\t{address}\t(was {})", change.previous),
            None => println!("{name}\t{state}\t{address}"),
        }
    }
    Ok(())
}
