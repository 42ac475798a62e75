//! Core domain entities, indexes, and filtering rules for rdeck.
//!
//! The [`Desk`] owns every index and is the only place that mutates them.
//! Rendering layers read [`Desk::view`] and send [`Action`]s back through
//! [`Desk::dispatch`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod categories;
mod desk;
mod filter;
mod memory;
mod records;
mod status;
mod tags;

pub use categories::CategoryIndex;
pub use desk::{Action, Desk, Outcome, RefreshTick};
pub use filter::{filter_view, FilterState};
pub use memory::MemoryRepository;
pub use records::RecordStore;
pub use status::{AddressChange, MachineStatus, ProbeOutcome, ProbeReport, StatusSnapshot};
pub use tags::TagIndex;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by core validation and collaborators.
///
/// Expected rejections (duplicates, unknown references) are not errors; index
/// operations report them as `Ok(false)`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Returned when a value cannot be parsed into a domain type.
    #[error("validation error: {0}")]
    Validation(String),
    /// Returned when repository operations fail.
    #[error("storage error: {0}")]
    Storage(String),
    /// Returned when a referenced machine or setting is missing.
    #[error("not found: {0}")]
    NotFound(String),
    /// Returned when the remote-desktop client cannot be started.
    #[error("launch error: {0}")]
    Launch(String),
    /// Returned when a background worker cannot be started.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Name of the reserved catch-all category.
pub const DEFAULT_CATEGORY: &str = "Default";

/// A `#rrggbb` display color attached to a category.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    hex: String,
}

impl Color {
    /// Parse a color, accepting `#rrggbb` in either case.
    pub fn parse(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix('#')
            .ok_or_else(|| CoreError::Validation(format!("color must start with '#': {trimmed}")))?;
        if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(CoreError::Validation(format!(
                "color must be #rrggbb: {trimmed}"
            )));
        }
        Ok(Self {
            hex: format!("#{}", digits.to_ascii_lowercase()),
        })
    }

    /// Access the normalized `#rrggbb` value.
    pub fn as_str(&self) -> &str {
        &self.hex
    }
}

impl TryFrom<String> for Color {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::parse(value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.hex
    }
}

/// A named grouping with an optional display color.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Category {
    /// Unique, case-sensitive name.
    pub name: String,
    /// Optional display color.
    pub color: Option<Color>,
}

impl Category {
    /// Build a category without a color.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }

    /// Whether this is the reserved catch-all category.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_CATEGORY
    }
}

/// A remote host the user connects to. The name doubles as the hostname.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineRecord {
    /// Unique, case-sensitive machine name.
    pub name: String,
    /// Free-form description shown next to the machine.
    pub description: Option<String>,
    /// Connection template overriding the global default.
    pub connection_path: Option<PathBuf>,
    /// When a connection was last launched.
    pub last_used: Option<DateTime<Utc>>,
    /// Address the name resolved to the last time it was accepted.
    pub last_known_address: Option<IpAddr>,
}

impl MachineRecord {
    /// Create a record with all attributes unset.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Attribute groups persisted independently of one another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    /// Ordered machine names.
    Machines,
    /// Machine to last-used timestamp.
    LastUsed,
    /// Machine to description.
    Descriptions,
    /// Machine to connection template override.
    ConnectionPaths,
    /// Machine to last accepted address.
    Addresses,
    /// Ordered category names.
    Categories,
    /// Category to display color.
    CategoryColors,
    /// Machine to category.
    MachineCategories,
    /// Ordered tag names.
    Tags,
    /// Machine to comma separated tags.
    MachineTags,
}

impl FieldGroup {
    /// Every group, in the order they are loaded.
    pub const ALL: [FieldGroup; 10] = [
        FieldGroup::Machines,
        FieldGroup::LastUsed,
        FieldGroup::Descriptions,
        FieldGroup::ConnectionPaths,
        FieldGroup::Addresses,
        FieldGroup::Categories,
        FieldGroup::CategoryColors,
        FieldGroup::MachineCategories,
        FieldGroup::Tags,
        FieldGroup::MachineTags,
    ];
}

/// Key-value persistence for the attribute groups.
///
/// List groups hold one value per entry; map groups hold `(key, value)`
/// pairs. Implementations must replace a group wholesale on save.
pub trait DeskRepository {
    /// Load a list group. Missing groups load as empty.
    fn load_list(&self, group: FieldGroup) -> CoreResult<Vec<String>>;
    /// Replace a list group.
    fn save_list(&self, group: FieldGroup, items: &[String]) -> CoreResult<()>;
    /// Load a map group. Missing groups load as empty.
    fn load_map(&self, group: FieldGroup) -> CoreResult<Vec<(String, String)>>;
    /// Replace a map group.
    fn save_map(&self, group: FieldGroup, entries: &[(String, String)]) -> CoreResult<()>;
}

/// Reachability check against a single machine.
///
/// Implementations block for at most their configured timeout and fold
/// every failure into an unreachable outcome.
pub trait Prober: Send + Sync {
    /// Probe a machine by name.
    fn probe(&self, machine: &str) -> ProbeOutcome;
}

/// Starts the external remote-desktop client.
pub trait Launcher {
    /// Launch a session to `machine` using the connection template.
    fn launch(&self, machine: &str, template: &Path) -> CoreResult<()>;
}

/// Reject names that cannot round-trip through the line-oriented files.
pub(crate) fn is_storable(name: &str, forbidden: &[char]) -> bool {
    !name.is_empty()
        && !name.contains(['\n', '\r'])
        && !name.contains(forbidden)
}
