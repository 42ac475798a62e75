use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::{
    filter_view, AddressChange, CategoryIndex, Color, CoreResult, DeskRepository, FilterState,
    MachineStatus, ProbeReport, RecordStore, StatusSnapshot, TagIndex,
};

/// A user or background request applied through [`Desk::dispatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Add one machine.
    AddMachine(String),
    /// Add every whitespace separated name in the text.
    AddMachines(String),
    /// Delete a machine and everything keyed off it.
    DeleteMachine(String),
    /// Set or clear (empty text) a description.
    SetDescription { machine: String, text: String },
    /// Set or clear a per-machine connection template.
    SetConnectionPath {
        machine: String,
        path: Option<PathBuf>,
    },
    /// Stamp a machine as just used.
    RecordUsed(String),
    /// Replace the machine order wholesale.
    Reorder(Vec<String>),
    /// Move one machine to a position.
    MoveMachine { machine: String, index: usize },
    /// Create a category.
    AddCategory { name: String, color: Option<Color> },
    /// Delete a category, reassigning its machines to the default.
    DeleteCategory(String),
    /// Rename a category.
    RenameCategory { from: String, to: String },
    /// Set or clear a category color.
    SetCategoryColor {
        category: String,
        color: Option<Color>,
    },
    /// Put a machine in a category.
    AssignCategory { machine: String, category: String },
    /// Return a machine to the default category.
    ClearCategory(String),
    /// Create a tag.
    AddTag(String),
    /// Delete a tag from the tag list and every machine.
    DeleteTag(String),
    /// Give a machine a tag.
    AssignTag { machine: String, tag: String },
    /// Take a tag off a machine.
    UnassignTag { machine: String, tag: String },
    /// Assign the tag if missing, unassign it if present.
    ToggleTag { machine: String, tag: String },
    /// Select a category filter, or clear it if already selected.
    ToggleCategoryFilter(String),
    /// Add or remove a tag from the tag filter.
    ToggleTagFilter(String),
    /// Drop the tag filter.
    ClearTagFilter,
    /// Drop every filter.
    ClearFilters,
    /// Apply a probe result reported by a worker.
    ApplyProbe(ProbeReport),
    /// Accept a changed address as the machine's new known address.
    AcceptAddress(String),
}

/// What a dispatched action did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The action changed state (or was a successful no-op).
    Applied,
    /// The action was rejected; nothing changed.
    Rejected,
    /// Names actually added by a batch add.
    Added(Vec<String>),
}

impl Outcome {
    /// Whether the action took effect.
    pub fn is_applied(&self) -> bool {
        match self {
            Outcome::Applied => true,
            Outcome::Rejected => false,
            Outcome::Added(names) => !names.is_empty(),
        }
    }

    fn from_bool(applied: bool) -> Self {
        if applied {
            Outcome::Applied
        } else {
            Outcome::Rejected
        }
    }
}

/// Work order for one status refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshTick {
    /// Monotonic tick number carried back in every [`ProbeReport`].
    pub tick: u64,
    /// Machines to probe.
    pub machines: Vec<String>,
}

/// Owner of every index and the filtered view.
///
/// All mutation goes through [`Desk::dispatch`] on a single thread; probe
/// workers only hand back [`ProbeReport`]s. The view is recomputed after
/// every dispatched action and refresh tick.
#[derive(Debug)]
pub struct Desk<R> {
    repo: R,
    records: RecordStore,
    categories: CategoryIndex,
    tags: TagIndex,
    status: StatusSnapshot,
    filter: FilterState,
    view: Vec<String>,
    tick: u64,
    // Tick at which each machine name was last deleted. Reports issued at or
    // before it belong to the old machine even if the name is re-added.
    removed_at: BTreeMap<String, u64>,
}

impl<R: DeskRepository> Desk<R> {
    /// Load every group from the repository.
    pub fn open(repo: R) -> CoreResult<Self> {
        let records = RecordStore::load(&repo)?;
        let categories = CategoryIndex::load(&repo, &records)?;
        let tags = TagIndex::load(&repo, &records)?;
        let mut desk = Self {
            repo,
            records,
            categories,
            tags,
            status: StatusSnapshot::default(),
            filter: FilterState::default(),
            view: Vec::new(),
            tick: 0,
            removed_at: BTreeMap::new(),
        };
        desk.refresh_view();
        debug!(machines = desk.records.len(), "desk opened");
        Ok(desk)
    }

    /// The persistence collaborator.
    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Machine records.
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Category index.
    pub fn categories(&self) -> &CategoryIndex {
        &self.categories
    }

    /// Tag index.
    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    /// Latest probe results.
    pub fn status(&self) -> &StatusSnapshot {
        &self.status
    }

    /// Active filters.
    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    /// Machines to display, in order.
    pub fn view(&self) -> &[String] {
        &self.view
    }

    /// Apply an action and recompute the view.
    pub fn dispatch(&mut self, action: Action) -> CoreResult<Outcome> {
        let outcome = self.apply(action);
        self.refresh_view();
        outcome
    }

    /// Start a status refresh. Probes from older ticks are still accepted
    /// until a newer result for the same machine lands.
    pub fn begin_refresh(&mut self) -> RefreshTick {
        self.tick += 1;
        self.refresh_view();
        RefreshTick {
            tick: self.tick,
            machines: self.records.list(),
        }
    }

    fn refresh_view(&mut self) {
        self.view = filter_view(&self.records, &self.categories, &self.tags, &self.filter);
    }

    fn apply(&mut self, action: Action) -> CoreResult<Outcome> {
        let repo: &dyn DeskRepository = &self.repo;
        let applied = match action {
            Action::AddMachine(name) => self.records.add_machine(repo, &name)?,
            Action::AddMachines(text) => {
                let mut added = Vec::new();
                for name in text.split_whitespace() {
                    if self.records.add_machine(repo, name)? {
                        added.push(name.to_string());
                    }
                }
                return Ok(Outcome::Added(added));
            }
            Action::DeleteMachine(name) => {
                if !self.records.contains(&name) {
                    return Ok(Outcome::Rejected);
                }
                // Indexes first: a failure part way leaves a live machine
                // without assignments, never assignments without a machine.
                self.categories.remove_machine(repo, &name)?;
                self.tags.remove_machine(repo, &name)?;
                self.records.delete_machine(repo, &name)?;
                self.status.remove(&name);
                self.removed_at.insert(name, self.tick);
                true
            }
            Action::SetDescription { machine, text } => {
                self.records.set_description(repo, &machine, &text)?
            }
            Action::SetConnectionPath { machine, path } => {
                self.records.set_connection_path(repo, &machine, path)?
            }
            Action::RecordUsed(machine) => self.records.record_used_now(repo, &machine)?,
            Action::Reorder(order) => self.records.reorder(repo, &order)?,
            Action::MoveMachine { machine, index } => {
                self.records.move_machine(repo, &machine, index)?
            }
            Action::AddCategory { name, color } => {
                self.categories.add_category(repo, &name, color)?
            }
            Action::DeleteCategory(name) => {
                let deleted = self.categories.delete_category(repo, &name)?;
                if deleted {
                    self.filter.forget_category(&name);
                }
                deleted
            }
            Action::RenameCategory { from, to } => {
                let renamed = self.categories.rename_category(repo, &from, &to)?;
                if renamed {
                    self.filter.rename_category(&from, to.trim());
                }
                renamed
            }
            Action::SetCategoryColor { category, color } => {
                self.categories.set_color(repo, &category, color)?
            }
            Action::AssignCategory { machine, category } => {
                self.records.contains(&machine)
                    && self.categories.set_machine_category(repo, &machine, &category)?
            }
            Action::ClearCategory(machine) => {
                self.records.contains(&machine)
                    && self
                        .categories
                        .set_machine_category(repo, &machine, crate::DEFAULT_CATEGORY)?
            }
            Action::AddTag(name) => self.tags.add_tag(repo, &name)?,
            Action::DeleteTag(name) => {
                let deleted = self.tags.delete_tag(repo, &name)?;
                if deleted {
                    self.filter.forget_tag(&name);
                }
                deleted
            }
            Action::AssignTag { machine, tag } => {
                self.records.contains(&machine) && self.tags.assign_tag(repo, &machine, &tag)?
            }
            Action::UnassignTag { machine, tag } => self.tags.unassign_tag(repo, &machine, &tag)?,
            Action::ToggleTag { machine, tag } => {
                if self.tags.has_tag(&machine, &tag) {
                    self.tags.unassign_tag(repo, &machine, &tag)?
                } else {
                    self.records.contains(&machine) && self.tags.assign_tag(repo, &machine, &tag)?
                }
            }
            Action::ToggleCategoryFilter(category) => {
                let known = self.categories.contains(&category);
                if known {
                    self.filter.toggle_category(&category);
                }
                known
            }
            Action::ToggleTagFilter(tag) => {
                let known = self.tags.contains(&tag);
                if known {
                    self.filter.toggle_tag(&tag);
                }
                known
            }
            Action::ClearTagFilter => {
                self.filter.clear_tags();
                true
            }
            Action::ClearFilters => {
                self.filter.clear();
                true
            }
            Action::ApplyProbe(report) => self.apply_probe(report)?,
            Action::AcceptAddress(machine) => self.accept_address(&machine)?,
        };
        Ok(Outcome::from_bool(applied))
    }

    fn apply_probe(&mut self, report: ProbeReport) -> CoreResult<bool> {
        let Some(record) = self.records.get(&report.machine) else {
            debug!(machine = %report.machine, tick = report.tick, "discarding probe for deleted machine");
            return Ok(false);
        };
        if self
            .removed_at
            .get(&report.machine)
            .is_some_and(|&removed| report.tick <= removed)
        {
            debug!(machine = %report.machine, tick = report.tick, "discarding probe issued before re-add");
            return Ok(false);
        }
        if self
            .status
            .get(&report.machine)
            .is_some_and(|status| status.tick > report.tick)
        {
            debug!(machine = %report.machine, tick = report.tick, "discarding stale probe");
            return Ok(false);
        }

        let resolved = report.outcome.address;
        let address_change = match (record.last_known_address, resolved) {
            (Some(previous), Some(current)) if previous != current => {
                warn!(machine = %report.machine, %previous, %current, "machine address changed");
                Some(AddressChange { previous, current })
            }
            (None, Some(current)) => {
                self.records
                    .set_last_known_address(&self.repo, &report.machine, current)?;
                None
            }
            _ => None,
        };

        self.status.insert(
            report.machine,
            MachineStatus {
                reachable: report.outcome.reachable,
                address: resolved,
                address_change,
                tick: report.tick,
            },
        );
        Ok(true)
    }

    fn accept_address(&mut self, machine: &str) -> CoreResult<bool> {
        let Some(change) = self.status.address_change(machine) else {
            return Ok(false);
        };
        self.records
            .set_last_known_address(&self.repo, machine, change.current)?;
        self.status.clear_address_change(machine);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRepository, ProbeOutcome, DEFAULT_CATEGORY};

    fn desk_with(names: &[&str]) -> Desk<MemoryRepository> {
        let mut desk = Desk::open(MemoryRepository::default()).unwrap();
        for name in names {
            desk.dispatch(Action::AddMachine((*name).to_string())).unwrap();
        }
        desk
    }

    fn report(machine: &str, tick: u64, reachable: bool, address: Option<&str>) -> ProbeReport {
        ProbeReport {
            machine: machine.to_string(),
            tick,
            outcome: ProbeOutcome {
                reachable,
                address: address.map(|value| value.parse().unwrap()),
            },
        }
    }

    #[test]
    fn batch_add_reports_new_names_only() {
        let mut desk = desk_with(&["Alpha"]);
        let outcome = desk
            .dispatch(Action::AddMachines("Alpha\nBeta  Gamma\n\nBeta".into()))
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Added(vec!["Beta".to_string(), "Gamma".to_string()])
        );
        assert_eq!(desk.view(), ["Alpha", "Beta", "Gamma"]);
    }

    #[test]
    fn delete_cascades_to_every_index() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddCategory {
            name: "Lab".into(),
            color: None,
        })
        .unwrap();
        desk.dispatch(Action::AssignCategory {
            machine: "Alpha".into(),
            category: "Lab".into(),
        })
        .unwrap();
        desk.dispatch(Action::AddTag("prod".into())).unwrap();
        desk.dispatch(Action::AssignTag {
            machine: "Alpha".into(),
            tag: "prod".into(),
        })
        .unwrap();
        desk.dispatch(Action::ApplyProbe(report("Alpha", 1, true, None)))
            .unwrap();

        assert!(desk
            .dispatch(Action::DeleteMachine("Alpha".into()))
            .unwrap()
            .is_applied());
        assert!(!desk.records().contains("Alpha"));
        assert!(!desk.categories().assignments().contains_key("Alpha"));
        assert!(!desk.tags().assignments().contains_key("Alpha"));
        assert!(desk.status().get("Alpha").is_none());
        assert_eq!(desk.view(), ["Beta"]);
    }

    #[test]
    fn assignments_require_existing_machine() {
        let mut desk = desk_with(&["Alpha"]);
        desk.dispatch(Action::AddTag("prod".into())).unwrap();
        let outcome = desk
            .dispatch(Action::AssignTag {
                machine: "Ghost".into(),
                tag: "prod".into(),
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected);
        let outcome = desk
            .dispatch(Action::AssignCategory {
                machine: "Ghost".into(),
                category: DEFAULT_CATEGORY.into(),
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected);
    }

    #[test]
    fn tag_toggle_hides_machine_under_active_filter() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddTag("prod".into())).unwrap();
        for machine in ["Alpha", "Beta"] {
            desk.dispatch(Action::AssignTag {
                machine: machine.into(),
                tag: "prod".into(),
            })
            .unwrap();
        }
        desk.dispatch(Action::ToggleTagFilter("prod".into())).unwrap();
        assert_eq!(desk.view(), ["Alpha", "Beta"]);

        desk.dispatch(Action::ToggleTag {
            machine: "Alpha".into(),
            tag: "prod".into(),
        })
        .unwrap();
        assert_eq!(desk.view(), ["Beta"]);
        assert_eq!(desk.filter().selected_tags().len(), 1);
    }

    #[test]
    fn category_change_hides_machine_under_active_filter() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddCategory {
            name: "Lab".into(),
            color: None,
        })
        .unwrap();
        for machine in ["Alpha", "Beta"] {
            desk.dispatch(Action::AssignCategory {
                machine: machine.into(),
                category: "Lab".into(),
            })
            .unwrap();
        }
        desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
            .unwrap();
        desk.dispatch(Action::ClearCategory("Beta".into())).unwrap();
        assert_eq!(desk.view(), ["Alpha"]);
    }

    #[test]
    fn renaming_filtered_category_keeps_filter() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddCategory {
            name: "Lab".into(),
            color: None,
        })
        .unwrap();
        desk.dispatch(Action::AssignCategory {
            machine: "Beta".into(),
            category: "Lab".into(),
        })
        .unwrap();
        desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
            .unwrap();
        desk.dispatch(Action::RenameCategory {
            from: "Lab".into(),
            to: "Bench".into(),
        })
        .unwrap();
        assert_eq!(desk.filter().selected_category(), Some("Bench"));
        assert_eq!(desk.view(), ["Beta"]);
    }

    #[test]
    fn deleting_filtered_category_or_tag_drops_it_from_filter() {
        let mut desk = desk_with(&["Alpha"]);
        desk.dispatch(Action::AddCategory {
            name: "Lab".into(),
            color: None,
        })
        .unwrap();
        desk.dispatch(Action::AddTag("prod".into())).unwrap();
        desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
            .unwrap();
        desk.dispatch(Action::ToggleTagFilter("prod".into())).unwrap();
        assert!(desk.view().is_empty());

        desk.dispatch(Action::DeleteCategory("Lab".into())).unwrap();
        desk.dispatch(Action::DeleteTag("prod".into())).unwrap();
        assert!(!desk.filter().is_active());
        assert_eq!(desk.view(), ["Alpha"]);
    }

    #[test]
    fn unknown_filters_are_rejected() {
        let mut desk = desk_with(&["Alpha"]);
        assert_eq!(
            desk.dispatch(Action::ToggleTagFilter("nope".into())).unwrap(),
            Outcome::Rejected
        );
        assert_eq!(
            desk.dispatch(Action::ToggleCategoryFilter("nope".into()))
                .unwrap(),
            Outcome::Rejected
        );
        assert!(!desk.filter().is_active());
    }

    #[test]
    fn probe_for_deleted_machine_is_discarded() {
        let mut desk = desk_with(&["Alpha"]);
        let tick = desk.begin_refresh();
        assert_eq!(tick.machines, vec!["Alpha"]);
        desk.dispatch(Action::DeleteMachine("Alpha".into())).unwrap();
        let outcome = desk
            .dispatch(Action::ApplyProbe(report("Alpha", tick.tick, true, None)))
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected);
        assert!(desk.status().get("Alpha").is_none());
    }

    #[test]
    fn result_issued_before_delete_is_discarded_after_re_add() {
        let mut desk = desk_with(&["Alpha"]);
        let tick = desk.begin_refresh();
        desk.dispatch(Action::DeleteMachine("Alpha".into())).unwrap();
        desk.dispatch(Action::AddMachine("Alpha".into())).unwrap();

        let outcome = desk
            .dispatch(Action::ApplyProbe(report("Alpha", tick.tick, true, Some("10.9.9.9"))))
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected);
        assert!(desk.status().get("Alpha").is_none());
        assert!(desk.records().get("Alpha").unwrap().last_known_address.is_none());

        let next = desk.begin_refresh();
        assert!(desk
            .dispatch(Action::ApplyProbe(report("Alpha", next.tick, true, Some("10.0.0.1"))))
            .unwrap()
            .is_applied());
        assert!(desk.status().is_reachable("Alpha"));
    }

    #[test]
    fn failed_cascade_keeps_machine_and_assignments_together() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddCategory {
            name: "Lab".into(),
            color: None,
        })
        .unwrap();
        desk.dispatch(Action::AssignCategory {
            machine: "Alpha".into(),
            category: "Lab".into(),
        })
        .unwrap();

        desk.repository()
            .fail_group(Some(crate::FieldGroup::MachineCategories));
        assert!(desk.dispatch(Action::DeleteMachine("Alpha".into())).is_err());
        assert!(desk.records().contains("Alpha"));
        assert_eq!(desk.categories().category_of("Alpha"), "Lab");
        assert_eq!(desk.view(), ["Alpha", "Beta"]);

        desk.repository().fail_group(None);
        assert!(desk
            .dispatch(Action::DeleteMachine("Alpha".into()))
            .unwrap()
            .is_applied());
        assert!(!desk.categories().assignments().contains_key("Alpha"));
        assert_eq!(desk.view(), ["Beta"]);
    }

    #[test]
    fn late_result_from_older_tick_does_not_override_newer() {
        let mut desk = desk_with(&["Alpha"]);
        let first = desk.begin_refresh();
        let second = desk.begin_refresh();
        desk.dispatch(Action::ApplyProbe(report("Alpha", second.tick, true, None)))
            .unwrap();
        let outcome = desk
            .dispatch(Action::ApplyProbe(report("Alpha", first.tick, false, None)))
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected);
        assert!(desk.status().is_reachable("Alpha"));
    }

    #[test]
    fn first_resolution_is_recorded_then_changes_are_flagged() {
        let mut desk = desk_with(&["Alpha"]);
        desk.dispatch(Action::ApplyProbe(report("Alpha", 1, true, Some("10.0.0.1"))))
            .unwrap();
        assert_eq!(
            desk.records().get("Alpha").unwrap().last_known_address,
            Some("10.0.0.1".parse().unwrap())
        );
        assert!(desk.status().address_change("Alpha").is_none());

        desk.dispatch(Action::ApplyProbe(report("Alpha", 2, true, Some("10.0.0.9"))))
            .unwrap();
        let change = desk.status().address_change("Alpha").unwrap();
        assert_eq!(change.previous, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(change.current, "10.0.0.9".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(
            desk.records().get("Alpha").unwrap().last_known_address,
            Some("10.0.0.1".parse().unwrap())
        );

        assert!(desk
            .dispatch(Action::AcceptAddress("Alpha".into()))
            .unwrap()
            .is_applied());
        assert!(desk.status().address_change("Alpha").is_none());
        assert_eq!(
            desk.records().get("Alpha").unwrap().last_known_address,
            Some("10.0.0.9".parse().unwrap())
        );
        assert_eq!(
            desk.dispatch(Action::AcceptAddress("Alpha".into())).unwrap(),
            Outcome::Rejected
        );
    }

    #[test]
    fn reopening_restores_state() {
        let mut desk = desk_with(&["Alpha", "Beta"]);
        desk.dispatch(Action::AddTag("prod".into())).unwrap();
        desk.dispatch(Action::AssignTag {
            machine: "Beta".into(),
            tag: "prod".into(),
        })
        .unwrap();
        desk.dispatch(Action::MoveMachine {
            machine: "Beta".into(),
            index: 0,
        })
        .unwrap();
        let Desk { repo, .. } = desk;
        let reopened = Desk::open(repo).unwrap();
        assert_eq!(reopened.view(), ["Beta", "Alpha"]);
        assert!(reopened.tags().has_tag("Beta", "prod"));
    }
}
