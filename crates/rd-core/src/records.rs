use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{is_storable, CoreResult, DeskRepository, FieldGroup, MachineRecord};

const RECORD_GROUPS: [FieldGroup; 5] = [
    FieldGroup::Machines,
    FieldGroup::LastUsed,
    FieldGroup::Descriptions,
    FieldGroup::ConnectionPaths,
    FieldGroup::Addresses,
];

/// Ordered machine records and their attributes.
///
/// Membership here is the source of truth for every other index. Each
/// mutation persists the prospective state before committing it.
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    records: Vec<MachineRecord>,
}

impl RecordStore {
    /// Load all record groups, dropping duplicates and orphaned attributes.
    pub fn load(repo: &dyn DeskRepository) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for name in repo.load_list(FieldGroup::Machines)? {
            let name = name.trim().to_string();
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            records.push(MachineRecord::new(name));
        }
        let mut store = Self { records };

        for (name, value) in repo.load_map(FieldGroup::LastUsed)? {
            match DateTime::parse_from_rfc3339(value.trim()) {
                Ok(at) => store.with_record(&name, |record| {
                    record.last_used = Some(at.with_timezone(&Utc));
                }),
                Err(err) => warn!(machine = %name, value = %value, error = %err, "skipping unreadable last-used time"),
            }
        }
        for (name, value) in repo.load_map(FieldGroup::Descriptions)? {
            store.with_record(&name, |record| {
                record.description = Some(value).filter(|text| !text.is_empty());
            });
        }
        for (name, value) in repo.load_map(FieldGroup::ConnectionPaths)? {
            let value = value.trim().to_string();
            store.with_record(&name, |record| {
                record.connection_path = Some(PathBuf::from(value)).filter(|path| !path.as_os_str().is_empty());
            });
        }
        for (name, value) in repo.load_map(FieldGroup::Addresses)? {
            match value.trim().parse::<IpAddr>() {
                Ok(address) => store.with_record(&name, |record| {
                    record.last_known_address = Some(address);
                }),
                Err(err) => warn!(machine = %name, value = %value, error = %err, "skipping unreadable address"),
            }
        }
        Ok(store)
    }

    fn with_record(&mut self, name: &str, apply: impl FnOnce(&mut MachineRecord)) {
        match self.records.iter_mut().find(|record| record.name == name) {
            Some(record) => apply(record),
            None => debug!(machine = %name, "dropping attribute for unknown machine"),
        }
    }

    /// Machine names in stored order.
    pub fn list(&self) -> Vec<String> {
        self.records.iter().map(|record| record.name.clone()).collect()
    }

    /// Records in stored order.
    pub fn records(&self) -> &[MachineRecord] {
        &self.records
    }

    /// Look up a single record.
    pub fn get(&self, name: &str) -> Option<&MachineRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Whether a machine with this exact name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of machines.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no machines.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Add a machine with default attributes. Rejects empty or duplicate names.
    pub fn add_machine(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        let name = name.trim();
        if !is_storable(name, &[':']) || name.contains(char::is_whitespace) || self.contains(name) {
            return Ok(false);
        }
        self.commit(repo, &[FieldGroup::Machines], |records| {
            records.push(MachineRecord::new(name));
        })?;
        debug!(machine = %name, "machine added");
        Ok(true)
    }

    /// Remove a machine and every attribute stored for it.
    pub fn delete_machine(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        if !self.contains(name) {
            return Ok(false);
        }
        self.commit(repo, &RECORD_GROUPS, |records| {
            records.retain(|record| record.name != name);
        })?;
        debug!(machine = %name, "machine deleted");
        Ok(true)
    }

    /// Set or clear the description. Line breaks are flattened to spaces.
    pub fn set_description(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        text: &str,
    ) -> CoreResult<bool> {
        let text = text.replace(['\r', '\n'], " ").trim().to_string();
        self.update(repo, name, FieldGroup::Descriptions, |record| {
            record.description = Some(text).filter(|text| !text.is_empty());
        })
    }

    /// Set or clear the per-machine connection template.
    pub fn set_connection_path(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        path: Option<PathBuf>,
    ) -> CoreResult<bool> {
        let path = path.filter(|path| !path.as_os_str().is_empty());
        self.update(repo, name, FieldGroup::ConnectionPaths, |record| {
            record.connection_path = path;
        })
    }

    /// Stamp the machine as used now.
    pub fn record_used_now(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        self.record_used_at(repo, name, Utc::now())
    }

    /// Stamp the machine as used at a specific time.
    pub fn record_used_at(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        at: DateTime<Utc>,
    ) -> CoreResult<bool> {
        self.update(repo, name, FieldGroup::LastUsed, |record| {
            record.last_used = Some(at);
        })
    }

    /// Remember the address a machine resolved to.
    pub fn set_last_known_address(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        address: IpAddr,
    ) -> CoreResult<bool> {
        self.update(repo, name, FieldGroup::Addresses, |record| {
            record.last_known_address = Some(address);
        })
    }

    /// Replace the stored order. The new order must be a permutation of the
    /// current membership.
    pub fn reorder(&mut self, repo: &dyn DeskRepository, new_order: &[String]) -> CoreResult<bool> {
        let mut requested: Vec<&str> = new_order.iter().map(String::as_str).collect();
        let mut current: Vec<&str> = self.records.iter().map(|record| record.name.as_str()).collect();
        requested.sort_unstable();
        current.sort_unstable();
        if requested != current {
            return Ok(false);
        }
        let positions: Vec<usize> = new_order
            .iter()
            .filter_map(|name| self.records.iter().position(|record| &record.name == name))
            .collect();
        self.commit(repo, &[FieldGroup::Machines], |records| {
            let previous = std::mem::take(records);
            records.extend(positions.iter().map(|&index| previous[index].clone()));
        })?;
        Ok(true)
    }

    /// Move one machine to `index`, clamped to the end of the list.
    pub fn move_machine(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        index: usize,
    ) -> CoreResult<bool> {
        let Some(from) = self.records.iter().position(|record| record.name == name) else {
            return Ok(false);
        };
        let mut order = self.list();
        let moved = order.remove(from);
        let index = index.min(order.len());
        order.insert(index, moved);
        self.reorder(repo, &order)
    }

    fn update(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        group: FieldGroup,
        apply: impl FnOnce(&mut MachineRecord),
    ) -> CoreResult<bool> {
        let Some(index) = self.records.iter().position(|record| record.name == name) else {
            return Ok(false);
        };
        self.commit(repo, &[group], |records| apply(&mut records[index]))?;
        Ok(true)
    }

    fn commit(
        &mut self,
        repo: &dyn DeskRepository,
        groups: &[FieldGroup],
        mutate: impl FnOnce(&mut Vec<MachineRecord>),
    ) -> CoreResult<()> {
        let mut next = self.records.clone();
        mutate(&mut next);
        for group in groups {
            persist_group(repo, &next, *group)?;
        }
        self.records = next;
        Ok(())
    }
}

fn persist_group(
    repo: &dyn DeskRepository,
    records: &[MachineRecord],
    group: FieldGroup,
) -> CoreResult<()> {
    let pairs = |value: fn(&MachineRecord) -> Option<String>| -> Vec<(String, String)> {
        records
            .iter()
            .filter_map(|record| value(record).map(|value| (record.name.clone(), value)))
            .collect()
    };
    match group {
        FieldGroup::Machines => {
            let names: Vec<String> = records.iter().map(|record| record.name.clone()).collect();
            repo.save_list(group, &names)
        }
        FieldGroup::LastUsed => repo.save_map(
            group,
            &pairs(|record| record.last_used.map(|at| at.to_rfc3339())),
        ),
        FieldGroup::Descriptions => repo.save_map(group, &pairs(|record| record.description.clone())),
        FieldGroup::ConnectionPaths => repo.save_map(
            group,
            &pairs(|record| {
                record
                    .connection_path
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned())
            }),
        ),
        FieldGroup::Addresses => repo.save_map(
            group,
            &pairs(|record| record.last_known_address.map(|address| address.to_string())),
        ),
        other => unreachable!("{other:?} is not a record group"),
    }
}
