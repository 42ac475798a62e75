use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{is_storable, CoreResult, DeskRepository, FieldGroup, RecordStore};

/// Global tag names plus the set of tags assigned to each machine.
#[derive(Clone, Debug, Default)]
pub struct TagIndex {
    tags: Vec<String>,
    assignments: BTreeMap<String, BTreeSet<String>>,
}

impl TagIndex {
    /// Load tags and assignments for the machines in `records`.
    pub fn load(repo: &dyn DeskRepository, records: &RecordStore) -> CoreResult<Self> {
        let mut index = Self::default();
        for tag in repo.load_list(FieldGroup::Tags)? {
            let tag = tag.trim();
            if !tag.is_empty() && !index.contains(tag) {
                index.tags.push(tag.to_string());
            }
        }
        for (machine, value) in repo.load_map(FieldGroup::MachineTags)? {
            if !records.contains(&machine) {
                debug!(machine = %machine, "dropping tags for unknown machine");
                continue;
            }
            let assigned: BTreeSet<String> = value
                .split(',')
                .map(str::trim)
                .filter(|tag| index.contains(tag))
                .map(str::to_string)
                .collect();
            if !assigned.is_empty() {
                index.assignments.insert(machine, assigned);
            }
        }
        Ok(index)
    }

    /// Every tag, in creation order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Whether the tag exists globally.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|known| known == tag)
    }

    /// Tags assigned to a machine, sorted.
    pub fn tags_of(&self, machine: &str) -> Vec<String> {
        self.assignments
            .get(machine)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `machine` carries `tag`.
    pub fn has_tag(&self, machine: &str, tag: &str) -> bool {
        self.assignments
            .get(machine)
            .is_some_and(|tags| tags.contains(tag))
    }

    /// Add a tag. Rejects empty names, names containing `,` and duplicates.
    pub fn add_tag(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        let name = name.trim();
        if !is_storable(name, &[',']) || self.contains(name) {
            return Ok(false);
        }
        let mut next = self.clone();
        next.tags.push(name.to_string());
        next.persist(repo, &[FieldGroup::Tags])?;
        *self = next;
        debug!(tag = %name, "tag added");
        Ok(true)
    }

    /// Delete a tag everywhere. Both groups are written before the in-memory
    /// index changes, so readers never see a half-removed tag.
    pub fn delete_tag(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        if !self.contains(name) {
            return Ok(false);
        }
        let mut next = self.clone();
        next.tags.retain(|tag| tag != name);
        for tags in next.assignments.values_mut() {
            tags.remove(name);
        }
        next.assignments.retain(|_, tags| !tags.is_empty());
        next.persist(repo, &[FieldGroup::MachineTags, FieldGroup::Tags])?;
        *self = next;
        debug!(tag = %name, "tag deleted");
        Ok(true)
    }

    /// Assign a known tag. Assigning an already present tag is a successful
    /// no-op.
    pub fn assign_tag(
        &mut self,
        repo: &dyn DeskRepository,
        machine: &str,
        tag: &str,
    ) -> CoreResult<bool> {
        if !self.contains(tag) {
            return Ok(false);
        }
        if self.has_tag(machine, tag) {
            return Ok(true);
        }
        let mut next = self.clone();
        next.assignments
            .entry(machine.to_string())
            .or_default()
            .insert(tag.to_string());
        next.persist(repo, &[FieldGroup::MachineTags])?;
        *self = next;
        Ok(true)
    }

    /// Remove an assignment. Returns `false` when the machine lacks the tag.
    pub fn unassign_tag(
        &mut self,
        repo: &dyn DeskRepository,
        machine: &str,
        tag: &str,
    ) -> CoreResult<bool> {
        if !self.has_tag(machine, tag) {
            return Ok(false);
        }
        let mut next = self.clone();
        if let Some(tags) = next.assignments.get_mut(machine) {
            tags.remove(tag);
            if tags.is_empty() {
                next.assignments.remove(machine);
            }
        }
        next.persist(repo, &[FieldGroup::MachineTags])?;
        *self = next;
        Ok(true)
    }

    /// Machines carrying every tag in `tags`, in record order. An empty set
    /// matches every machine.
    pub fn machines_with_all_tags(
        &self,
        tags: &BTreeSet<String>,
        records: &RecordStore,
    ) -> Vec<String> {
        records
            .list()
            .into_iter()
            .filter(|machine| match self.assignments.get(machine) {
                Some(assigned) => tags.is_subset(assigned),
                None => tags.is_empty(),
            })
            .collect()
    }

    /// Machines with at least one tag, mapped to their tags.
    pub fn assignments(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.assignments
    }

    /// Drop every assignment of a deleted machine.
    pub fn remove_machine(&mut self, repo: &dyn DeskRepository, machine: &str) -> CoreResult<()> {
        if !self.assignments.contains_key(machine) {
            return Ok(());
        }
        let mut next = self.clone();
        next.assignments.remove(machine);
        next.persist(repo, &[FieldGroup::MachineTags])?;
        *self = next;
        Ok(())
    }

    fn persist(&self, repo: &dyn DeskRepository, groups: &[FieldGroup]) -> CoreResult<()> {
        for group in groups {
            match group {
                FieldGroup::Tags => repo.save_list(*group, &self.tags)?,
                FieldGroup::MachineTags => {
                    let entries: Vec<(String, String)> = self
                        .assignments
                        .iter()
                        .map(|(machine, tags)| {
                            let joined = tags.iter().map(String::as_str).collect::<Vec<_>>().join(",");
                            (machine.clone(), joined)
                        })
                        .collect();
                    repo.save_map(*group, &entries)?;
                }
                other => unreachable!("{other:?} is not a tag group"),
            }
        }
        Ok(())
    }
}
