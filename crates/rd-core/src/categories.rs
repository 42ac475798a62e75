use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    is_storable, Category, Color, CoreResult, DeskRepository, FieldGroup, RecordStore,
    DEFAULT_CATEGORY,
};

/// Category names plus the single category assigned to each machine.
///
/// Machines without an explicit assignment belong to [`DEFAULT_CATEGORY`],
/// which always exists and can be neither renamed nor deleted.
#[derive(Clone, Debug)]
pub struct CategoryIndex {
    categories: Vec<Category>,
    assignments: BTreeMap<String, String>,
}

impl Default for CategoryIndex {
    fn default() -> Self {
        Self {
            categories: vec![Category::new(DEFAULT_CATEGORY)],
            assignments: BTreeMap::new(),
        }
    }
}

impl CategoryIndex {
    /// Load categories, colors and assignments for the machines in `records`.
    pub fn load(repo: &dyn DeskRepository, records: &RecordStore) -> CoreResult<Self> {
        let mut index = Self::default();
        for name in repo.load_list(FieldGroup::Categories)? {
            let name = name.trim();
            if name.is_empty() || index.contains(name) {
                continue;
            }
            index.categories.push(Category::new(name));
        }
        for (name, value) in repo.load_map(FieldGroup::CategoryColors)? {
            match Color::parse(value) {
                Ok(color) => {
                    if let Some(category) = index.find_mut(&name) {
                        category.color = Some(color);
                    }
                }
                Err(err) => warn!(category = %name, error = %err, "skipping unreadable color"),
            }
        }
        for (machine, category) in repo.load_map(FieldGroup::MachineCategories)? {
            let category = category.trim();
            if !records.contains(&machine) || category == DEFAULT_CATEGORY {
                continue;
            }
            if !index.contains(category) {
                debug!(machine = %machine, category = %category, "dropping assignment to unknown category");
                continue;
            }
            index.assignments.insert(machine, category.to_string());
        }
        Ok(index)
    }

    /// Every category, default first.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    /// Category names, default first.
    pub fn names(&self) -> Vec<String> {
        self.categories.iter().map(|category| category.name.clone()).collect()
    }

    /// Whether a category with this exact name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.categories.iter().any(|category| category.name == name)
    }

    /// Look up a category by name.
    pub fn get(&self, name: &str) -> Option<&Category> {
        self.categories.iter().find(|category| category.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Category> {
        self.categories.iter_mut().find(|category| category.name == name)
    }

    /// The category a machine belongs to.
    pub fn category_of(&self, machine: &str) -> &str {
        self.assignments
            .get(machine)
            .map_or(DEFAULT_CATEGORY, String::as_str)
    }

    /// Add a category. Rejects empty names, the reserved name and duplicates.
    pub fn add_category(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        color: Option<Color>,
    ) -> CoreResult<bool> {
        let name = name.trim();
        if !is_storable(name, &[]) || self.contains(name) {
            return Ok(false);
        }
        let mut next = self.clone();
        next.categories.push(Category {
            name: name.to_string(),
            color,
        });
        next.persist(repo, &[FieldGroup::Categories, FieldGroup::CategoryColors])?;
        *self = next;
        debug!(category = %name, "category added");
        Ok(true)
    }

    /// Delete a category, moving its machines back to the default.
    pub fn delete_category(&mut self, repo: &dyn DeskRepository, name: &str) -> CoreResult<bool> {
        if name == DEFAULT_CATEGORY || !self.contains(name) {
            return Ok(false);
        }
        let mut next = self.clone();
        next.assignments.retain(|_, category| category != name);
        next.categories.retain(|category| category.name != name);
        next.persist(
            repo,
            &[
                FieldGroup::MachineCategories,
                FieldGroup::Categories,
                FieldGroup::CategoryColors,
            ],
        )?;
        *self = next;
        debug!(category = %name, "category deleted");
        Ok(true)
    }

    /// Rename a category and every assignment pointing at it.
    pub fn rename_category(
        &mut self,
        repo: &dyn DeskRepository,
        old: &str,
        new: &str,
    ) -> CoreResult<bool> {
        let new = new.trim();
        if old == DEFAULT_CATEGORY
            || !self.contains(old)
            || !is_storable(new, &[])
            || self.contains(new)
        {
            return Ok(false);
        }
        let mut next = self.clone();
        if let Some(category) = next.find_mut(old) {
            category.name = new.to_string();
        }
        for category in next.assignments.values_mut() {
            if category == old {
                *category = new.to_string();
            }
        }
        next.persist(
            repo,
            &[
                FieldGroup::Categories,
                FieldGroup::CategoryColors,
                FieldGroup::MachineCategories,
            ],
        )?;
        *self = next;
        debug!(from = %old, to = %new, "category renamed");
        Ok(true)
    }

    /// Set or clear a category's display color.
    pub fn set_color(
        &mut self,
        repo: &dyn DeskRepository,
        name: &str,
        color: Option<Color>,
    ) -> CoreResult<bool> {
        let mut next = self.clone();
        let Some(category) = next.find_mut(name) else {
            return Ok(false);
        };
        category.color = color;
        next.persist(repo, &[FieldGroup::CategoryColors])?;
        *self = next;
        Ok(true)
    }

    /// Assign a machine to a known category. Assigning the default removes the
    /// explicit assignment.
    pub fn set_machine_category(
        &mut self,
        repo: &dyn DeskRepository,
        machine: &str,
        category: &str,
    ) -> CoreResult<bool> {
        if !self.contains(category) {
            return Ok(false);
        }
        let mut next = self.clone();
        if category == DEFAULT_CATEGORY {
            next.assignments.remove(machine);
        } else {
            next.assignments
                .insert(machine.to_string(), category.to_string());
        }
        next.persist(repo, &[FieldGroup::MachineCategories])?;
        *self = next;
        Ok(true)
    }

    /// Machines in `category`, in record order. The default category
    /// contains every machine.
    pub fn machines_in(&self, category: &str, records: &RecordStore) -> Vec<String> {
        if category == DEFAULT_CATEGORY {
            return records.list();
        }
        records
            .list()
            .into_iter()
            .filter(|machine| self.assignments.get(machine).is_some_and(|assigned| assigned == category))
            .collect()
    }

    /// Machines with an explicit assignment, mapped to their category.
    pub fn assignments(&self) -> &BTreeMap<String, String> {
        &self.assignments
    }

    /// Drop the assignment for a deleted machine.
    pub fn remove_machine(&mut self, repo: &dyn DeskRepository, machine: &str) -> CoreResult<()> {
        if !self.assignments.contains_key(machine) {
            return Ok(());
        }
        let mut next = self.clone();
        next.assignments.remove(machine);
        next.persist(repo, &[FieldGroup::MachineCategories])?;
        *self = next;
        Ok(())
    }

    fn persist(&self, repo: &dyn DeskRepository, groups: &[FieldGroup]) -> CoreResult<()> {
        for group in groups {
            match group {
                FieldGroup::Categories => repo.save_list(*group, &self.names())?,
                FieldGroup::CategoryColors => {
                    let colors: Vec<(String, String)> = self
                        .categories
                        .iter()
                        .filter_map(|category| {
                            category
                                .color
                                .as_ref()
                                .map(|color| (category.name.clone(), color.as_str().to_string()))
                        })
                        .collect();
                    repo.save_map(*group, &colors)?;
                }
                FieldGroup::MachineCategories => {
                    let entries: Vec<(String, String)> = self
                        .assignments
                        .iter()
                        .map(|(machine, category)| (machine.clone(), category.clone()))
                        .collect();
                    repo.save_map(*group, &entries)?;
                }
                other => unreachable!("{other:?} is not a category group"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepository;

    fn setup() -> (MemoryRepository, RecordStore, CategoryIndex) {
        let repo = MemoryRepository::default();
        let mut records = RecordStore::default();
        for name in ["Alpha", "Beta", "Gamma"] {
            records.add_machine(&repo, name).unwrap();
        }
        (repo, records, CategoryIndex::default())
    }

    #[test]
    fn default_always_present_and_protected() {
        let (repo, _, mut index) = setup();
        assert_eq!(index.names(), vec![DEFAULT_CATEGORY]);
        assert!(!index.add_category(&repo, DEFAULT_CATEGORY, None).unwrap());
        assert!(!index.delete_category(&repo, DEFAULT_CATEGORY).unwrap());
        assert!(!index.rename_category(&repo, DEFAULT_CATEGORY, "Other").unwrap());
        assert!(index.contains(DEFAULT_CATEGORY));
    }

    #[test]
    fn add_rejects_empty_and_duplicates_case_sensitively() {
        let (repo, _, mut index) = setup();
        assert!(!index.add_category(&repo, "", None).unwrap());
        assert!(index.add_category(&repo, "Lab", None).unwrap());
        assert!(!index.add_category(&repo, "Lab", None).unwrap());
        assert!(index.add_category(&repo, "lab", None).unwrap());
        assert!(index.add_category(&repo, "default", None).unwrap());
    }

    #[test]
    fn default_category_contains_everything() {
        let (repo, records, mut index) = setup();
        index.add_category(&repo, "Lab", None).unwrap();
        index.set_machine_category(&repo, "Beta", "Lab").unwrap();
        assert_eq!(index.machines_in(DEFAULT_CATEGORY, &records), records.list());
        assert_eq!(index.machines_in("Lab", &records), vec!["Beta"]);
    }

    #[test]
    fn set_machine_category_requires_known_category() {
        let (repo, _, mut index) = setup();
        assert!(!index.set_machine_category(&repo, "Alpha", "Nope").unwrap());
        assert_eq!(index.category_of("Alpha"), DEFAULT_CATEGORY);
    }

    #[test]
    fn delete_reassigns_to_default() {
        let (repo, records, mut index) = setup();
        index.add_category(&repo, "Lab", None).unwrap();
        index.set_machine_category(&repo, "Beta", "Lab").unwrap();
        assert!(index.delete_category(&repo, "Lab").unwrap());
        assert_eq!(index.category_of("Beta"), DEFAULT_CATEGORY);
        assert!(!index.contains("Lab"));
        assert!(repo.map(FieldGroup::MachineCategories).is_empty());
        assert!(index.machines_in(DEFAULT_CATEGORY, &records).contains(&"Beta".to_string()));
    }

    #[test]
    fn rename_moves_assignments_and_color() {
        let (repo, records, mut index) = setup();
        let color = Color::parse("#112233").unwrap();
        index.add_category(&repo, "Lab", Some(color.clone())).unwrap();
        index.add_category(&repo, "Prod", None).unwrap();
        index.set_machine_category(&repo, "Gamma", "Lab").unwrap();

        assert!(!index.rename_category(&repo, "Lab", "Prod").unwrap());
        assert!(!index.rename_category(&repo, "Lab", "").unwrap());
        assert!(!index.rename_category(&repo, "Missing", "X").unwrap());
        assert!(index.rename_category(&repo, "Lab", "Bench").unwrap());

        assert_eq!(index.category_of("Gamma"), "Bench");
        assert_eq!(index.machines_in("Bench", &records), vec!["Gamma"]);
        assert_eq!(index.get("Bench").unwrap().color, Some(color));
        assert_eq!(index.names(), vec![DEFAULT_CATEGORY, "Bench", "Prod"]);
    }

    #[test]
    fn load_prunes_orphans_and_unknown_categories() {
        let (repo, records, mut index) = setup();
        index
            .add_category(&repo, "Lab", Some(Color::parse("#abcdef").unwrap()))
            .unwrap();
        index.set_machine_category(&repo, "Alpha", "Lab").unwrap();
        repo.insert_map(FieldGroup::MachineCategories, "Ghost", "Lab");
        repo.insert_map(FieldGroup::MachineCategories, "Beta", "Vanished");

        let loaded = CategoryIndex::load(&repo, &records).unwrap();
        assert_eq!(loaded.names(), vec![DEFAULT_CATEGORY, "Lab"]);
        assert_eq!(loaded.category_of("Alpha"), "Lab");
        assert_eq!(loaded.category_of("Beta"), DEFAULT_CATEGORY);
        assert!(!loaded.assignments().contains_key("Ghost"));
        assert_eq!(
            loaded.get("Lab").unwrap().color.as_ref().map(Color::as_str),
            Some("#abcdef")
        );
    }
}
