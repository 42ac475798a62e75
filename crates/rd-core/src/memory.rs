use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::{CoreError, CoreResult, DeskRepository, FieldGroup};

/// In-memory repository, for tests and embedding without a data directory.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    lists: RefCell<BTreeMap<FieldGroup, Vec<String>>>,
    maps: RefCell<BTreeMap<FieldGroup, Vec<(String, String)>>>,
    fail_writes: Cell<bool>,
    fail_group: Cell<Option<FieldGroup>>,
}

impl MemoryRepository {
    /// Make every subsequent save fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Make saves of one group fail, leaving the others writable.
    pub fn fail_group(&self, group: Option<FieldGroup>) {
        self.fail_group.set(group);
    }

    /// Current contents of a list group.
    pub fn list(&self, group: FieldGroup) -> Vec<String> {
        self.lists.borrow().get(&group).cloned().unwrap_or_default()
    }

    /// Current contents of a map group.
    pub fn map(&self, group: FieldGroup) -> Vec<(String, String)> {
        self.maps.borrow().get(&group).cloned().unwrap_or_default()
    }

    /// Append a raw entry to a map group, bypassing any validation.
    pub fn insert_map(&self, group: FieldGroup, key: &str, value: &str) {
        self.maps
            .borrow_mut()
            .entry(group)
            .or_default()
            .push((key.to_string(), value.to_string()));
    }

    fn check_writable(&self, group: FieldGroup) -> CoreResult<()> {
        if self.fail_writes.get() || self.fail_group.get() == Some(group) {
            return Err(CoreError::Storage("writes disabled".into()));
        }
        Ok(())
    }
}

impl DeskRepository for MemoryRepository {
    fn load_list(&self, group: FieldGroup) -> CoreResult<Vec<String>> {
        Ok(self.list(group))
    }

    fn save_list(&self, group: FieldGroup, items: &[String]) -> CoreResult<()> {
        self.check_writable(group)?;
        self.lists.borrow_mut().insert(group, items.to_vec());
        Ok(())
    }

    fn load_map(&self, group: FieldGroup) -> CoreResult<Vec<(String, String)>> {
        Ok(self.map(group))
    }

    fn save_map(&self, group: FieldGroup, entries: &[(String, String)]) -> CoreResult<()> {
        self.check_writable(group)?;
        self.maps.borrow_mut().insert(group, entries.to_vec());
        Ok(())
    }
}
