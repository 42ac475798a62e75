use std::collections::{BTreeSet, HashSet};

use crate::{CategoryIndex, RecordStore, TagIndex, DEFAULT_CATEGORY};

/// Session-scoped filter selection. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterState {
    selected_category: Option<String>,
    selected_tags: BTreeSet<String>,
}

impl FilterState {
    /// The active category filter, if any.
    pub fn selected_category(&self) -> Option<&str> {
        self.selected_category.as_deref()
    }

    /// The active tag filter. Empty means no tag filter.
    pub fn selected_tags(&self) -> &BTreeSet<String> {
        &self.selected_tags
    }

    /// Whether any filter is active.
    pub fn is_active(&self) -> bool {
        self.selected_category.is_some() || !self.selected_tags.is_empty()
    }

    /// Select a category, or clear the filter when it is already selected.
    /// Selecting the default category clears the filter as well.
    pub fn toggle_category(&mut self, category: &str) {
        if category == DEFAULT_CATEGORY || self.selected_category.as_deref() == Some(category) {
            self.selected_category = None;
        } else {
            self.selected_category = Some(category.to_string());
        }
    }

    /// Add a tag to the filter, or remove it when already selected.
    pub fn toggle_tag(&mut self, tag: &str) {
        if !self.selected_tags.remove(tag) {
            self.selected_tags.insert(tag.to_string());
        }
    }

    /// Drop every selected tag.
    pub fn clear_tags(&mut self) {
        self.selected_tags.clear();
    }

    /// Drop the category and tag filters.
    pub fn clear(&mut self) {
        self.selected_category = None;
        self.selected_tags.clear();
    }

    pub(crate) fn rename_category(&mut self, old: &str, new: &str) {
        if self.selected_category.as_deref() == Some(old) {
            self.selected_category = Some(new.to_string());
        }
    }

    pub(crate) fn forget_category(&mut self, category: &str) {
        if self.selected_category.as_deref() == Some(category) {
            self.selected_category = None;
        }
    }

    pub(crate) fn forget_tag(&mut self, tag: &str) {
        self.selected_tags.remove(tag);
    }
}

/// Machines to display: record order restricted by the category filter and
/// then by the tag filter.
pub fn filter_view(
    records: &RecordStore,
    categories: &CategoryIndex,
    tags: &TagIndex,
    state: &FilterState,
) -> Vec<String> {
    let mut view = records.list();
    if let Some(category) = state.selected_category() {
        let allowed: HashSet<String> = categories.machines_in(category, records).into_iter().collect();
        view.retain(|machine| allowed.contains(machine));
    }
    if !state.selected_tags().is_empty() {
        let allowed: HashSet<String> = tags
            .machines_with_all_tags(state.selected_tags(), records)
            .into_iter()
            .collect();
        view.retain(|machine| allowed.contains(machine));
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRepository;

    #[test]
    fn same_category_twice_clears_filter() {
        let mut state = FilterState::default();
        state.toggle_category("Lab");
        assert_eq!(state.selected_category(), Some("Lab"));
        state.toggle_category("Lab");
        assert_eq!(state.selected_category(), None);
    }

    #[test]
    fn other_category_replaces_selection() {
        let mut state = FilterState::default();
        state.toggle_category("Lab");
        state.toggle_category("Prod");
        assert_eq!(state.selected_category(), Some("Prod"));
    }

    #[test]
    fn default_category_clears_filter() {
        let mut state = FilterState::default();
        state.toggle_category("Lab");
        state.toggle_category(DEFAULT_CATEGORY);
        assert!(!state.is_active());
    }

    #[test]
    fn tags_accumulate_and_toggle_off() {
        let mut state = FilterState::default();
        state.toggle_tag("prod");
        state.toggle_tag("staging");
        assert_eq!(state.selected_tags().len(), 2);
        state.toggle_tag("prod");
        assert_eq!(
            state.selected_tags().iter().collect::<Vec<_>>(),
            vec!["staging"]
        );
    }

    #[test]
    fn view_is_intersection_in_record_order() {
        let repo = MemoryRepository::default();
        let mut records = RecordStore::default();
        for name in ["Delta", "Alpha", "Gamma", "Beta"] {
            records.add_machine(&repo, name).unwrap();
        }
        let mut categories = CategoryIndex::default();
        categories.add_category(&repo, "Lab", None).unwrap();
        for machine in ["Gamma", "Delta", "Beta"] {
            categories.set_machine_category(&repo, machine, "Lab").unwrap();
        }
        let mut tags = TagIndex::default();
        tags.add_tag(&repo, "prod").unwrap();
        for machine in ["Alpha", "Beta", "Delta"] {
            tags.assign_tag(&repo, machine, "prod").unwrap();
        }

        let mut state = FilterState::default();
        assert_eq!(
            filter_view(&records, &categories, &tags, &state),
            vec!["Delta", "Alpha", "Gamma", "Beta"]
        );
        state.toggle_category("Lab");
        assert_eq!(
            filter_view(&records, &categories, &tags, &state),
            vec!["Delta", "Gamma", "Beta"]
        );
        state.toggle_tag("prod");
        assert_eq!(
            filter_view(&records, &categories, &tags, &state),
            vec!["Delta", "Beta"]
        );
    }
}
