use std::collections::BTreeSet;

use rd_core::{Action, Desk, MemoryRepository, Outcome, DEFAULT_CATEGORY};

fn lab_desk() -> Desk<MemoryRepository> {
    let mut desk = Desk::open(MemoryRepository::default()).unwrap();
    for name in ["Alpha", "Beta", "Gamma"] {
        desk.dispatch(Action::AddMachine(name.into())).unwrap();
    }
    desk.dispatch(Action::AddCategory {
        name: "Lab".into(),
        color: None,
    })
    .unwrap();
    for machine in ["Beta", "Gamma"] {
        desk.dispatch(Action::AssignCategory {
            machine: machine.into(),
            category: "Lab".into(),
        })
        .unwrap();
    }
    desk
}

fn tagged_desk() -> Desk<MemoryRepository> {
    let mut desk = lab_desk();
    desk.dispatch(Action::AddTag("prod".into())).unwrap();
    desk.dispatch(Action::AddTag("staging".into())).unwrap();
    for (machine, tag) in [("Alpha", "prod"), ("Gamma", "prod"), ("Gamma", "staging")] {
        desk.dispatch(Action::AssignTag {
            machine: machine.into(),
            tag: tag.into(),
        })
        .unwrap();
    }
    desk
}

#[test]
fn category_filter_keeps_original_order() {
    let mut desk = lab_desk();
    desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
        .unwrap();
    assert_eq!(desk.view(), ["Beta", "Gamma"]);
}

#[test]
fn selecting_same_category_twice_shows_everything() {
    let mut desk = lab_desk();
    desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
        .unwrap();
    desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
        .unwrap();
    assert_eq!(desk.view(), ["Alpha", "Beta", "Gamma"]);
}

#[test]
fn tag_filter_requires_every_selected_tag() {
    let mut desk = tagged_desk();
    desk.dispatch(Action::ToggleTagFilter("prod".into())).unwrap();
    assert_eq!(desk.view(), ["Alpha", "Gamma"]);
    desk.dispatch(Action::ToggleTagFilter("staging".into()))
        .unwrap();
    assert_eq!(desk.view(), ["Gamma"]);
}

#[test]
fn category_and_tag_filters_compose() {
    let mut desk = tagged_desk();
    desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
        .unwrap();
    desk.dispatch(Action::ToggleTagFilter("prod".into())).unwrap();
    assert_eq!(desk.view(), ["Gamma"]);

    let tags: BTreeSet<String> = ["prod".to_string()].into_iter().collect();
    let by_category = desk.categories().machines_in("Lab", desk.records());
    let by_tags = desk.tags().machines_with_all_tags(&tags, desk.records());
    let expected: Vec<String> = desk
        .records()
        .list()
        .into_iter()
        .filter(|machine| by_category.contains(machine) && by_tags.contains(machine))
        .collect();
    assert_eq!(desk.view(), expected.as_slice());
}

#[test]
fn deleting_tag_cascades() {
    let mut desk = tagged_desk();
    assert_eq!(
        desk.dispatch(Action::DeleteTag("prod".into())).unwrap(),
        Outcome::Applied
    );
    assert_eq!(desk.tags().tags_of("Gamma"), vec!["staging"]);
    assert!(desk.tags().tags_of("Alpha").is_empty());
    assert!(!desk.tags().contains("prod"));
}

#[test]
fn deleting_category_returns_machines_to_default() {
    let mut desk = lab_desk();
    desk.dispatch(Action::DeleteCategory("Lab".into())).unwrap();
    assert_eq!(desk.categories().category_of("Beta"), DEFAULT_CATEGORY);
    assert!(!desk.categories().contains("Lab"));
    desk.dispatch(Action::ToggleCategoryFilter(DEFAULT_CATEGORY.into()))
        .unwrap();
    assert_eq!(desk.view(), ["Alpha", "Beta", "Gamma"]);
    assert_eq!(
        desk.categories().machines_in(DEFAULT_CATEGORY, desk.records()),
        desk.records().list()
    );
}

#[test]
fn reorder_rejects_partial_lists() {
    let mut desk = lab_desk();
    assert_eq!(
        desk.dispatch(Action::Reorder(vec!["Gamma".into(), "Alpha".into()]))
            .unwrap(),
        Outcome::Rejected
    );
    assert_eq!(desk.view(), ["Alpha", "Beta", "Gamma"]);
    desk.dispatch(Action::Reorder(vec![
        "Gamma".into(),
        "Alpha".into(),
        "Beta".into(),
    ]))
    .unwrap();
    assert_eq!(desk.view(), ["Gamma", "Alpha", "Beta"]);
    desk.dispatch(Action::ToggleCategoryFilter("Lab".into()))
        .unwrap();
    assert_eq!(desk.view(), ["Gamma", "Beta"]);
}
