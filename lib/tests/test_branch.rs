// Copyright 2023 The Silt Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use assert_matches::assert_matches;
use silt_lib::branch::MergeOutcome;
use silt_lib::branch::TagUpdateError;
use silt_lib::contents::Counter;
use testutils::TestStore;
use testutils::key;
use testutils::tag;

#[test]
fn test_set_get_on_empty_store() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    assert_eq!(master.head().unwrap(), None);

    master.update(&key("a/b"), "1".to_string()).unwrap();

    assert_eq!(master.read(&key("a/b")).unwrap(), Some("1".to_string()));
    assert_eq!(master.read(&key("a/c")).unwrap(), None);
    assert_eq!(master.read(&key("a")).unwrap(), None);

    // Exactly one contents object, one node for "a", one root node, one
    // commit.
    assert_eq!(test_store.object_counts(), (1, 2, 1));

    let head = master.head().unwrap().unwrap();
    let commit = test_store.store.get_commit(&head).unwrap();
    assert_eq!(commit.parents, vec![]);
}

#[test]
fn test_update_chains_commits() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();

    let c1 = master.update(&key("x"), "1".to_string()).unwrap();
    let c2 = master.update(&key("y"), "2".to_string()).unwrap();

    let commit = test_store.store.get_commit(&c2).unwrap();
    assert_eq!(commit.parents, vec![c1]);
    assert_eq!(master.read(&key("x")).unwrap(), Some("1".to_string()));
    assert_eq!(master.read(&key("y")).unwrap(), Some("2".to_string()));
}

#[test]
fn test_remove_prunes_empty_dirs() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();

    master.update(&key("a/b/c"), "1".to_string()).unwrap();
    master.update(&key("x"), "2".to_string()).unwrap();
    master.remove(&key("a/b/c")).unwrap();

    assert_eq!(master.read(&key("a/b/c")).unwrap(), None);
    assert_eq!(master.read(&key("x")).unwrap(), Some("2".to_string()));
    let steps: Vec<_> = master
        .list_steps(&key(""))
        .unwrap()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    assert_eq!(steps, vec!["x"]);
}

#[test]
fn test_concurrent_non_overlapping_writes_merge_cleanly() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("base"), "0".to_string()).unwrap();

    let mut topic = master.clone_tag(tag("topic")).unwrap();
    master.update(&key("x"), "1".to_string()).unwrap();
    topic.update(&key("y"), "2".to_string()).unwrap();

    let outcome = master.merge(&tag("topic")).unwrap();
    let merge_commit = assert_matches!(outcome, MergeOutcome::Merged(id) => id);

    assert_eq!(master.read(&key("x")).unwrap(), Some("1".to_string()));
    assert_eq!(master.read(&key("y")).unwrap(), Some("2".to_string()));
    let commit = test_store.store.get_commit(&merge_commit).unwrap();
    assert_eq!(commit.parents.len(), 2);
}

#[test]
fn test_conflicting_writes_leave_branch_unchanged() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("k"), "a".to_string()).unwrap();

    let mut topic = master.clone_tag(tag("topic")).unwrap();
    master.update(&key("k"), "b".to_string()).unwrap();
    let head_before = master.head().unwrap();
    topic.update(&key("k"), "c".to_string()).unwrap();

    let outcome = master.merge(&tag("topic")).unwrap();
    assert_matches!(outcome, MergeOutcome::Conflicted(_));

    // No merge commit was created and the head did not move.
    assert_eq!(master.head().unwrap(), head_before);
    assert_eq!(master.read(&key("k")).unwrap(), Some("b".to_string()));
}

#[test]
fn test_counter_merge() {
    let test_store: TestStore<Counter> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("n"), Counter(10)).unwrap();

    let mut topic = master.clone_tag(tag("topic")).unwrap();
    master.update(&key("n"), Counter(13)).unwrap();
    topic.update(&key("n"), Counter(15)).unwrap();

    let outcome = master.merge(&tag("topic")).unwrap();
    assert_matches!(outcome, MergeOutcome::Merged(_));
    assert_eq!(master.read(&key("n")).unwrap(), Some(Counter(18)));
}

#[test]
fn test_merge_of_ancestor_is_noop() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();

    let _topic = master.clone_tag(tag("topic")).unwrap();
    master.update(&key("y"), "2".to_string()).unwrap();
    let head = master.head().unwrap();

    // topic's head is an ancestor of master's.
    let outcome = master.merge(&tag("topic")).unwrap();
    assert_eq!(outcome, MergeOutcome::Unchanged);
    assert_eq!(master.head().unwrap(), head);
}

#[test]
fn test_merge_fast_forwards_without_new_commit() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();

    let mut topic = master.clone_tag(tag("topic")).unwrap();
    topic.update(&key("y"), "2".to_string()).unwrap();
    let topic_head = topic.head().unwrap().unwrap();

    let (_, _, commits_before) = test_store.object_counts();
    let outcome = master.merge(&tag("topic")).unwrap();
    assert_eq!(outcome, MergeOutcome::FastForwarded(topic_head.clone()));
    assert_eq!(master.head().unwrap(), Some(topic_head));
    // Fast-forward writes no commit.
    let (_, _, commits_after) = test_store.object_counts();
    assert_eq!(commits_after, commits_before);
}

#[test]
fn test_merge_of_unrelated_histories_conflicts() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    let mut other = test_store.branch("other");
    master.update(&key("x"), "1".to_string()).unwrap();
    other.update(&key("y"), "2".to_string()).unwrap();

    let outcome = master.merge(&tag("other")).unwrap();
    assert_matches!(outcome, MergeOutcome::Conflicted(_));
}

#[test]
fn test_update_tag_refuses_duplicates() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();
    let mut other = test_store.branch("other");
    other.update(&key("y"), "2".to_string()).unwrap();

    assert_matches!(
        other.update_tag(tag("master")),
        Err(TagUpdateError::Duplicated(_))
    );

    // The forcing variant overwrites and attaches.
    let other_head = other.head().unwrap();
    other.update_tag_force(tag("master")).unwrap();
    assert_eq!(other.tag(), Some(&tag("master")));
    assert_eq!(master.head().unwrap(), other_head);
}

#[test]
fn test_clone_tag_refuses_duplicates() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();

    assert!(master.clone_tag(tag("copy")).is_ok());
    assert_matches!(
        master.clone_tag(tag("copy")),
        Err(TagUpdateError::Duplicated(_))
    );
}

#[test]
fn test_detached_head_updates_stay_local() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();
    let shared_head = master.head().unwrap();

    master.detach().unwrap();
    assert_eq!(master.tag(), None);
    master.update(&key("x"), "2".to_string()).unwrap();

    // The tag still points at the old head; only the pin moved.
    assert_eq!(test_store.master().head().unwrap(), shared_head);
    assert_eq!(master.read(&key("x")).unwrap(), Some("2".to_string()));
}

#[test]
fn test_switch_points_at_other_lineage() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    let mut other = test_store.branch("other");
    master.update(&key("x"), "1".to_string()).unwrap();
    other.update(&key("x"), "2".to_string()).unwrap();

    master.switch(tag("other"));
    assert_eq!(master.read(&key("x")).unwrap(), Some("2".to_string()));
}

#[test]
fn test_heads_reports_all_tips() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    let mut other = test_store.branch("other");
    master.update(&key("x"), "1".to_string()).unwrap();
    other.update(&key("y"), "2".to_string()).unwrap();

    let mut expected = vec![
        master.head().unwrap().unwrap(),
        other.head().unwrap().unwrap(),
    ];
    expected.sort();
    assert_eq!(master.heads().unwrap(), expected);
}

#[test]
fn test_remove_tag_detaches() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("x"), "1".to_string()).unwrap();
    let head = master.head().unwrap();

    master.remove_tag().unwrap();
    assert_eq!(master.tag(), None);
    assert_eq!(master.head().unwrap(), head);
    assert!(test_store.tag_names().is_empty());
}
