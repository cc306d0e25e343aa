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

use futures::StreamExt as _;
use pollster::FutureExt as _;
use silt_lib::backend::TagStore as _;
use silt_lib::snapshot::Snapshot;
use testutils::TestStore;
use testutils::key;
use testutils::tag;

#[test]
fn test_every_update_reaches_existing_subscribers() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();

    let mut watcher = test_store.tags.watch(&tag("master")).block_on().unwrap();

    let c1 = master.update(&key("k"), "1".to_string()).unwrap();
    let c2 = master.update(&key("k"), "2".to_string()).unwrap();

    assert_eq!(watcher.next().block_on(), Some(Some(c1)));
    assert_eq!(watcher.next().block_on(), Some(Some(c2)));
}

#[test]
fn test_merge_notifies_watchers() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("base"), "0".to_string()).unwrap();

    let mut topic = master.clone_tag(tag("topic")).unwrap();
    topic.update(&key("y"), "2".to_string()).unwrap();

    let mut watcher = test_store.tags.watch(&tag("master")).block_on().unwrap();

    // Fast-forward merges notify like any other head update.
    master.merge(&tag("topic")).unwrap();
    let observed = watcher.next().block_on().unwrap();
    assert_eq!(observed, master.head().unwrap());
}

#[test]
fn test_tag_removal_notifies_absence() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("k"), "1".to_string()).unwrap();

    let mut watcher = test_store.tags.watch(&tag("master")).block_on().unwrap();
    master.remove_tag().unwrap();
    assert_eq!(watcher.next().block_on(), Some(None));
}

#[test]
fn test_snapshot_watch_fires_on_changes_under_key() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("watched/a"), "0".to_string()).unwrap();
    master.update(&key("other/z"), "0".to_string()).unwrap();

    let mut watcher = Snapshot::watch(&master, &key("watched")).unwrap();

    // A change outside the watched subtree does not fire.
    master.update(&key("other/z"), "1".to_string()).unwrap();
    // A change inside does.
    master.update(&key("watched/a"), "1".to_string()).unwrap();

    let (changed_key, snapshot) = watcher.next().block_on().unwrap().unwrap();
    assert_eq!(changed_key, key("watched"));
    assert_eq!(
        snapshot.read(&key("watched/a")).unwrap(),
        Some("1".to_string())
    );
    assert_eq!(snapshot.head(), &master.head().unwrap().unwrap());
}

#[test]
fn test_snapshot_read_is_frozen() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("k"), "1".to_string()).unwrap();

    let snapshot = Snapshot::of_branch(&master).unwrap().unwrap();
    master.update(&key("k"), "2".to_string()).unwrap();

    assert_eq!(snapshot.read(&key("k")).unwrap(), Some("1".to_string()));
    assert_eq!(master.read(&key("k")).unwrap(), Some("2".to_string()));
}

#[test]
fn test_snapshot_revert_moves_the_branch_back() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("k"), "1".to_string()).unwrap();
    let snapshot = Snapshot::of_branch(&master).unwrap().unwrap();

    master.update(&key("k"), "2".to_string()).unwrap();
    snapshot.revert(&mut master).unwrap();

    assert_eq!(master.read(&key("k")).unwrap(), Some("1".to_string()));
    assert_eq!(master.head().unwrap().unwrap(), *snapshot.head());
}

#[test]
fn test_snapshot_merge_is_three_way() {
    let test_store: TestStore<String> = TestStore::init();
    let mut master = test_store.master();
    master.update(&key("base"), "0".to_string()).unwrap();
    let mut topic = master.clone_tag(tag("topic")).unwrap();
    topic.update(&key("y"), "2".to_string()).unwrap();
    let snapshot = Snapshot::of_branch(&topic).unwrap().unwrap();

    master.update(&key("x"), "1".to_string()).unwrap();
    snapshot.merge(&mut master).unwrap();

    assert_eq!(master.read(&key("x")).unwrap(), Some("1".to_string()));
    assert_eq!(master.read(&key("y")).unwrap(), Some("2".to_string()));
}
