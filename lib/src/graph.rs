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

//! Traversal over the Merkle graph: path lookup, bounded walks, and
//! ancestry queries over the commit DAG.
//!
//! A missing edge along a path is an absent result, never an error. A
//! hash referenced by a stored object but missing from its store is an
//! invariant violation and aborts the traversal with
//! [`BackendError::ObjectNotFound`].
//!
//! [`BackendError::ObjectNotFound`]: crate::backend::BackendError::ObjectNotFound

#![expect(missing_docs)]

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::backend::ContentId;
use crate::backend::NodeId;
use crate::backend::NodeValue;
use crate::contents::Contents;
use crate::key::Key;
use crate::store::Store;

/// What a walk follows out of each commit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkMode {
    /// Commits, their node trees, and the referenced contents.
    Full,
    /// Commits and their parents only.
    History,
}

/// A hash visited by [`walk`], tagged with its kind.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum WalkedId {
    Commit(CommitId),
    Node(NodeId),
    Contents(ContentId),
}

/// One visited object and the ids it references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalkEntry {
    pub id: WalkedId,
    pub edges: Vec<WalkedId>,
}

/// Looks up the contents id stored at `key` under the commit `head`.
pub async fn find<C: Contents>(
    store: &Store<C>,
    head: &CommitId,
    key: &Key,
) -> BackendResult<Option<ContentId>> {
    let commit = store.get_commit_async(head).await?;
    let Some(root) = &commit.node else {
        return Ok(None);
    };
    find_in_node(store, root, key).await
}

/// Looks up the contents id stored at `key` under the node `root`.
pub async fn find_in_node<C: Contents>(
    store: &Store<C>,
    root: &NodeId,
    key: &Key,
) -> BackendResult<Option<ContentId>> {
    // The root key has no contents slot.
    let Some((dir, last)) = key.split() else {
        return Ok(None);
    };
    let mut node = store.get_node_async(root).await?;
    for step in dir.steps() {
        match node.child(step) {
            Some(child) => node = store.get_node_async(child).await?,
            None => return Ok(None),
        }
    }
    Ok(node.contents(last).cloned())
}

/// The subtree root at `key` under the commit `head`: the commit's node
/// for the root key, the child node id otherwise.
pub async fn node_at<C: Contents>(
    store: &Store<C>,
    head: &CommitId,
    key: &Key,
) -> BackendResult<Option<NodeId>> {
    let commit = store.get_commit_async(head).await?;
    let Some(mut node_id) = commit.node.clone() else {
        return Ok(None);
    };
    for step in key.steps() {
        let node = store.get_node_async(&node_id).await?;
        match node.child(step) {
            Some(child) => node_id = child.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(node_id))
}

/// Enumerates every hash reachable from `heads`, each at most once.
///
/// History traversal is bounded by `depth` parent edges from the roots
/// and stops at (and excludes) the commits in `min`. In
/// [`WalkMode::Full`], the node tree and contents of every visited
/// commit are included; the tree expansion is not depth-bounded.
pub async fn walk<C: Contents>(
    store: &Store<C>,
    heads: &[CommitId],
    mode: WalkMode,
    depth: Option<usize>,
    min: &HashSet<CommitId>,
) -> BackendResult<Vec<WalkEntry>> {
    let mut entries = vec![];
    let mut visited_commits = HashSet::new();
    let mut roots = vec![];
    let mut frontier: VecDeque<(CommitId, usize)> = heads
        .iter()
        .filter(|id| !min.contains(*id))
        .map(|id| (id.clone(), 0))
        .collect();
    while let Some((id, distance)) = frontier.pop_front() {
        if !visited_commits.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        let mut edges: Vec<WalkedId> = commit
            .parents
            .iter()
            .map(|parent| WalkedId::Commit(parent.clone()))
            .collect();
        if let Some(root) = &commit.node {
            if mode == WalkMode::Full {
                edges.push(WalkedId::Node(root.clone()));
                roots.push(root.clone());
            }
        }
        entries.push(WalkEntry {
            id: WalkedId::Commit(id),
            edges,
        });
        if depth.is_some_and(|depth| distance >= depth) {
            continue;
        }
        for parent in &commit.parents {
            if !min.contains(parent) && !visited_commits.contains(parent) {
                frontier.push_back((parent.clone(), distance + 1));
            }
        }
    }

    if mode == WalkMode::Full {
        let mut visited_nodes = HashSet::new();
        let mut visited_contents = HashSet::new();
        let mut node_frontier: VecDeque<NodeId> = roots.into();
        while let Some(id) = node_frontier.pop_front() {
            if !visited_nodes.insert(id.clone()) {
                continue;
            }
            let node = store.get_node_async(&id).await?;
            let mut edges = vec![];
            for (_, value) in node.entries() {
                match value {
                    NodeValue::Contents(contents_id) => {
                        edges.push(WalkedId::Contents(contents_id.clone()));
                        if visited_contents.insert(contents_id.clone()) {
                            entries.push(WalkEntry {
                                id: WalkedId::Contents(contents_id.clone()),
                                edges: vec![],
                            });
                        }
                    }
                    NodeValue::Child(child_id) => {
                        edges.push(WalkedId::Node(child_id.clone()));
                        node_frontier.push_back(child_id.clone());
                    }
                }
            }
            entries.push(WalkEntry {
                id: WalkedId::Node(id),
                edges,
            });
        }
    }
    Ok(entries)
}

/// All ancestors of `head`, including `head` itself.
pub async fn ancestors<C: Contents>(
    store: &Store<C>,
    head: &CommitId,
) -> BackendResult<HashSet<CommitId>> {
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::from([head.clone()]);
    while let Some(id) = frontier.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        frontier.extend(commit.parents.iter().cloned());
    }
    Ok(seen)
}

/// Whether `ancestor` is reachable from `head` via parent edges. A commit
/// is its own ancestor.
pub async fn is_ancestor<C: Contents>(
    store: &Store<C>,
    ancestor: &CommitId,
    head: &CommitId,
) -> BackendResult<bool> {
    let mut seen = HashSet::new();
    let mut frontier = VecDeque::from([head.clone()]);
    while let Some(id) = frontier.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let commit = store.get_commit_async(&id).await?;
        frontier.extend(commit.parents.iter().cloned());
    }
    Ok(false)
}

/// The lowest common ancestors of `a` and `b`: the commits in both
/// ancestries that have no descendant in the intersection. There may be
/// several; the result is in commit id order.
pub async fn lcas<C: Contents>(
    store: &Store<C>,
    a: &CommitId,
    b: &CommitId,
) -> BackendResult<Vec<CommitId>> {
    let ancestors_a = ancestors(store, a).await?;
    let ancestors_b = ancestors(store, b).await?;
    let common: HashSet<&CommitId> = ancestors_a.intersection(&ancestors_b).collect();

    // The intersection is closed under parents, so anything reachable
    // through a parent edge from a member is covered by a closer
    // ancestor.
    let mut parents: HashMap<&CommitId, Vec<CommitId>> = HashMap::new();
    for id in &common {
        let commit = store.get_commit_async(id).await?;
        parents.insert(*id, commit.parents.clone());
    }
    let mut covered = HashSet::new();
    let mut frontier: VecDeque<CommitId> = common
        .iter()
        .flat_map(|id| parents[*id].iter().cloned())
        .collect();
    while let Some(id) = frontier.pop_front() {
        if !covered.insert(id.clone()) {
            continue;
        }
        if let Some(parent_ids) = parents.get(&id) {
            frontier.extend(parent_ids.iter().cloned());
        }
    }

    let mut result: Vec<CommitId> = common
        .into_iter()
        .filter(|id| !covered.contains(*id))
        .cloned()
        .collect();
    result.sort();
    Ok(result)
}
