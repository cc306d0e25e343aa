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

//! Transactional staging views.
//!
//! A view is an in-memory overlay over a subtree of the store. It records
//! every observed read and every pending write in an action log, which is
//! what makes optimistic concurrency checkable at commit time: committing
//! replays or validates the log against the branch as it is *now*, and a
//! divergent read is a conflict, not a lost update.
//!
//! Purely in-memory mutations (`update`, `remove`) never suspend; only
//! operations that consult the backing store do.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use pollster::FutureExt as _;
use tracing::debug;
use tracing::instrument;

use crate::backend::BackendResult;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::backend::NodeValue;
use crate::branch::Branch;
use crate::contents::Contents;
use crate::graph;
use crate::key::Key;
use crate::key::KeyBuf;
use crate::key::StepBuf;
use crate::merge::Conflict;
use crate::merge::MergeResult;
use crate::merge::merge_option;
use crate::node_builder::NodeBuilder;
use crate::store::Store;

/// How many times a commit retries after observing the branch move
/// between replay and pointer write.
const MAX_COMMIT_RETRIES: usize = 3;

/// One recorded view operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action<C> {
    /// A read-through, with the value it observed.
    Read {
        key: KeyBuf,
        value: Option<C>,
    },
    /// A pending write; an absent value is a removal.
    Write {
        key: KeyBuf,
        value: Option<C>,
    },
    /// A listing, with the steps it observed.
    List {
        key: KeyBuf,
        result: Vec<StepBuf>,
    },
}

/// An in-memory staging area over a subtree, with an action log.
///
/// Keys passed to view operations are relative to the key the view was
/// created at.
pub struct StagingView<C: Contents> {
    store: Arc<Store<C>>,
    /// Where in the store this view is rooted.
    base_key: KeyBuf,
    /// The subtree root at creation, if any.
    base_node: Option<NodeId>,
    /// The branch head at creation, if any.
    base_head: Option<CommitId>,
    pending: BTreeMap<KeyBuf, Option<C>>,
    actions: Vec<Action<C>>,
}

impl<C: Contents> std::fmt::Debug for StagingView<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingView")
            .field("base_key", &self.base_key)
            .field("base_node", &self.base_node)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<C: Contents> StagingView<C> {
    /// An empty view over nothing: every read is absent until written.
    pub fn empty(store: Arc<Store<C>>) -> Self {
        Self {
            store,
            base_key: KeyBuf::root(),
            base_node: None,
            base_head: None,
            pending: BTreeMap::new(),
            actions: vec![],
        }
    }

    /// A view rooted at `key` of the branch's current head.
    pub async fn of_path_async(branch: &Branch<C>, key: &Key) -> BackendResult<Self> {
        let store = branch.store().clone();
        let base_head = branch.head_async().await?;
        let base_node = match &base_head {
            Some(head) => graph::node_at(&store, head, key).await?,
            None => None,
        };
        Ok(Self {
            store,
            base_key: key.to_owned(),
            base_node,
            base_head,
            pending: BTreeMap::new(),
            actions: vec![],
        })
    }

    pub fn of_path(branch: &Branch<C>, key: &Key) -> BackendResult<Self> {
        Self::of_path_async(branch, key).block_on()
    }

    /// A view over an existing subtree, detached from any branch.
    pub fn of_node(store: Arc<Store<C>>, node: NodeId) -> Self {
        Self {
            store,
            base_key: KeyBuf::root(),
            base_node: Some(node),
            base_head: None,
            pending: BTreeMap::new(),
            actions: vec![],
        }
    }

    /// The key this view is rooted at.
    pub fn base_key(&self) -> &Key {
        &self.base_key
    }

    /// The branch head this view was created at, if any.
    pub fn base_head(&self) -> Option<&CommitId> {
        self.base_head.as_ref()
    }

    /// The recorded action log, in operation order.
    pub fn actions(&self) -> &[Action<C>] {
        &self.actions
    }

    /// The value at `key`: the pending write if any, otherwise a recorded
    /// read-through to the backing store.
    pub async fn read_async(&mut self, key: &Key) -> BackendResult<Option<C>> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        let value = stored_value(&self.store, self.base_node.as_ref(), key).await?;
        self.actions.push(Action::Read {
            key: key.to_owned(),
            value: value.clone(),
        });
        Ok(value)
    }

    pub fn read(&mut self, key: &Key) -> BackendResult<Option<C>> {
        self.read_async(key).block_on()
    }

    /// Stages `value` at `key`. In-memory; nothing is written until
    /// commit.
    pub fn update(&mut self, key: &Key, value: C) {
        self.pending.insert(key.to_owned(), Some(value.clone()));
        self.actions.push(Action::Write {
            key: key.to_owned(),
            value: Some(value),
        });
    }

    /// Stages a removal of `key`.
    pub fn remove(&mut self, key: &Key) {
        self.pending.insert(key.to_owned(), None);
        self.actions.push(Action::Write {
            key: key.to_owned(),
            value: None,
        });
    }

    /// The steps one level below `key`, as seen through the overlay.
    pub async fn list_async(&mut self, key: &Key) -> BackendResult<Vec<StepBuf>> {
        let result = self.visible_steps(key).await?;
        self.actions.push(Action::List {
            key: key.to_owned(),
            result: result.clone(),
        });
        Ok(result)
    }

    pub fn list(&mut self, key: &Key) -> BackendResult<Vec<StepBuf>> {
        self.list_async(key).block_on()
    }

    async fn visible_steps(&self, key: &Key) -> BackendResult<Vec<StepBuf>> {
        let mut steps: BTreeSet<StepBuf> = BTreeSet::new();
        if let Some(node) = subtree_node(&self.store, self.base_node.as_ref(), key).await? {
            for (step, value) in node.entries() {
                match value {
                    NodeValue::Contents(_) => {
                        // A staged removal hides the leaf.
                        if self.pending.get(&key.join(step)) != Some(&None) {
                            steps.insert(step.to_owned());
                        }
                    }
                    NodeValue::Child(_) => {
                        steps.insert(step.to_owned());
                    }
                }
            }
        }
        for (pending_key, value) in &self.pending {
            if value.is_none() {
                continue;
            }
            if let Some(rel) = pending_key.strip_prefix(key) {
                if let Some(first) = rel.steps().next() {
                    steps.insert(first.to_owned());
                }
            }
        }
        Ok(steps.into_iter().collect())
    }

    /// Writes the staged subtree into the store, bottom-up, and returns
    /// its root node id.
    async fn write_subtree(&self) -> BackendResult<NodeId> {
        let mut builder = NodeBuilder::new(self.store.clone(), self.base_node.clone());
        for (key, value) in &self.pending {
            let id = match value {
                Some(value) => Some(self.store.add_contents_async(value).await?),
                None => None,
            };
            builder.set_or_remove_contents(key.clone(), id);
        }
        builder.write().await
    }

    /// Grafts `subtree` at `at` in the tree rooted at `base_root`,
    /// replacing whatever was there, and returns the new root id.
    async fn graft(
        &self,
        base_root: Option<NodeId>,
        at: &Key,
        subtree: NodeId,
    ) -> BackendResult<NodeId> {
        if at.is_root() {
            return Ok(subtree);
        }
        let empty = self.store.get_node_async(&subtree).await?.is_empty();
        let mut builder = NodeBuilder::new(self.store.clone(), base_root);
        builder.set_child(at.to_owned(), (!empty).then_some(subtree));
        builder.write().await
    }

    /// Commits the staged writes to the branch at this view's key,
    /// replacing the subtree there. The new commit's single parent is the
    /// branch head observed now; concurrent branch movement is replaced,
    /// not conflicted.
    #[instrument(skip(self, branch))]
    pub async fn update_path_async(&mut self, branch: &mut Branch<C>) -> BackendResult<CommitId> {
        let head = branch.head_async().await?;
        let base_root = match &head {
            Some(id) => self.store.get_commit_async(id).await?.node.clone(),
            None => None,
        };
        let subtree = self.write_subtree().await?;
        let root = self.graft(base_root, &self.base_key.clone(), subtree).await?;
        let commit = Commit {
            node: Some(root),
            parents: head.into_iter().collect(),
            task: branch.task().refreshed(),
        };
        let id = self.store.add_commit_async(commit).await?;
        debug!(commit = %id, "view committed");
        branch.update_head_async(id.clone()).await?;
        Ok(id)
    }

    pub fn update_path(&mut self, branch: &mut Branch<C>) -> BackendResult<CommitId> {
        self.update_path_async(branch).block_on()
    }

    /// Replays the action log against the branch's current tip and
    /// commits on top of it.
    ///
    /// Every recorded read must observe the value it originally observed,
    /// and every recorded listing the steps it originally produced;
    /// otherwise the replay conflicts and nothing moves. If the branch
    /// moves between replay and pointer write, the whole replay retries,
    /// and conflicts after exhaustion.
    #[instrument(skip(self, branch))]
    pub async fn rebase_path_async(
        &mut self,
        branch: &mut Branch<C>,
    ) -> BackendResult<MergeResult<CommitId>> {
        for _ in 0..MAX_COMMIT_RETRIES {
            let tip = branch.head_async().await?;
            let tip_node = match &tip {
                Some(head) => graph::node_at(&self.store, head, &self.base_key).await?,
                None => None,
            };
            if let Err(conflict) = self.replay_log(tip_node.as_ref()).await? {
                return Ok(Err(conflict));
            }

            let base_root = match &tip {
                Some(id) => self.store.get_commit_async(id).await?.node.clone(),
                None => None,
            };
            let mut builder = NodeBuilder::new(self.store.clone(), tip_node.clone());
            for (key, value) in &self.pending {
                let id = match value {
                    Some(value) => Some(self.store.add_contents_async(value).await?),
                    None => None,
                };
                builder.set_or_remove_contents(key.clone(), id);
            }
            let subtree = builder.write().await?;
            let root = self.graft(base_root, &self.base_key.clone(), subtree).await?;
            let commit = Commit {
                node: Some(root),
                parents: tip.iter().cloned().collect(),
                task: branch.task().refreshed(),
            };
            let id = self.store.add_commit_async(commit).await?;

            // The tag store has no compare-and-swap; re-read before the
            // pointer write and retry the replay if the branch moved. The
            // orphaned commit object is harmless.
            if branch.head_async().await? != tip {
                debug!("branch moved during replay; retrying");
                continue;
            }
            branch.update_head_async(id.clone()).await?;
            return Ok(Ok(id));
        }
        Ok(Err(Conflict::new(
            "branch kept moving during replay; optimistic retries exhausted",
        )))
    }

    pub fn rebase_path(&mut self, branch: &mut Branch<C>) -> BackendResult<MergeResult<CommitId>> {
        self.rebase_path_async(branch).block_on()
    }

    /// Validates recorded reads and listings against the subtree rooted
    /// at `tip_node`.
    async fn replay_log(&self, tip_node: Option<&NodeId>) -> BackendResult<MergeResult<()>> {
        // Writes staged before a read shadow the store in the original
        // execution, so they shadow the tip during replay too.
        let mut shadowed: BTreeMap<&KeyBuf, &Option<C>> = BTreeMap::new();
        for action in &self.actions {
            match action {
                Action::Write { key, value } => {
                    shadowed.insert(key, value);
                }
                Action::Read { key, value } => {
                    let current = match shadowed.get(key) {
                        Some(shadow) => (*shadow).clone(),
                        None => stored_value(&self.store, tip_node, key).await?,
                    };
                    if current != *value {
                        return Ok(Err(Conflict::new(format!(
                            "read of {:?} observed a different value at the new tip",
                            key.as_internal_string()
                        ))));
                    }
                }
                Action::List { key, result } => {
                    let current = self.replay_list(tip_node, &shadowed, key).await?;
                    if current != *result {
                        return Ok(Err(Conflict::new(format!(
                            "listing of {:?} changed at the new tip",
                            key.as_internal_string()
                        ))));
                    }
                }
            }
        }
        Ok(Ok(()))
    }

    async fn replay_list(
        &self,
        tip_node: Option<&NodeId>,
        shadowed: &BTreeMap<&KeyBuf, &Option<C>>,
        key: &Key,
    ) -> BackendResult<Vec<StepBuf>> {
        let mut steps: BTreeSet<StepBuf> = BTreeSet::new();
        if let Some(node) = subtree_node(&self.store, tip_node, key).await? {
            for (step, value) in node.entries() {
                match value {
                    NodeValue::Contents(_) => {
                        if shadowed.get(&key.join(step)) != Some(&&None) {
                            steps.insert(step.to_owned());
                        }
                    }
                    NodeValue::Child(_) => {
                        steps.insert(step.to_owned());
                    }
                }
            }
        }
        for (pending_key, value) in shadowed {
            if value.is_none() {
                continue;
            }
            if let Some(rel) = pending_key.strip_prefix(key) {
                if let Some(first) = rel.steps().next() {
                    steps.insert(first.to_owned());
                }
            }
        }
        Ok(steps.into_iter().collect())
    }

    /// Merges this view's edits into `other`, treating both as edit
    /// sequences over the store state at creation. Only `other` is
    /// updated.
    ///
    /// A key written by one side takes that write; identical writes
    /// agree; concurrent different writes delegate to the contents merge.
    /// This view's recorded reads are validated against `other`'s final
    /// view.
    pub async fn merge_into_async(&self, other: &mut Self) -> BackendResult<MergeResult<()>> {
        for action in &self.actions {
            if let Action::Read { key, value } = action {
                let theirs = match other.pending.get(key) {
                    Some(pending) => pending.clone(),
                    None => stored_value(&other.store, other.base_node.as_ref(), key).await?,
                };
                if theirs != *value {
                    return Ok(Err(Conflict::new(format!(
                        "read of {:?} contradicts the target view",
                        key.as_internal_string()
                    ))));
                }
            }
        }

        for (key, value) in &self.pending {
            match other.pending.get(key) {
                None => {
                    other.pending.insert(key.clone(), value.clone());
                    other.actions.push(Action::Write {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
                Some(theirs) if theirs == value => {}
                Some(theirs) => {
                    let old = stored_value(&self.store, self.base_node.as_ref(), key).await?;
                    let merged =
                        match merge_option(old.as_ref(), value.as_ref(), theirs.as_ref(), |o, a, b| {
                            C::merge(o, a, b)
                        }) {
                            Ok(merged) => merged,
                            Err(conflict) => {
                                return Ok(Err(Conflict::new(format!(
                                    "{}: {}",
                                    key.as_internal_string(),
                                    conflict.0
                                ))));
                            }
                        };
                    other.pending.insert(key.clone(), merged.clone());
                    other.actions.push(Action::Write {
                        key: key.clone(),
                        value: merged,
                    });
                }
            }
        }
        Ok(Ok(()))
    }

    pub fn merge_into(&self, other: &mut Self) -> BackendResult<MergeResult<()>> {
        self.merge_into_async(other).block_on()
    }
}

/// The node at `key` below the subtree root `base`, following child
/// edges.
async fn subtree_node<C: Contents>(
    store: &Store<C>,
    base: Option<&NodeId>,
    key: &Key,
) -> BackendResult<Option<Arc<Node>>> {
    let Some(mut node_id) = base.cloned() else {
        return Ok(None);
    };
    for step in key.steps() {
        let node = store.get_node_async(&node_id).await?;
        match node.child(step) {
            Some(child) => node_id = child.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(store.get_node_async(&node_id).await?))
}

/// The value at `key` below the subtree root `base`.
async fn stored_value<C: Contents>(
    store: &Store<C>,
    base: Option<&NodeId>,
    key: &Key,
) -> BackendResult<Option<C>> {
    let Some(base) = base else {
        return Ok(None);
    };
    let Some(content_id) = graph::find_in_node(store, base, key).await? else {
        return Ok(None);
    };
    Ok(Some(store.get_contents_async(&content_id).await?))
}
