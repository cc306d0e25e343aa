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

//! Branch handles.
//!
//! A [`Branch`] is a per-session view of the store: it resolves reads
//! through the currently visible head, turns writes into new commits, and
//! moves the branch pointer. A handle is either *attached* to a tag name
//! or *detached* at a pinned commit; all operations work the same way in
//! both states, except that detached head updates stay local to the
//! handle.

#![expect(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use pollster::FutureExt as _;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::ContentId;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::backend::TagName;
use crate::backend::TagStore;
use crate::backend::Task;
use crate::contents::Contents;
use crate::graph;
use crate::key::Key;
use crate::key::KeyBuf;
use crate::key::Step;
use crate::key::StepBuf;
use crate::merge::Conflict;
use crate::merge::MergeResult;
use crate::node_builder::NodeBuilder;
use crate::store::Store;

/// Error from claiming a tag name.
#[derive(Debug, Error)]
pub enum TagUpdateError {
    /// The name is already taken; use the forcing variant to overwrite.
    #[error("Tag {0} already exists")]
    Duplicated(TagName),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// How a three-way merge concluded. Conflicts are reported here, not as
/// errors; the branch is unchanged unless the outcome says otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    /// The incoming head was already merged; nothing changed.
    Unchanged,
    /// The branch advanced to the incoming head without a new commit.
    FastForwarded(CommitId),
    /// A merge commit with both parents was created and the branch points
    /// at it.
    Merged(CommitId),
    /// The merge could not resolve. The branch is unchanged.
    Conflicted(Conflict),
}

#[derive(Clone, Debug)]
enum HeadState {
    Attached(TagName),
    Detached(Option<CommitId>),
}

/// A store handle: a branch name or pinned commit, the shared stores, and
/// the task stamped onto new commits.
#[derive(Clone)]
pub struct Branch<C: Contents> {
    store: Arc<Store<C>>,
    tags: Arc<dyn TagStore>,
    task: Task,
    head: HeadState,
}

impl<C: Contents> std::fmt::Debug for Branch<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl<C: Contents> Branch<C> {
    /// An attached handle on `tag`. The tag need not exist yet; it is
    /// created by the first head update.
    pub fn of_tag(
        store: Arc<Store<C>>,
        tags: Arc<dyn TagStore>,
        task: Task,
        tag: TagName,
    ) -> Self {
        Self {
            store,
            tags,
            task,
            head: HeadState::Attached(tag),
        }
    }

    /// An attached handle on the `master` tag.
    pub fn of_master(store: Arc<Store<C>>, tags: Arc<dyn TagStore>, task: Task) -> Self {
        Self::of_tag(store, tags, task, TagName::master())
    }

    /// A detached handle pinned at `head`.
    pub fn of_head(
        store: Arc<Store<C>>,
        tags: Arc<dyn TagStore>,
        task: Task,
        head: CommitId,
    ) -> Self {
        Self {
            store,
            tags,
            task,
            head: HeadState::Detached(Some(head)),
        }
    }

    pub fn store(&self) -> &Arc<Store<C>> {
        &self.store
    }

    pub fn tag_store(&self) -> &Arc<dyn TagStore> {
        &self.tags
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The tag this handle is attached to, if any.
    pub fn tag(&self) -> Option<&TagName> {
        match &self.head {
            HeadState::Attached(tag) => Some(tag),
            HeadState::Detached(_) => None,
        }
    }

    /// The currently visible head commit.
    pub async fn head_async(&self) -> BackendResult<Option<CommitId>> {
        match &self.head {
            HeadState::Attached(tag) => self.tags.read(tag).await,
            HeadState::Detached(id) => Ok(id.clone()),
        }
    }

    pub fn head(&self) -> BackendResult<Option<CommitId>> {
        self.head_async().block_on()
    }

    /// Unconditionally points the branch (or the local pin, if detached)
    /// at `id`.
    pub async fn update_head_async(&mut self, id: CommitId) -> BackendResult<()> {
        match &self.head {
            HeadState::Attached(tag) => self.tags.update(tag, id).await,
            HeadState::Detached(_) => {
                self.head = HeadState::Detached(Some(id));
                Ok(())
            }
        }
    }

    pub fn update_head(&mut self, id: CommitId) -> BackendResult<()> {
        self.update_head_async(id).block_on()
    }

    /// Claims `tag` for this handle: writes the current head under the
    /// new name and attaches to it. Fails if the name exists.
    pub async fn update_tag_async(&mut self, tag: TagName) -> Result<(), TagUpdateError> {
        if self.tags.mem(&tag).await? {
            return Err(TagUpdateError::Duplicated(tag));
        }
        self.update_tag_force_async(tag).await?;
        Ok(())
    }

    pub fn update_tag(&mut self, tag: TagName) -> Result<(), TagUpdateError> {
        self.update_tag_async(tag).block_on()
    }

    /// As [`update_tag_async`], but overwrites an existing name.
    ///
    /// [`update_tag_async`]: Branch::update_tag_async
    pub async fn update_tag_force_async(&mut self, tag: TagName) -> BackendResult<()> {
        if let Some(head) = self.head_async().await? {
            self.tags.update(&tag, head).await?;
        }
        self.head = HeadState::Attached(tag);
        Ok(())
    }

    pub fn update_tag_force(&mut self, tag: TagName) -> BackendResult<()> {
        self.update_tag_force_async(tag).block_on()
    }

    /// Points this handle at `tag`. The lineages stay independent; no
    /// data moves.
    pub fn switch(&mut self, tag: TagName) {
        self.head = HeadState::Attached(tag);
    }

    /// Drops the tag association, keeping the current head as a local
    /// pin.
    pub async fn detach_async(&mut self) -> BackendResult<()> {
        let head = self.head_async().await?;
        self.head = HeadState::Detached(head);
        Ok(())
    }

    pub fn detach(&mut self) -> BackendResult<()> {
        self.detach_async().block_on()
    }

    /// Removes the attached tag from the store and detaches, keeping the
    /// current head as a local pin.
    pub async fn remove_tag_async(&mut self) -> BackendResult<()> {
        if let HeadState::Attached(tag) = self.head.clone() {
            let head = self.tags.read(&tag).await?;
            self.tags.remove(&tag).await?;
            self.head = HeadState::Detached(head);
        }
        Ok(())
    }

    pub fn remove_tag(&mut self) -> BackendResult<()> {
        self.remove_tag_async().block_on()
    }

    /// A new handle attached to `tag`, created at the current head. Fails
    /// if the name exists; this handle is untouched either way.
    pub async fn clone_tag_async(&self, tag: TagName) -> Result<Self, TagUpdateError> {
        if self.tags.mem(&tag).await? {
            return Err(TagUpdateError::Duplicated(tag));
        }
        Ok(self.clone_tag_force_async(tag).await?)
    }

    pub fn clone_tag(&self, tag: TagName) -> Result<Self, TagUpdateError> {
        self.clone_tag_async(tag).block_on()
    }

    /// As [`clone_tag_async`], but overwrites an existing name.
    ///
    /// [`clone_tag_async`]: Branch::clone_tag_async
    pub async fn clone_tag_force_async(&self, tag: TagName) -> BackendResult<Self> {
        if let Some(head) = self.head_async().await? {
            self.tags.update(&tag, head).await?;
        }
        Ok(Self {
            store: self.store.clone(),
            tags: self.tags.clone(),
            task: self.task.clone(),
            head: HeadState::Attached(tag),
        })
    }

    /// All known branch tips: every tag's head, plus this handle's pin if
    /// detached.
    pub async fn heads_async(&self) -> BackendResult<Vec<CommitId>> {
        let mut heads: BTreeSet<CommitId> =
            self.tags.dump().await?.into_iter().map(|(_, id)| id).collect();
        if let HeadState::Detached(Some(id)) = &self.head {
            heads.insert(id.clone());
        }
        Ok(heads.into_iter().collect())
    }

    pub fn heads(&self) -> BackendResult<Vec<CommitId>> {
        self.heads_async().block_on()
    }

    // ---- Key-value surface ----

    /// The value at `key`, resolved through the current head.
    pub async fn read_async(&self, key: &Key) -> BackendResult<Option<C>> {
        let Some(head) = self.head_async().await? else {
            return Ok(None);
        };
        let Some(content_id) = graph::find(&self.store, &head, key).await? else {
            return Ok(None);
        };
        Ok(Some(self.store.get_contents_async(&content_id).await?))
    }

    pub fn read(&self, key: &Key) -> BackendResult<Option<C>> {
        self.read_async(key).block_on()
    }

    /// Whether a value is stored at `key`.
    pub async fn mem_async(&self, key: &Key) -> BackendResult<bool> {
        let Some(head) = self.head_async().await? else {
            return Ok(false);
        };
        Ok(graph::find(&self.store, &head, key).await?.is_some())
    }

    pub fn mem(&self, key: &Key) -> BackendResult<bool> {
        self.mem_async(key).block_on()
    }

    /// The steps one level below `key`.
    pub async fn list_steps_async(&self, key: &Key) -> BackendResult<Vec<StepBuf>> {
        let Some(head) = self.head_async().await? else {
            return Ok(vec![]);
        };
        let Some(node_id) = graph::node_at(&self.store, &head, key).await? else {
            return Ok(vec![]);
        };
        let node = self.store.get_node_async(&node_id).await?;
        Ok(node.steps().map(Step::to_owned).collect())
    }

    pub fn list_steps(&self, key: &Key) -> BackendResult<Vec<StepBuf>> {
        self.list_steps_async(key).block_on()
    }

    /// Stores `value` at `key`: writes the new nodes bottom-up, commits
    /// with the previous head as parent, and moves the branch pointer.
    #[instrument(skip(self, value))]
    pub async fn update_async(&mut self, key: &Key, value: C) -> BackendResult<CommitId> {
        let content_id = self.store.add_contents_async(&value).await?;
        self.commit_edits(vec![(key.to_owned(), Some(content_id))])
            .await
    }

    pub fn update(&mut self, key: &Key, value: C) -> BackendResult<CommitId> {
        self.update_async(key, value).block_on()
    }

    /// Removes the value at `key`. Dirs left empty are pruned.
    #[instrument(skip(self))]
    pub async fn remove_async(&mut self, key: &Key) -> BackendResult<CommitId> {
        self.commit_edits(vec![(key.to_owned(), None)]).await
    }

    pub fn remove(&mut self, key: &Key) -> BackendResult<CommitId> {
        self.remove_async(key).block_on()
    }

    pub(crate) async fn commit_edits(
        &mut self,
        edits: Vec<(KeyBuf, Option<ContentId>)>,
    ) -> BackendResult<CommitId> {
        let head = self.head_async().await?;
        let base_node = match &head {
            Some(id) => self.store.get_commit_async(id).await?.node.clone(),
            None => None,
        };
        let mut builder = NodeBuilder::new(self.store.clone(), base_node);
        for (key, id) in edits {
            builder.set_or_remove_contents(key, id);
        }
        let root = builder.write().await?;
        let commit = Commit {
            node: Some(root),
            parents: head.into_iter().collect(),
            task: self.task.refreshed(),
        };
        let id = self.store.add_commit_async(commit).await?;
        debug!(commit = %id, "committed edits");
        self.update_head_async(id.clone()).await?;
        Ok(id)
    }

    // ---- Three-way merge ----

    /// Merges the head of `tag` into this branch.
    pub async fn merge_async(&mut self, tag: &TagName) -> BackendResult<MergeOutcome> {
        match self.tags.read(tag).await? {
            Some(theirs) => self.merge_head_async(theirs).await,
            None => Ok(MergeOutcome::Conflicted(Conflict::new(format!(
                "tag {tag} does not exist"
            )))),
        }
    }

    pub fn merge(&mut self, tag: &TagName) -> BackendResult<MergeOutcome> {
        self.merge_async(tag).block_on()
    }

    /// Merges the commit `theirs` into this branch: no-op if already
    /// merged, fast-forward if this branch is an ancestor, otherwise a
    /// recursive three-way merge against the common ancestor.
    #[instrument(skip(self))]
    pub async fn merge_head_async(&mut self, theirs: CommitId) -> BackendResult<MergeOutcome> {
        let Some(ours) = self.head_async().await? else {
            // Merging into an empty branch adopts the incoming history.
            self.update_head_async(theirs.clone()).await?;
            return Ok(MergeOutcome::FastForwarded(theirs));
        };
        if ours == theirs || graph::is_ancestor(&self.store, &theirs, &ours).await? {
            return Ok(MergeOutcome::Unchanged);
        }
        if graph::is_ancestor(&self.store, &ours, &theirs).await? {
            debug!(from = %ours, to = %theirs, "fast-forward");
            self.update_head_async(theirs.clone()).await?;
            return Ok(MergeOutcome::FastForwarded(theirs));
        }

        let lcas = graph::lcas(&self.store, &ours, &theirs).await?;
        if lcas.is_empty() {
            return Ok(MergeOutcome::Conflicted(Conflict::new(
                "no common ancestor",
            )));
        }
        let ours_commit = self.store.get_commit_async(&ours).await?;
        let theirs_commit = self.store.get_commit_async(&theirs).await?;
        let mut first_conflict = None;
        for lca in lcas {
            let base_commit = self.store.get_commit_async(&lca).await?;
            let merged = merge_root_nodes(
                &self.store,
                base_commit.node.as_ref(),
                ours_commit.node.as_ref(),
                theirs_commit.node.as_ref(),
            )
            .await?;
            match merged {
                Ok(root) => {
                    let commit = Commit {
                        node: Some(root),
                        parents: vec![ours.clone(), theirs.clone()],
                        task: self.task.refreshed(),
                    };
                    let id = self.store.add_commit_async(commit).await?;
                    debug!(base = %lca, commit = %id, "merged");
                    self.update_head_async(id.clone()).await?;
                    return Ok(MergeOutcome::Merged(id));
                }
                Err(conflict) => {
                    first_conflict.get_or_insert(conflict);
                }
            }
        }
        Ok(MergeOutcome::Conflicted(first_conflict.unwrap()))
    }

    pub fn merge_head(&mut self, theirs: CommitId) -> BackendResult<MergeOutcome> {
        self.merge_head_async(theirs).block_on()
    }
}

async fn load_node_or_empty<C: Contents>(
    store: &Store<C>,
    id: Option<&NodeId>,
) -> BackendResult<Node> {
    match id {
        Some(id) => Ok((*store.get_node_async(id).await?).clone()),
        None => Ok(Node::empty()),
    }
}

/// Merges commit root nodes, treating an absent root as the empty node.
/// The merged root is always written, even when empty.
pub(crate) async fn merge_root_nodes<C: Contents>(
    store: &Store<C>,
    old: Option<&NodeId>,
    a: Option<&NodeId>,
    b: Option<&NodeId>,
) -> BackendResult<MergeResult<NodeId>> {
    let old = load_node_or_empty(store, old).await?;
    let a = load_node_or_empty(store, a).await?;
    let b = load_node_or_empty(store, b).await?;
    match merge_nodes(store, &old, &a, &b).await? {
        Ok(merged) => Ok(Ok(store.add_node_async(merged).await?)),
        Err(conflict) => Ok(Err(conflict)),
    }
}

/// Recursive three-way node merge.
///
/// Edges are joined by `(step, kind)`. Contents edges resolve through the
/// user merge; child edges recurse, treating an absent child as an empty
/// node, and children merged to empty are pruned.
fn merge_nodes<'a, C: Contents>(
    store: &'a Store<C>,
    old: &'a Node,
    a: &'a Node,
    b: &'a Node,
) -> BoxFuture<'a, BackendResult<MergeResult<Node>>> {
    Box::pin(async move {
        let steps: BTreeSet<&Step> = old.steps().chain(a.steps()).chain(b.steps()).collect();
        let mut contents_edges: Vec<(StepBuf, ContentId)> = vec![];
        let mut child_edges: Vec<(StepBuf, NodeId)> = vec![];
        for step in steps {
            match merge_contents_edge(store, old.contents(step), a.contents(step), b.contents(step))
                .await?
            {
                Ok(Some(id)) => contents_edges.push((step.to_owned(), id)),
                Ok(None) => {}
                Err(conflict) => {
                    return Ok(Err(prefix_conflict(step, conflict)));
                }
            }
            match merge_child_edge(store, old.child(step), a.child(step), b.child(step)).await? {
                Ok(Some(id)) => child_edges.push((step.to_owned(), id)),
                Ok(None) => {}
                Err(conflict) => {
                    return Ok(Err(prefix_conflict(step, conflict)));
                }
            }
        }
        Ok(Ok(Node::new(contents_edges, child_edges)))
    })
}

fn prefix_conflict(step: &Step, conflict: Conflict) -> Conflict {
    Conflict::new(format!("{}: {}", step.as_str(), conflict.0))
}

async fn merge_contents_edge<C: Contents>(
    store: &Store<C>,
    old: Option<&ContentId>,
    a: Option<&ContentId>,
    b: Option<&ContentId>,
) -> BackendResult<MergeResult<Option<ContentId>>> {
    if a == b {
        return Ok(Ok(a.cloned()));
    }
    if a == old {
        return Ok(Ok(b.cloned()));
    }
    if b == old {
        return Ok(Ok(a.cloned()));
    }
    match (old, a, b) {
        (Some(old), Some(a), Some(b)) => {
            let old = store.get_contents_async(old).await?;
            let a = store.get_contents_async(a).await?;
            let b = store.get_contents_async(b).await?;
            match C::merge(&old, &a, &b) {
                Ok(merged) => Ok(Ok(Some(store.add_contents_async(&merged).await?))),
                Err(conflict) => Ok(Err(conflict)),
            }
        }
        _ => Ok(Err(Conflict::new(
            "one side added or removed a value the other side changed",
        ))),
    }
}

async fn merge_child_edge<C: Contents>(
    store: &Store<C>,
    old: Option<&NodeId>,
    a: Option<&NodeId>,
    b: Option<&NodeId>,
) -> BackendResult<MergeResult<Option<NodeId>>> {
    if a == b {
        return Ok(Ok(a.cloned()));
    }
    if a == old {
        return Ok(Ok(b.cloned()));
    }
    if b == old {
        return Ok(Ok(a.cloned()));
    }
    // Both sides changed the subtree; recurse. An absent side is an empty
    // subtree, so a removal merges against concurrent edits leaf by leaf.
    let old_node = load_node_or_empty(store, old).await?;
    let a_node = load_node_or_empty(store, a).await?;
    let b_node = load_node_or_empty(store, b).await?;
    match merge_nodes(store, &old_node, &a_node, &b_node).await? {
        Ok(merged) if merged.is_empty() => Ok(Ok(None)),
        Ok(merged) => Ok(Ok(Some(store.add_node_async(merged).await?))),
        Err(conflict) => Ok(Err(conflict)),
    }
}
