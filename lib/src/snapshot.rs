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

//! Snapshots: read-only pins on a commit.

#![expect(missing_docs)]

use std::sync::Arc;

use futures::StreamExt as _;
use futures::stream;
use futures::stream::BoxStream;
use pollster::FutureExt as _;

use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::branch::Branch;
use crate::branch::MergeOutcome;
use crate::contents::Contents;
use crate::graph;
use crate::key::Key;
use crate::key::KeyBuf;
use crate::store::Store;

/// A frozen head with read-through lookup. Cheap to clone; never moves.
#[derive(Clone)]
pub struct Snapshot<C: Contents> {
    store: Arc<Store<C>>,
    head: CommitId,
}

impl<C: Contents> std::fmt::Debug for Snapshot<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("head", &self.head).finish()
    }
}

impl<C: Contents> Snapshot<C> {
    /// Pins the branch's current head. `None` if the branch has no head
    /// yet.
    pub async fn of_branch_async(branch: &Branch<C>) -> BackendResult<Option<Self>> {
        Ok(branch
            .head_async()
            .await?
            .map(|head| Self::of_head(branch.store().clone(), head)))
    }

    pub fn of_branch(branch: &Branch<C>) -> BackendResult<Option<Self>> {
        Self::of_branch_async(branch).block_on()
    }

    /// Pins an explicit commit.
    pub fn of_head(store: Arc<Store<C>>, head: CommitId) -> Self {
        Self { store, head }
    }

    pub fn head(&self) -> &CommitId {
        &self.head
    }

    /// The value at `key` as of this snapshot.
    pub async fn read_async(&self, key: &Key) -> BackendResult<Option<C>> {
        let Some(content_id) = graph::find(&self.store, &self.head, key).await? else {
            return Ok(None);
        };
        Ok(Some(self.store.get_contents_async(&content_id).await?))
    }

    pub fn read(&self, key: &Key) -> BackendResult<Option<C>> {
        self.read_async(key).block_on()
    }

    /// Moves the branch back to this snapshot's head.
    pub async fn revert_async(&self, branch: &mut Branch<C>) -> BackendResult<()> {
        branch.update_head_async(self.head.clone()).await
    }

    pub fn revert(&self, branch: &mut Branch<C>) -> BackendResult<()> {
        self.revert_async(branch).block_on()
    }

    /// Three-way merges this snapshot's head into the branch.
    pub async fn merge_async(&self, branch: &mut Branch<C>) -> BackendResult<MergeOutcome> {
        branch.merge_head_async(self.head.clone()).await
    }

    pub fn merge(&self, branch: &mut Branch<C>) -> BackendResult<MergeOutcome> {
        self.merge_async(branch).block_on()
    }

    /// Watches the subtree under `key` on the branch: yields a `(key,
    /// snapshot)` pair for each observed change under it. An empty stream
    /// for a detached branch.
    pub async fn watch_async(
        branch: &Branch<C>,
        key: &Key,
    ) -> BackendResult<BoxStream<'static, BackendResult<(KeyBuf, Self)>>> {
        let Some(tag) = branch.tag() else {
            return Ok(stream::empty().boxed());
        };
        let store = branch.store().clone();
        let key = key.to_owned();
        let initial = match branch.head_async().await? {
            Some(head) => graph::node_at(&store, &head, &key).await?,
            None => None,
        };
        let heads = branch.tag_store().watch(tag).await?;

        let stream = stream::unfold(
            (heads, initial, store, key),
            |(mut heads, mut last, store, key)| async move {
                loop {
                    let head = heads.next().await?;
                    let Some(head) = head else {
                        // Tag removed; there is no snapshot to report.
                        last = None;
                        continue;
                    };
                    match graph::node_at(&store, &head, &key).await {
                        Ok(node) => {
                            if node == last {
                                continue;
                            }
                            last = node;
                            let snapshot = Self::of_head(store.clone(), head);
                            return Some((
                                Ok((key.clone(), snapshot)),
                                (heads, last, store, key),
                            ));
                        }
                        Err(err) => return Some((Err(err), (heads, last, store, key))),
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    pub fn watch(
        branch: &Branch<C>,
        key: &Key,
    ) -> BackendResult<BoxStream<'static, BackendResult<(KeyBuf, Self)>>> {
        Self::watch_async(branch, key).block_on()
    }
}
