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

//! Slices: bounded subgraph export/import for partial replication.
//!
//! A slice is a self-contained bundle of raw store entries (contents,
//! nodes, commits, and tags) produced by a bounded walk and importable
//! into another store. Object writes are content-addressed and therefore
//! idempotent; only tags can clash.

#![expect(missing_docs)]

use std::collections::HashSet;

use pollster::FutureExt as _;
use thiserror::Error;
use tracing::debug;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::backend::ContentId;
use crate::backend::NodeId;
use crate::backend::TagName;
use crate::backend::TagStore;
use crate::contents::Contents;
use crate::graph;
use crate::graph::WalkMode;
use crate::graph::WalkedId;
use crate::object_id::ObjectId;
use crate::store::Store;

/// Bounds for [`export`].
#[derive(Clone, Debug)]
pub struct ExportOptions {
    /// Include node trees and contents, not just history. Defaults to
    /// true.
    pub full: bool,
    /// Maximum number of parent edges to follow from the heads.
    pub depth: Option<usize>,
    /// Commits the walk stops at, excluded from the slice.
    pub min: Vec<CommitId>,
    /// Heads the walk starts from. Defaults to the current tag heads.
    pub max: Option<Vec<CommitId>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            full: true,
            depth: None,
            min: vec![],
            max: None,
        }
    }
}

/// A self-contained bundle of store entries.
///
/// Entries are `(id, raw bytes)` pairs for the append-only stores and
/// `(name, commit id)` pairs for tags, in walk order. The encoding of the
/// bundle itself is whatever serde format the caller picks.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Slice {
    pub contents: Vec<(ContentId, Vec<u8>)>,
    pub nodes: Vec<(NodeId, Vec<u8>)>,
    pub commits: Vec<(CommitId, Vec<u8>)>,
    pub tags: Vec<(TagName, CommitId)>,
}

impl Slice {
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
            && self.nodes.is_empty()
            && self.commits.is_empty()
            && self.tags.is_empty()
    }
}

/// Error from [`import`].
#[derive(Debug, Error)]
pub enum ImportError {
    /// Tags that already exist in the target store. Objects and
    /// non-clashing tags were imported; the named tags were left alone.
    #[error("Duplicated tags: {names:?}")]
    DuplicatedTags { names: Vec<TagName> },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn dangling(id: &impl ObjectId) -> BackendError {
    BackendError::ObjectNotFound {
        object_type: id.object_type(),
        hash: id.hex(),
        source: "object referenced by the walk is not stored".into(),
    }
}

fn digest_mismatch(id: &impl ObjectId, written: &impl ObjectId) -> BackendError {
    BackendError::Corrupt {
        object_type: id.object_type(),
        hash: id.hex(),
        source: format!("slice entry bytes digest to {}", written.hex()).into(),
    }
}

/// Exports the commits reachable from `max` within the given bounds,
/// together with (if `full`) every node and contents they reference, and
/// the tags pointing at exported commits.
pub async fn export_async<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    options: &ExportOptions,
) -> BackendResult<Slice> {
    let max = match &options.max {
        Some(max) => max.clone(),
        None => tags.dump().await?.into_iter().map(|(_, id)| id).collect(),
    };
    let min: HashSet<CommitId> = options.min.iter().cloned().collect();
    let mode = if options.full {
        WalkMode::Full
    } else {
        WalkMode::History
    };

    let mut slice = Slice::default();
    let mut exported_commits = HashSet::new();
    for entry in graph::walk(store, &max, mode, options.depth, &min).await? {
        match entry.id {
            WalkedId::Commit(id) => {
                let bytes = store
                    .read_commit_bytes(&id)
                    .await?
                    .ok_or_else(|| dangling(&id))?;
                exported_commits.insert(id.clone());
                slice.commits.push((id, bytes));
            }
            WalkedId::Node(id) => {
                let bytes = store
                    .read_node_bytes(&id)
                    .await?
                    .ok_or_else(|| dangling(&id))?;
                slice.nodes.push((id, bytes));
            }
            WalkedId::Contents(id) => {
                let bytes = store
                    .read_contents_bytes(&id)
                    .await?
                    .ok_or_else(|| dangling(&id))?;
                slice.contents.push((id, bytes));
            }
        }
    }
    for (tag, id) in tags.dump().await? {
        if exported_commits.contains(&id) {
            slice.tags.push((tag, id));
        }
    }
    debug!(
        contents = slice.contents.len(),
        nodes = slice.nodes.len(),
        commits = slice.commits.len(),
        tags = slice.tags.len(),
        "exported slice"
    );
    Ok(slice)
}

pub fn export<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    options: &ExportOptions,
) -> BackendResult<Slice> {
    export_async(store, tags, options).block_on()
}

async fn import_objects<C: Contents>(store: &Store<C>, slice: &Slice) -> BackendResult<()> {
    for (id, bytes) in &slice.contents {
        let written = store.add_contents_bytes(bytes).await?;
        if written != *id {
            return Err(digest_mismatch(id, &written));
        }
    }
    for (id, bytes) in &slice.nodes {
        let written = store.add_node_bytes(bytes).await?;
        if written != *id {
            return Err(digest_mismatch(id, &written));
        }
    }
    for (id, bytes) in &slice.commits {
        let written = store.add_commit_bytes(bytes).await?;
        if written != *id {
            return Err(digest_mismatch(id, &written));
        }
    }
    Ok(())
}

/// Imports a slice. Objects are written unconditionally (idempotent);
/// existing tags are refused and reported, non-clashing tags are written.
pub async fn import_async<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    slice: &Slice,
) -> Result<(), ImportError> {
    import_objects(store, slice).await?;
    let mut duplicated = vec![];
    for (tag, id) in &slice.tags {
        if tags.mem(tag).await? {
            duplicated.push(tag.clone());
        } else {
            tags.update(tag, id.clone()).await?;
        }
    }
    if duplicated.is_empty() {
        Ok(())
    } else {
        Err(ImportError::DuplicatedTags { names: duplicated })
    }
}

pub fn import<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    slice: &Slice,
) -> Result<(), ImportError> {
    import_async(store, tags, slice).block_on()
}

/// As [`import_async`], but overwrites existing tags.
pub async fn import_force_async<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    slice: &Slice,
) -> BackendResult<()> {
    import_objects(store, slice).await?;
    for (tag, id) in &slice.tags {
        tags.update(tag, id.clone()).await?;
    }
    Ok(())
}

pub fn import_force<C: Contents>(
    store: &Store<C>,
    tags: &dyn TagStore,
    slice: &Slice,
) -> BackendResult<()> {
    import_force_async(store, tags, slice).block_on()
}
