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

//! In-memory backends.
//!
//! The reference backend pair: a content-addressed object table and a tag
//! map, both behind plain mutexes. Ephemeral by construction; everything
//! is gone when the store is dropped.

#![expect(missing_docs)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::backend::AppendOnlyStore;
use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::backend::TagName;
use crate::backend::TagStore;
use crate::content_hash::BLAKE2B_HASH_LENGTH;
use crate::content_hash::blake2b_hash;
use crate::watch::WatchRegistry;

/// An in-memory append-only store.
#[derive(Debug, Default)]
pub struct MemoryAppendStore {
    objects: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryAppendStore {
    pub fn name() -> &'static str {
        "memory"
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects. Adding an object twice does not grow the
    /// store.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl AppendOnlyStore for MemoryAppendStore {
    fn name(&self) -> &str {
        Self::name()
    }

    fn id_length(&self) -> usize {
        BLAKE2B_HASH_LENGTH
    }

    async fn add(&self, data: &[u8]) -> BackendResult<Vec<u8>> {
        let id = blake2b_hash(data);
        self.objects
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| data.to_vec());
        Ok(id)
    }

    async fn read(&self, id: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(id).cloned())
    }

    async fn mem(&self, id: &[u8]) -> BackendResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(id))
    }

    async fn list(&self) -> BackendResult<Vec<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }
}

/// An in-memory tag store with watch support.
#[derive(Debug, Default)]
pub struct MemoryTagStore {
    tags: Mutex<BTreeMap<TagName, CommitId>>,
    watchers: Arc<WatchRegistry>,
}

impl MemoryTagStore {
    pub fn name() -> &'static str {
        "memory"
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// The registry fanning out this store's tag changes.
    pub fn watch_registry(&self) -> &Arc<WatchRegistry> {
        &self.watchers
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn read(&self, tag: &TagName) -> BackendResult<Option<CommitId>> {
        Ok(self.tags.lock().unwrap().get(tag).cloned())
    }

    async fn mem(&self, tag: &TagName) -> BackendResult<bool> {
        Ok(self.tags.lock().unwrap().contains_key(tag))
    }

    async fn update(&self, tag: &TagName, id: CommitId) -> BackendResult<()> {
        self.tags.lock().unwrap().insert(tag.clone(), id.clone());
        self.watchers.notify(tag, Some(id)).await;
        Ok(())
    }

    async fn remove(&self, tag: &TagName) -> BackendResult<()> {
        let removed = self.tags.lock().unwrap().remove(tag);
        if removed.is_some() {
            self.watchers.notify(tag, None).await;
        }
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<TagName>> {
        Ok(self.tags.lock().unwrap().keys().cloned().collect())
    }

    async fn dump(&self) -> BackendResult<Vec<(TagName, CommitId)>> {
        Ok(self
            .tags
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, id)| (tag.clone(), id.clone()))
            .collect())
    }

    async fn watch(&self, tag: &TagName) -> BackendResult<BoxStream<'static, Option<CommitId>>> {
        let initial = self.tags.lock().unwrap().get(tag).cloned();
        Ok(self.watchers.watch(tag, initial))
    }
}
