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

//! Test fixtures for the silt-lib crate.

use std::sync::Arc;

use async_trait::async_trait;
use silt_lib::backend::BackendResult;
use silt_lib::backend::CommitId;
use silt_lib::backend::TagName;
use silt_lib::backend::TagStore;
use silt_lib::backend::Task;
use silt_lib::branch::Branch;
use silt_lib::config::StoreConfig;
use silt_lib::contents::Contents;
use silt_lib::key::KeyBuf;
use silt_lib::mem_store::MemoryTagStore;
use silt_lib::object_id::ObjectId as _;
use silt_lib::store::Store;
use silt_lib::sync::Remote;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("silt-test-")
        .tempdir()
        .unwrap()
}

/// A task with a fixed test owner.
pub fn test_task() -> Task {
    Task::new("test.user@example.com")
}

pub fn key(value: &str) -> KeyBuf {
    KeyBuf::from_internal_string(value).unwrap()
}

pub fn tag(value: &str) -> TagName {
    TagName::new(value).unwrap()
}

/// An in-memory store plus tag store, ready for branch handles.
pub struct TestStore<C: Contents> {
    pub store: Arc<Store<C>>,
    pub tags: Arc<MemoryTagStore>,
}

impl<C: Contents> TestStore<C> {
    pub fn init() -> Self {
        Self {
            store: Store::in_memory(),
            tags: Arc::new(MemoryTagStore::new()),
        }
    }

    pub fn tag_store(&self) -> Arc<dyn TagStore> {
        self.tags.clone()
    }

    /// An attached handle on `master`.
    pub fn master(&self) -> Branch<C> {
        Branch::of_master(self.store.clone(), self.tag_store(), test_task())
    }

    /// An attached handle on the named tag.
    pub fn branch(&self, name: &str) -> Branch<C> {
        Branch::of_tag(self.store.clone(), self.tag_store(), test_task(), tag(name))
    }

    /// Number of objects in each append-only store:
    /// `(contents, nodes, commits)`.
    pub fn object_counts(&self) -> (usize, usize, usize) {
        use pollster::FutureExt as _;
        let count = |store: &dyn silt_lib::backend::AppendOnlyStore| {
            store.list().block_on().unwrap().len()
        };
        (
            count(self.store.contents_store()),
            count(self.store.node_store()),
            count(self.store.commit_store()),
        )
    }

    /// Every tag name currently in the tag store.
    pub fn tag_names(&self) -> Vec<TagName> {
        use pollster::FutureExt as _;
        TagStore::list(self.tags.as_ref()).block_on().unwrap()
    }
}

/// A remote that reports fixed heads and records calls.
#[derive(Debug, Default)]
pub struct StaticRemote {
    pub fetch_head: Option<CommitId>,
    pub push_head: Option<CommitId>,
}

#[async_trait]
impl Remote for StaticRemote {
    async fn fetch(
        &self,
        _config: &StoreConfig,
        _depth: Option<usize>,
        _uri: &str,
    ) -> BackendResult<Option<String>> {
        Ok(self.fetch_head.as_ref().map(|id| id.hex()))
    }

    async fn push(
        &self,
        _config: &StoreConfig,
        _depth: Option<usize>,
        _uri: &str,
    ) -> BackendResult<Option<String>> {
        Ok(self.push_head.as_ref().map(|id| id.hex()))
    }
}
