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

#![expect(missing_docs)]

use std::fmt::Debug;
use std::fmt::Formatter;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use clru::CLruCache;
use pollster::FutureExt as _;
use serde::de::DeserializeOwned;

use crate::backend::AppendOnlyStore;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::Commit;
use crate::backend::CommitId;
use crate::backend::ContentId;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::config::StoreConfig;
use crate::contents::Contents;
use crate::mem_store::MemoryAppendStore;
use crate::object_id::ObjectId;
use crate::simple_store::SimpleAppendStore;

// There are more node objects than commits, and nodes are often shared
// across commits.
const COMMIT_CACHE_CAPACITY: usize = 100;
const NODE_CACHE_CAPACITY: usize = 1000;

/// Whether the configured backends accept the empty-history sentinel, a
/// commit without a root node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EmptyCommits {
    Allow,
    Refuse,
}

/// Wraps the three append-only instances and makes them return typed
/// objects. Also adds caching for decoded nodes and commits.
pub struct Store<C> {
    contents: Box<dyn AppendOnlyStore>,
    nodes: Box<dyn AppendOnlyStore>,
    commits: Box<dyn AppendOnlyStore>,
    node_cache: Mutex<CLruCache<NodeId, Arc<Node>>>,
    commit_cache: Mutex<CLruCache<CommitId, Arc<Commit>>>,
    empty_commits: EmptyCommits,
    phantom: PhantomData<fn() -> C>,
}

impl<C> Debug for Store<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Store")
            .field("contents", &self.contents)
            .field("nodes", &self.nodes)
            .field("commits", &self.commits)
            .finish_non_exhaustive()
    }
}

fn encode<T: serde::Serialize>(object_type: &'static str, value: &T) -> BackendResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| BackendError::WriteObject {
        object_type,
        source: Box::new(err),
    })
}

fn decode<T: DeserializeOwned>(
    object_type: &str,
    hash: String,
    bytes: &[u8],
) -> BackendResult<T> {
    serde_json::from_slice(bytes).map_err(|err| BackendError::Corrupt {
        object_type: object_type.to_string(),
        hash,
        source: Box::new(err),
    })
}

fn not_found(id: &impl ObjectId) -> BackendError {
    BackendError::ObjectNotFound {
        object_type: id.object_type(),
        hash: id.hex(),
        source: "no object stored under this id".into(),
    }
}

impl<C: Contents> Store<C> {
    /// Wraps the given append-only backends.
    pub fn new(
        contents: Box<dyn AppendOnlyStore>,
        nodes: Box<dyn AppendOnlyStore>,
        commits: Box<dyn AppendOnlyStore>,
        empty_commits: EmptyCommits,
    ) -> Arc<Self> {
        Arc::new(Self {
            contents,
            nodes,
            commits,
            node_cache: Mutex::new(CLruCache::new(NODE_CACHE_CAPACITY.try_into().unwrap())),
            commit_cache: Mutex::new(CLruCache::new(COMMIT_CACHE_CAPACITY.try_into().unwrap())),
            empty_commits,
            phantom: PhantomData,
        })
    }

    /// An ephemeral store over the memory backend.
    pub fn in_memory() -> Arc<Self> {
        Self::new(
            Box::new(MemoryAppendStore::new()),
            Box::new(MemoryAppendStore::new()),
            Box::new(MemoryAppendStore::new()),
            EmptyCommits::Allow,
        )
    }

    /// A store over the simple file backend rooted at the configured
    /// `root` directory. The simple backend refuses the empty-history
    /// sentinel.
    pub fn on_disk(config: &StoreConfig) -> BackendResult<Arc<Self>> {
        let root = config
            .root()
            .map_err(|err| BackendError::Other(Box::new(err)))?
            .ok_or_else(|| {
                BackendError::Other("config key \"root\" is required for on-disk stores".into())
            })?;
        let root = Path::new(root);
        Ok(Self::new(
            Box::new(SimpleAppendStore::init(&root.join("contents"))?),
            Box::new(SimpleAppendStore::init(&root.join("nodes"))?),
            Box::new(SimpleAppendStore::init(&root.join("commits"))?),
            EmptyCommits::Refuse,
        ))
    }

    pub fn contents_store(&self) -> &dyn AppendOnlyStore {
        self.contents.as_ref()
    }

    pub fn node_store(&self) -> &dyn AppendOnlyStore {
        self.nodes.as_ref()
    }

    pub fn commit_store(&self) -> &dyn AppendOnlyStore {
        self.commits.as_ref()
    }

    // ---- Contents ----

    pub fn add_contents(&self, value: &C) -> BackendResult<ContentId> {
        self.add_contents_async(value).block_on()
    }

    pub async fn add_contents_async(&self, value: &C) -> BackendResult<ContentId> {
        let id = self.contents.add(&value.to_bytes()).await?;
        Ok(ContentId::new(id))
    }

    pub fn read_contents(&self, id: &ContentId) -> BackendResult<Option<C>> {
        self.read_contents_async(id).block_on()
    }

    pub async fn read_contents_async(&self, id: &ContentId) -> BackendResult<Option<C>> {
        let Some(bytes) = self.contents.read(id.as_bytes()).await? else {
            return Ok(None);
        };
        let value = C::from_bytes(&bytes).map_err(|err| BackendError::Corrupt {
            object_type: id.object_type(),
            hash: id.hex(),
            source: Box::new(err),
        })?;
        Ok(Some(value))
    }

    /// As [`read_contents_async`], but an absent id is an error.
    ///
    /// [`read_contents_async`]: Store::read_contents_async
    pub async fn get_contents_async(&self, id: &ContentId) -> BackendResult<C> {
        self.read_contents_async(id).await?.ok_or_else(|| not_found(id))
    }

    pub fn get_contents(&self, id: &ContentId) -> BackendResult<C> {
        self.get_contents_async(id).block_on()
    }

    pub async fn mem_contents_async(&self, id: &ContentId) -> BackendResult<bool> {
        self.contents.mem(id.as_bytes()).await
    }

    // ---- Nodes ----

    pub fn add_node(&self, node: Node) -> BackendResult<NodeId> {
        self.add_node_async(node).block_on()
    }

    pub async fn add_node_async(&self, node: Node) -> BackendResult<NodeId> {
        let bytes = encode("node", &node)?;
        let id = NodeId::new(self.nodes.add(&bytes).await?);
        let mut cache = self.node_cache.lock().unwrap();
        cache.put(id.clone(), Arc::new(node));
        Ok(id)
    }

    pub fn read_node(&self, id: &NodeId) -> BackendResult<Option<Arc<Node>>> {
        self.read_node_async(id).block_on()
    }

    pub async fn read_node_async(&self, id: &NodeId) -> BackendResult<Option<Arc<Node>>> {
        {
            let mut cache = self.node_cache.lock().unwrap();
            if let Some(node) = cache.get(id).cloned() {
                return Ok(Some(node));
            }
        }
        let Some(bytes) = self.nodes.read(id.as_bytes()).await? else {
            return Ok(None);
        };
        let node: Node = decode("node", id.hex(), &bytes)?;
        let node = Arc::new(node);
        let mut cache = self.node_cache.lock().unwrap();
        cache.put(id.clone(), node.clone());
        Ok(Some(node))
    }

    /// As [`read_node_async`], but an absent id is an error. This is the
    /// right call when the id came out of another stored object: a
    /// dangling reference is an invariant violation, not a missing key.
    ///
    /// [`read_node_async`]: Store::read_node_async
    pub async fn get_node_async(&self, id: &NodeId) -> BackendResult<Arc<Node>> {
        self.read_node_async(id).await?.ok_or_else(|| not_found(id))
    }

    pub fn get_node(&self, id: &NodeId) -> BackendResult<Arc<Node>> {
        self.get_node_async(id).block_on()
    }

    pub async fn mem_node_async(&self, id: &NodeId) -> BackendResult<bool> {
        self.nodes.mem(id.as_bytes()).await
    }

    // ---- Commits ----

    pub fn add_commit(&self, commit: Commit) -> BackendResult<CommitId> {
        self.add_commit_async(commit).block_on()
    }

    pub async fn add_commit_async(&self, commit: Commit) -> BackendResult<CommitId> {
        if commit.node.is_none() && self.empty_commits == EmptyCommits::Refuse {
            return Err(BackendError::Unsupported(
                "this backend doesn't support commits without a root node".to_string(),
            ));
        }
        let bytes = encode("commit", &commit)?;
        let id = CommitId::new(self.commits.add(&bytes).await?);
        let mut cache = self.commit_cache.lock().unwrap();
        cache.put(id.clone(), Arc::new(commit));
        Ok(id)
    }

    pub fn read_commit(&self, id: &CommitId) -> BackendResult<Option<Arc<Commit>>> {
        self.read_commit_async(id).block_on()
    }

    pub async fn read_commit_async(&self, id: &CommitId) -> BackendResult<Option<Arc<Commit>>> {
        {
            let mut cache = self.commit_cache.lock().unwrap();
            if let Some(commit) = cache.get(id).cloned() {
                return Ok(Some(commit));
            }
        }
        let Some(bytes) = self.commits.read(id.as_bytes()).await? else {
            return Ok(None);
        };
        let commit: Commit = decode("commit", id.hex(), &bytes)?;
        let commit = Arc::new(commit);
        let mut cache = self.commit_cache.lock().unwrap();
        cache.put(id.clone(), commit.clone());
        Ok(Some(commit))
    }

    /// As [`read_commit_async`], but an absent id is an error.
    ///
    /// [`read_commit_async`]: Store::read_commit_async
    pub async fn get_commit_async(&self, id: &CommitId) -> BackendResult<Arc<Commit>> {
        self.read_commit_async(id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    pub fn get_commit(&self, id: &CommitId) -> BackendResult<Arc<Commit>> {
        self.get_commit_async(id).block_on()
    }

    pub async fn mem_commit_async(&self, id: &CommitId) -> BackendResult<bool> {
        self.commits.mem(id.as_bytes()).await
    }

    // ---- Raw bytes, for slice export/import ----

    pub(crate) async fn read_contents_bytes(
        &self,
        id: &ContentId,
    ) -> BackendResult<Option<Vec<u8>>> {
        self.contents.read(id.as_bytes()).await
    }

    pub(crate) async fn read_node_bytes(&self, id: &NodeId) -> BackendResult<Option<Vec<u8>>> {
        self.nodes.read(id.as_bytes()).await
    }

    pub(crate) async fn read_commit_bytes(&self, id: &CommitId) -> BackendResult<Option<Vec<u8>>> {
        self.commits.read(id.as_bytes()).await
    }

    pub(crate) async fn add_contents_bytes(&self, bytes: &[u8]) -> BackendResult<ContentId> {
        Ok(ContentId::new(self.contents.add(bytes).await?))
    }

    pub(crate) async fn add_node_bytes(&self, bytes: &[u8]) -> BackendResult<NodeId> {
        Ok(NodeId::new(self.nodes.add(bytes).await?))
    }

    pub(crate) async fn add_commit_bytes(&self, bytes: &[u8]) -> BackendResult<CommitId> {
        Ok(CommitId::new(self.commits.add(bytes).await?))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::Task;
    use crate::key::StepBuf;

    fn step(value: &str) -> StepBuf {
        StepBuf::new(value).unwrap()
    }

    #[test]
    fn test_contents_round_trip() {
        let store: Arc<Store<String>> = Store::in_memory();
        let id = store.add_contents(&"v".to_string()).unwrap();
        assert_eq!(store.add_contents(&"v".to_string()).unwrap(), id);
        assert_eq!(store.read_contents(&id).unwrap(), Some("v".to_string()));
        assert_eq!(store.get_contents(&id).unwrap(), "v".to_string());
    }

    #[test]
    fn test_node_round_trip() {
        let store: Arc<Store<String>> = Store::in_memory();
        let content_id = store.add_contents(&"v".to_string()).unwrap();
        let node = Node::new([(step("a"), content_id)], []);
        let id = store.add_node(node.clone()).unwrap();
        assert_eq!(*store.get_node(&id).unwrap(), node);

        // Same node, same id.
        assert_eq!(store.add_node(node).unwrap(), id);
    }

    #[test]
    fn test_commit_round_trip() {
        let store: Arc<Store<String>> = Store::in_memory();
        let node_id = store.add_node(Node::empty()).unwrap();
        let commit = Commit {
            node: Some(node_id),
            parents: vec![],
            task: Task::new("test"),
        };
        let id = store.add_commit(commit.clone()).unwrap();
        assert_eq!(*store.get_commit(&id).unwrap(), commit);
    }

    #[test]
    fn test_get_missing_object_is_an_error() {
        let store: Arc<Store<String>> = Store::in_memory();
        let id = NodeId::from_bytes(&[0; 64]);
        assert_eq!(store.read_node(&id).unwrap(), None);
        assert_matches!(
            store.get_node(&id),
            Err(BackendError::ObjectNotFound { .. })
        );
    }

    #[test]
    fn test_empty_commit_policy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = crate::config::StoreConfig::new().set(
            crate::config::CONFIG_ROOT,
            crate::config::ConfigValue::Str(temp_dir.path().to_str().unwrap().to_string()),
        );
        let disk: Arc<Store<String>> = Store::on_disk(&config).unwrap();
        let commit = Commit {
            node: None,
            parents: vec![],
            task: Task::new("test"),
        };
        assert_matches!(
            disk.add_commit(commit.clone()),
            Err(BackendError::Unsupported(_))
        );

        let mem: Arc<Store<String>> = Store::in_memory();
        assert!(mem.add_commit(commit).is_ok());
    }
}
