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

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::key::Step;
use crate::key::StepBuf;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;

id_type!(
    /// Identifier for a user contents value: the digest of its canonical
    /// serialization.
    pub ContentId
);
id_type!(
    /// Identifier for a [`Node`] based on its canonical serialization.
    pub NodeId
);
id_type!(
    /// Identifier for a [`Commit`] based on its canonical serialization.
    pub CommitId
);

#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct MillisSinceEpoch(pub i64);

impl MillisSinceEpoch {
    pub fn now() -> Self {
        Self(chrono::offset::Local::now().timestamp_millis())
    }
}

/// Audit metadata attached to every commit.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Task {
    pub date: MillisSinceEpoch,
    pub owner: String,
    /// Opaque id distinguishing tasks created at the same millisecond.
    /// Generated by the store; carries no meaning.
    pub uid: u64,
    pub messages: Vec<String>,
}

impl Task {
    /// Creates a task owned by `owner`, dated now, with a fresh uid.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            date: MillisSinceEpoch::now(),
            owner: owner.into(),
            uid: rand::random(),
            messages: vec![],
        }
    }

    /// Returns a copy of this task with `message` appended.
    pub fn with_message(&self, message: impl Into<String>) -> Self {
        let mut task = self.clone();
        task.messages.push(message.into());
        task
    }

    /// Returns a copy of this task with a fresh date and uid, for the
    /// next commit of the same logical task.
    pub fn refreshed(&self) -> Self {
        Self {
            date: MillisSinceEpoch::now(),
            uid: rand::random(),
            owner: self.owner.clone(),
            messages: self.messages.clone(),
        }
    }
}

/// An edge value in a node: either the contents stored at a step or the
/// child node continuing the path.
///
/// The two kinds are disjoint namespaces. A node may carry both a
/// contents edge and a child edge under the same step; it never carries
/// two edges of the same kind under one step.
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeValue {
    Contents(ContentId),
    Child(NodeId),
}

impl NodeValue {
    pub fn hex(&self) -> String {
        match self {
            Self::Contents(id) => id.hex(),
            Self::Child(id) => id.hex(),
        }
    }

    // Edges sort by (step, kind); the hash itself never participates.
    fn kind_rank(&self) -> u8 {
        match self {
            Self::Contents(_) => 0,
            Self::Child(_) => 1,
        }
    }
}

/// A directory-like object: a sorted set of labeled edges referencing
/// contents and child nodes by hash only.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct Node {
    entries: Vec<(StepBuf, NodeValue)>,
}

impl Node {
    /// The node with no edges.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a node from edges sorted by `(step, kind)`.
    pub fn from_sorted_entries(entries: Vec<(StepBuf, NodeValue)>) -> Self {
        debug_assert!(
            entries.is_sorted_by(|(a_step, a_value), (b_step, b_value)| {
                (a_step, a_value.kind_rank()) < (b_step, b_value.kind_rank())
            }),
            "node entries must be sorted and unique per (step, kind)"
        );
        Self { entries }
    }

    /// Builds a node from unordered contents and child edges.
    pub fn new(
        contents: impl IntoIterator<Item = (StepBuf, ContentId)>,
        children: impl IntoIterator<Item = (StepBuf, NodeId)>,
    ) -> Self {
        let mut entries: Vec<(StepBuf, NodeValue)> = contents
            .into_iter()
            .map(|(step, id)| (step, NodeValue::Contents(id)))
            .chain(
                children
                    .into_iter()
                    .map(|(step, id)| (step, NodeValue::Child(id))),
            )
            .collect();
        entries.sort_by(|(a_step, a_value), (b_step, b_value)| {
            (a_step, a_value.kind_rank()).cmp(&(b_step, b_value.kind_rank()))
        });
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The contents edge at `step`, if any.
    pub fn contents(&self, step: &Step) -> Option<&ContentId> {
        match self.find(step, 0)? {
            NodeValue::Contents(id) => Some(id),
            NodeValue::Child(_) => None,
        }
    }

    /// The child edge at `step`, if any.
    pub fn child(&self, step: &Step) -> Option<&NodeId> {
        match self.find(step, 1)? {
            NodeValue::Child(id) => Some(id),
            NodeValue::Contents(_) => None,
        }
    }

    fn find(&self, step: &Step, kind_rank: u8) -> Option<&NodeValue> {
        let index = self
            .entries
            .binary_search_by(|(entry_step, entry_value)| {
                (entry_step.as_ref(), entry_value.kind_rank()).cmp(&(step, kind_rank))
            })
            .ok()?;
        Some(&self.entries[index].1)
    }

    /// Returns this node with the contents edge at `step` replaced
    /// (`Some`) or removed (`None`). Pure; the receiver is unchanged.
    #[must_use]
    pub fn with_contents(&self, step: &Step, id: Option<ContentId>) -> Self {
        self.with_value(step, 0, id.map(NodeValue::Contents))
    }

    /// Returns this node with the child edge at `step` replaced (`Some`)
    /// or removed (`None`). Pure; the receiver is unchanged.
    #[must_use]
    pub fn with_child(&self, step: &Step, id: Option<NodeId>) -> Self {
        self.with_value(step, 1, id.map(NodeValue::Child))
    }

    fn with_value(&self, step: &Step, kind_rank: u8, value: Option<NodeValue>) -> Self {
        let mut entries = self.entries.clone();
        let search = entries.binary_search_by(|(entry_step, entry_value)| {
            (entry_step.as_ref(), entry_value.kind_rank()).cmp(&(step, kind_rank))
        });
        match (search, value) {
            (Ok(index), Some(value)) => entries[index] = (step.to_owned(), value),
            (Ok(index), None) => {
                entries.remove(index);
            }
            (Err(index), Some(value)) => entries.insert(index, (step.to_owned(), value)),
            (Err(_), None) => {}
        }
        Self { entries }
    }

    /// The steps of this node's edges, deduplicated across kinds, in
    /// order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        let mut last: Option<&Step> = None;
        self.entries.iter().filter_map(move |(step, _)| {
            let step: &Step = step;
            if last == Some(step) {
                None
            } else {
                last = Some(step);
                Some(step)
            }
        })
    }

    /// All edges in `(step, kind)` order.
    pub fn entries(&self) -> impl ExactSizeIterator<Item = (&Step, &NodeValue)> {
        self.entries.iter().map(|(step, value)| (step.as_ref(), value))
    }
}

/// An immutable history record: an optional root node, the parent
/// commits, and the task that produced it.
///
/// A commit without a root node is the empty-history sentinel. Backends
/// may refuse to write it; see the store constructors.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Commit {
    pub node: Option<NodeId>,
    pub parents: Vec<CommitId>,
    pub task: Task,
}

/// Error from attempts to build a tag out of an invalid name.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("Invalid tag name: {value:?}")]
pub struct InvalidTagNameError {
    pub value: String,
}

/// A branch name: a mutable, named reference to a commit.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TagName {
    value: String,
}

impl TagName {
    /// Wraps `value` as a `TagName`.
    ///
    /// Returns an error if the name is empty or contains `/` or NUL (tag
    /// names double as file names in on-disk tag stores).
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidTagNameError> {
        let value: String = value.into();
        if !value.is_empty() && !value.contains(['/', '\0']) {
            Ok(Self { value })
        } else {
            Err(InvalidTagNameError { value })
        }
    }

    /// The distinguished default branch.
    pub fn master() -> Self {
        Self {
            value: "master".to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Debug for TagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl std::fmt::Display for TagName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.value)
    }
}

impl serde::Serialize for TagName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.value.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for TagName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

/// Error that may occur after a backend is loaded.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(
        "Invalid hash length for object of type {object_type} (expected {expected} bytes, got \
         {actual} bytes): {hash}"
    )]
    InvalidHashLength {
        expected: usize,
        actual: usize,
        object_type: String,
        hash: String,
    },
    #[error("Object {hash} of type {object_type} not found")]
    ObjectNotFound {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when reading object {hash} of type {object_type}")]
    ReadObject {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Could not write object of type {object_type}")]
    WriteObject {
        object_type: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Object {hash} of type {object_type} is corrupt")]
    Corrupt {
        object_type: String,
        hash: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when accessing tag {name}")]
    Tag {
        name: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A valid operation attempted, but failed because it isn't supported
    /// by the particular backend.
    #[error("{0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A write-once, content-addressed object store.
///
/// The id of an object is the digest of the bytes handed to [`add`],
/// computed by the backend, which is what keeps the hash function a
/// backend parameter. The engine runs three independent instances of this
/// capability: one each for contents, nodes, and commits.
///
/// [`add`]: AppendOnlyStore::add
#[async_trait]
pub trait AppendOnlyStore: Send + Sync + Debug {
    /// A unique name that identifies this backend implementation.
    fn name(&self) -> &str;

    /// The length of ids in bytes.
    fn id_length(&self) -> usize;

    /// Writes `data` and returns its id.
    ///
    /// Adding equal bytes returns the same id and does not grow the
    /// store.
    async fn add(&self, data: &[u8]) -> BackendResult<Vec<u8>>;

    /// The bytes stored under `id`, or `None` for an unknown id. An
    /// unknown id is not an error.
    async fn read(&self, id: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    /// Whether `id` is stored.
    async fn mem(&self, id: &[u8]) -> BackendResult<bool>;

    /// Enumerates every stored id.
    ///
    /// Backends lacking the capability may return
    /// [`BackendError::Unsupported`]; the engine never depends on `list`
    /// for correctness.
    async fn list(&self) -> BackendResult<Vec<Vec<u8>>>;
}

/// The mutable name store: a map from tag names to commit ids.
///
/// `update` is an unconditional write; optimistic concurrency is layered
/// above, not here. For any single tag, watchers observe a linearization
/// of writes; there is no cross-tag ordering guarantee.
#[async_trait]
pub trait TagStore: Send + Sync + Debug {
    /// A unique name that identifies this backend implementation.
    fn name(&self) -> &str;

    async fn read(&self, tag: &TagName) -> BackendResult<Option<CommitId>>;

    async fn mem(&self, tag: &TagName) -> BackendResult<bool>;

    async fn update(&self, tag: &TagName, id: CommitId) -> BackendResult<()>;

    async fn remove(&self, tag: &TagName) -> BackendResult<()>;

    async fn list(&self) -> BackendResult<Vec<TagName>>;

    async fn dump(&self) -> BackendResult<Vec<(TagName, CommitId)>>;

    /// Subscribes to changes of `tag`. The stream yields the tag's value
    /// after each observed change; consecutive equal values may be
    /// coalesced, but no change is skipped. Dropping the stream cancels
    /// the subscription.
    async fn watch(&self, tag: &TagName) -> BackendResult<BoxStream<'static, Option<CommitId>>>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn step(value: &str) -> StepBuf {
        StepBuf::new(value).unwrap()
    }

    fn content_id(byte: u8) -> ContentId {
        ContentId::from_bytes(&[byte; 4])
    }

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes(&[byte; 4])
    }

    #[test]
    fn test_node_edges_are_disjoint_namespaces() {
        let node = Node::new(
            [(step("a"), content_id(1))],
            [(step("a"), node_id(2)), (step("b"), node_id(3))],
        );
        assert_eq!(node.contents(&step("a")), Some(&content_id(1)));
        assert_eq!(node.child(&step("a")), Some(&node_id(2)));
        assert_eq!(node.contents(&step("b")), None);
        assert_eq!(node.child(&step("b")), Some(&node_id(3)));
        assert_eq!(
            node.steps().map(Step::as_str).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_node_with_edges() {
        let node = Node::empty();
        assert!(node.is_empty());

        let node = node.with_contents(&step("x"), Some(content_id(1)));
        let node = node.with_child(&step("x"), Some(node_id(2)));
        assert_eq!(node.entries().len(), 2);

        // Replacing keeps a single edge per (step, kind).
        let node = node.with_contents(&step("x"), Some(content_id(9)));
        assert_eq!(node.contents(&step("x")), Some(&content_id(9)));
        assert_eq!(node.entries().len(), 2);

        // Removal of an absent edge is a no-op.
        let node = node.with_contents(&step("y"), None);
        assert_eq!(node.entries().len(), 2);

        let node = node.with_contents(&step("x"), None);
        let node = node.with_child(&step("x"), None);
        assert!(node.is_empty());
    }

    #[test]
    fn test_node_canonical_order() {
        let a = Node::new(
            [(step("b"), content_id(1)), (step("a"), content_id(2))],
            [(step("a"), node_id(3))],
        );
        let b = Node::new(
            [(step("a"), content_id(2)), (step("b"), content_id(1))],
            [(step("a"), node_id(3))],
        );
        assert_eq!(a, b);
        // Contents sorts before child under the same step.
        let kinds: Vec<_> = a.entries().map(|(s, v)| (s.as_str(), v.hex())).collect();
        assert_eq!(kinds[0].0, "a");
        assert_eq!(kinds[0].1, content_id(2).hex());
        assert_eq!(kinds[1].1, node_id(3).hex());
    }

    #[test]
    fn test_tag_name() {
        assert_eq!(TagName::master().as_str(), "master");
        assert!(TagName::new("topic-1").is_ok());
        assert!(TagName::new("").is_err());
        assert!(TagName::new("a/b").is_err());
    }
}
