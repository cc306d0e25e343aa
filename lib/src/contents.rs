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

//! The user-supplied contents capability.
//!
//! The store is generic over the values it keeps at the leaves of node
//! trees. A contents type supplies its canonical serialization (the
//! value's id is the digest of those bytes), a JSON projection for
//! debugging and export tooling, and its three-way merge.

use std::fmt::Debug;

use thiserror::Error;

use crate::merge::MergeResult;
use crate::merge::merge_counter;
use crate::merge::merge_default;

/// Error from decoding bytes or JSON that do not represent a valid value.
#[derive(Debug, Error)]
#[error("Invalid contents: {message}")]
pub struct InvalidContentsError {
    /// What was wrong with the input.
    pub message: String,
}

impl InvalidContentsError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A user-defined value type storable at the leaves of the tree.
///
/// Serialization must be canonical: equal values produce equal bytes, and
/// decoding then re-encoding any emitted byte string reproduces it
/// exactly. Ids depend on it.
pub trait Contents: Clone + Debug + Eq + Ord + Send + Sync + 'static {
    /// Canonical serialization of this value.
    fn to_bytes(&self) -> Vec<u8>;

    /// Decodes a value from its canonical serialization.
    fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidContentsError>;

    /// Advisory size of the serialized form, for buffer sizing. Zero means
    /// unknown.
    fn size_hint(&self) -> usize {
        0
    }

    /// Three-way merge of this value against a common ancestor.
    ///
    /// The default keeps a value only one side changed and conflicts
    /// otherwise.
    fn merge(old: &Self, a: &Self, b: &Self) -> MergeResult<Self> {
        merge_default(old, a, b)
    }

    /// JSON projection of this value.
    fn to_json(&self) -> serde_json::Value;

    /// Decodes a value from its JSON projection.
    fn from_json(value: &serde_json::Value) -> Result<Self, InvalidContentsError>;
}

impl Contents for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidContentsError> {
        Self::from_utf8(bytes.to_vec())
            .map_err(|err| InvalidContentsError::new(format!("not UTF-8: {err}")))
    }

    fn size_hint(&self) -> usize {
        self.len()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::String(self.clone())
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, InvalidContentsError> {
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| InvalidContentsError::new("expected a JSON string"))
    }
}

/// A mergeable counter.
///
/// Concurrent updates combine by summing both sides' increments over the
/// ancestor, so counter merges never conflict.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Counter(pub i64);

impl Contents for Counter {
    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidContentsError> {
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| InvalidContentsError::new("counter must be 8 bytes"))?;
        Ok(Self(i64::from_be_bytes(bytes)))
    }

    fn size_hint(&self) -> usize {
        8
    }

    fn merge(old: &Self, a: &Self, b: &Self) -> MergeResult<Self> {
        Ok(Self(merge_counter(old.0, a.0, b.0)))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Number(self.0.into())
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, InvalidContentsError> {
        value
            .as_i64()
            .map(Self)
            .ok_or_else(|| InvalidContentsError::new("expected a JSON integer"))
    }
}
