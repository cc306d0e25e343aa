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

//! Keys and steps.
//!
//! A step is a single path element: a non-empty string without `/`. A key
//! is an ordered sequence of steps addressing a location in a node tree.
//! Keys are stored as `/`-joined strings; the empty string is the root key.
//! Steps are ordered lexicographically by bytes, and keys by their step
//! sequences.

#![expect(missing_docs)]

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::iter::FusedIterator;
use std::ops::Deref;

use ref_cast::RefCastCustom;
use ref_cast::ref_cast_custom;
use thiserror::Error;

/// Error from attempts to build a step or key out of an invalid string.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("Invalid key or step: {value:?}")]
pub struct InvalidKeyError {
    pub value: String,
}

fn is_valid_step_str(value: &str) -> bool {
    !value.is_empty() && !value.contains('/')
}

/// Owned key step.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepBuf {
    // Don't add more fields. Eq, Hash, and Ord must be compatible with the
    // borrowed Step type.
    value: String,
}

impl StepBuf {
    /// Wraps `value` as `StepBuf`.
    ///
    /// Returns an error if the input `value` is empty or contains `/`.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidKeyError> {
        let value: String = value.into();
        if is_valid_step_str(&value) {
            Ok(Self { value })
        } else {
            Err(InvalidKeyError { value })
        }
    }
}

/// Borrowed key step.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, RefCastCustom)]
#[repr(transparent)]
pub struct Step {
    value: str,
}

impl Step {
    /// Wraps `value` as `Step`.
    ///
    /// Returns an error if the input `value` is empty or contains `/`.
    pub fn new(value: &str) -> Result<&Self, InvalidKeyError> {
        if is_valid_step_str(value) {
            Ok(Self::new_unchecked(value))
        } else {
            Err(InvalidKeyError {
                value: value.to_string(),
            })
        }
    }

    #[ref_cast_custom]
    const fn new_unchecked(value: &str) -> &Self;

    /// Returns the underlying string representation.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Debug for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for StepBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <Step as Debug>::fmt(self, f)
    }
}

impl AsRef<Self> for Step {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsRef<Step> for StepBuf {
    fn as_ref(&self) -> &Step {
        self
    }
}

impl Borrow<Step> for StepBuf {
    fn borrow(&self) -> &Step {
        self
    }
}

impl Deref for StepBuf {
    type Target = Step;

    fn deref(&self) -> &Self::Target {
        Step::new_unchecked(&self.value)
    }
}

impl ToOwned for Step {
    type Owned = StepBuf;

    fn to_owned(&self) -> Self::Owned {
        StepBuf {
            value: self.value.to_owned(),
        }
    }
}

impl serde::Serialize for StepBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.value.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for StepBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

/// Owned key, a sequence of steps.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct KeyBuf {
    // Internal string representation, which is either empty (the root key)
    // or `/`-joined steps. Eq and Hash must be compatible with the borrowed
    // Key type.
    value: String,
}

/// Borrowed key, a sequence of steps.
#[derive(Eq, Hash, PartialEq, RefCastCustom)]
#[repr(transparent)]
pub struct Key {
    value: str,
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.value)
    }
}

impl Debug for KeyBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        <Key as Debug>::fmt(self, f)
    }
}

impl KeyBuf {
    /// The root key.
    pub const fn root() -> Self {
        Self {
            value: String::new(),
        }
    }

    /// Parses a `/`-joined string into a `KeyBuf`. The empty string is the
    /// root key.
    pub fn from_internal_string(value: impl Into<String>) -> Result<Self, InvalidKeyError> {
        let value: String = value.into();
        if value.is_empty() || value.split('/').all(is_valid_step_str) {
            Ok(Self { value })
        } else {
            Err(InvalidKeyError { value })
        }
    }

    /// Builds a key from a step sequence.
    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a Step>) -> Self {
        let mut key = Self::root();
        for step in steps {
            key.push(step);
        }
        key
    }

    /// Appends `step` to this key, in place.
    pub fn push(&mut self, step: &Step) {
        if !self.value.is_empty() {
            self.value.push('/');
        }
        self.value.push_str(step.as_str());
    }

    /// Consumes this key and returns the underlying string.
    pub fn into_internal_string(self) -> String {
        self.value
    }
}

impl Key {
    /// The root key.
    pub const fn root() -> &'static Self {
        Self::new_unchecked("")
    }

    /// Wraps a `/`-joined string as a `Key`. The empty string is the root
    /// key.
    pub fn from_internal_string(value: &str) -> Result<&Self, InvalidKeyError> {
        if value.is_empty() || value.split('/').all(is_valid_step_str) {
            Ok(Self::new_unchecked(value))
        } else {
            Err(InvalidKeyError {
                value: value.to_string(),
            })
        }
    }

    #[ref_cast_custom]
    const fn new_unchecked(value: &str) -> &Self;

    /// Returns the underlying string representation.
    pub fn as_internal_string(&self) -> &str {
        &self.value
    }

    /// Whether this is the root key.
    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether this key starts with the given `base` key.
    pub fn starts_with(&self, base: &Self) -> bool {
        self.strip_prefix(base).is_some()
    }

    /// Returns the remaining key after the given `base` key.
    pub fn strip_prefix(&self, base: &Self) -> Option<&Self> {
        if base.is_root() {
            Some(self)
        } else {
            let tail = self.value.strip_prefix(&base.value)?;
            if tail.is_empty() {
                Some(Self::new_unchecked(tail))
            } else {
                tail.strip_prefix('/').map(Self::new_unchecked)
            }
        }
    }

    /// Returns the key without its last step, which is `None` for the root
    /// key.
    pub fn parent(&self) -> Option<&Self> {
        self.split().map(|(parent, _)| parent)
    }

    /// Splits this key into the parent key and the last step.
    pub fn split(&self) -> Option<(&Self, &Step)> {
        if self.is_root() {
            return None;
        }
        match self.value.rsplit_once('/') {
            Some((parent, last)) => Some((Self::new_unchecked(parent), Step::new_unchecked(last))),
            None => Some((Self::root(), Step::new_unchecked(&self.value))),
        }
    }

    /// Iterates over the steps of this key.
    pub fn steps(&self) -> StepsIter<'_> {
        StepsIter { rest: &self.value }
    }

    /// This key and all its ancestors, up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |key| key.parent())
    }

    /// Appends `step` to this key.
    pub fn join(&self, step: &Step) -> KeyBuf {
        let mut key = self.to_owned();
        key.push(step);
        key
    }

    /// Appends all of `tail`'s steps to this key.
    pub fn concat(&self, tail: &Self) -> KeyBuf {
        let mut key = self.to_owned();
        for step in tail.steps() {
            key.push(step);
        }
        key
    }
}

/// Iterator over the steps of a key.
#[derive(Clone, Debug)]
pub struct StepsIter<'a> {
    rest: &'a str,
}

impl<'a> Iterator for StepsIter<'a> {
    type Item = &'a Step;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (step, rest) = match self.rest.split_once('/') {
            Some((step, rest)) => (step, rest),
            None => (self.rest, ""),
        };
        self.rest = rest;
        Some(Step::new_unchecked(step))
    }
}

impl DoubleEndedIterator for StepsIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (rest, step) = match self.rest.rsplit_once('/') {
            Some((rest, step)) => (rest, step),
            None => ("", self.rest),
        };
        self.rest = rest;
        Some(Step::new_unchecked(step))
    }
}

impl FusedIterator for StepsIter<'_> {}

impl AsRef<Self> for Key {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AsRef<Key> for KeyBuf {
    fn as_ref(&self) -> &Key {
        self
    }
}

impl Borrow<Key> for KeyBuf {
    fn borrow(&self) -> &Key {
        self
    }
}

impl Deref for KeyBuf {
    type Target = Key;

    fn deref(&self) -> &Self::Target {
        Key::new_unchecked(&self.value)
    }
}

impl ToOwned for Key {
    type Owned = KeyBuf;

    fn to_owned(&self) -> Self::Owned {
        KeyBuf {
            value: self.value.to_owned(),
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        // Compare by steps, not by the joined string, so that "a/b" sorts
        // before "a!" would if '!' < '/'.
        self.steps().cmp(other.steps())
    }
}

impl Ord for KeyBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        <Key as Ord>::cmp(self, other)
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialOrd for KeyBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(<Key as Ord>::cmp(self, other))
    }
}

impl serde::Serialize for KeyBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.value.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for KeyBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::from_internal_string(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: &str) -> &Key {
        Key::from_internal_string(value).unwrap()
    }

    fn step(value: &str) -> &Step {
        Step::new(value).unwrap()
    }

    #[test]
    fn test_validation() {
        assert!(Step::new("a").is_ok());
        assert!(Step::new("").is_err());
        assert!(Step::new("a/b").is_err());
        assert!(StepBuf::new("dotted.name").is_ok());

        assert!(Key::from_internal_string("").is_ok());
        assert!(Key::from_internal_string("a/b/c").is_ok());
        assert!(Key::from_internal_string("/a").is_err());
        assert!(Key::from_internal_string("a//b").is_err());
        assert!(Key::from_internal_string("a/").is_err());
    }

    #[test]
    fn test_split_join() {
        assert_eq!(Key::root().split(), None);
        assert_eq!(key("a").split(), Some((key(""), step("a"))));
        assert_eq!(key("a/b/c").split(), Some((key("a/b"), step("c"))));

        assert_eq!(Key::root().join(step("a")).as_internal_string(), "a");
        assert_eq!(key("a").join(step("b")).as_internal_string(), "a/b");
        assert_eq!(key("a").concat(key("b/c")).as_internal_string(), "a/b/c");
        assert_eq!(key("a").concat(key("")).as_internal_string(), "a");
    }

    #[test]
    fn test_steps_iter() {
        assert!(Key::root().steps().next().is_none());
        assert_eq!(
            key("a/b/c").steps().map(Step::as_str).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            key("a/b/c")
                .steps()
                .rev()
                .map(Step::as_str)
                .collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );
    }

    #[test]
    fn test_prefix() {
        assert!(key("a/b").starts_with(key("")));
        assert!(key("a/b").starts_with(key("a")));
        assert!(key("a/b").starts_with(key("a/b")));
        assert!(!key("a/b").starts_with(key("a/b/c")));
        assert!(!key("ab").starts_with(key("a")));

        assert_eq!(key("a/b").strip_prefix(key("a")), Some(key("b")));
        assert_eq!(key("a/b").strip_prefix(key("a/b")), Some(key("")));
        assert_eq!(key("ab").strip_prefix(key("a")), None);
    }

    #[test]
    fn test_order() {
        // Steps compare as sequences, not as joined strings: '!' sorts
        // before '/' as a byte, but "a!" is a single step.
        assert!(key("a") < key("a/b"));
        assert!(key("a/b") < key("a!"));
        assert!(key("a/b") < key("b"));
    }

    #[test]
    fn test_ancestors() {
        let ancestors: Vec<_> = key("a/b/c")
            .ancestors()
            .map(Key::as_internal_string)
            .collect();
        assert_eq!(ancestors, vec!["a/b/c", "a/b", "a", ""]);
    }
}
