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

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::BackendResult;
use crate::backend::ContentId;
use crate::backend::Node;
use crate::backend::NodeId;
use crate::contents::Contents;
use crate::key::Key;
use crate::key::KeyBuf;
use crate::store::Store;

#[derive(Debug)]
enum Override {
    /// Remove the contents edge at the key.
    Tombstone,
    /// Set the contents edge at the key.
    Contents(ContentId),
    /// Replace the whole subtree at the key; `None` prunes it.
    Child(Option<NodeId>),
}

/// Accumulates edits against a base node tree and writes the changed
/// nodes bottom-up, producing the new root id.
///
/// Intermediate nodes along edited paths are created as needed, and
/// nodes left without edges are pruned from their parents.
#[derive(Debug)]
pub struct NodeBuilder<C: Contents> {
    store: Arc<Store<C>>,
    base_node_id: Option<NodeId>,
    overrides: BTreeMap<KeyBuf, Override>,
}

impl<C: Contents> NodeBuilder<C> {
    /// Starts from the tree rooted at `base_node_id`, or from an empty
    /// tree.
    pub fn new(store: Arc<Store<C>>, base_node_id: Option<NodeId>) -> Self {
        let overrides = BTreeMap::new();
        Self {
            store,
            base_node_id,
            overrides,
        }
    }

    pub fn store(&self) -> &Store<C> {
        self.store.as_ref()
    }

    pub fn set_contents(&mut self, key: KeyBuf, id: ContentId) {
        assert!(!key.is_root());
        self.overrides.insert(key, Override::Contents(id));
    }

    pub fn remove_contents(&mut self, key: KeyBuf) {
        assert!(!key.is_root());
        self.overrides.insert(key, Override::Tombstone);
    }

    pub fn set_or_remove_contents(&mut self, key: KeyBuf, id: Option<ContentId>) {
        match id {
            Some(id) => self.set_contents(key, id),
            None => self.remove_contents(key),
        }
    }

    /// Replaces the subtree at `key` wholesale. `None` prunes it.
    pub fn set_child(&mut self, key: KeyBuf, id: Option<NodeId>) {
        assert!(!key.is_root());
        self.overrides.insert(key, Override::Child(id));
    }

    /// Writes every changed node, children before parents, and returns
    /// the new root id. The root node is written even when empty.
    pub async fn write(self) -> BackendResult<NodeId> {
        let mut dirs_to_write = self.base_dirs().await?;

        // Update entries in parent dirs for the overrides.
        for (key, edit) in &self.overrides {
            let (dir, basename) = key.split().unwrap();
            let node = dirs_to_write.get_mut(dir).unwrap();
            *node = match edit {
                Override::Contents(id) => node.with_contents(basename, Some(id.clone())),
                Override::Tombstone => node.with_contents(basename, None),
                Override::Child(id) => node.with_child(basename, id.clone()),
            };
        }

        // Write dirs in reverse lexicographical order, starting with dirs
        // without children.
        let store = &self.store;
        while let Some((dir, node)) = dirs_to_write.pop_last() {
            if let Some((parent, basename)) = dir.split() {
                let parent_node = dirs_to_write.get_mut(parent).unwrap();
                if node.is_empty() {
                    *parent_node = parent_node.with_child(basename, None);
                } else {
                    let id = store.add_node_async(node).await?;
                    *parent_node = parent_node.with_child(basename, Some(id));
                }
            } else {
                // We're writing the root node. Write it even if empty.
                // Return its id.
                assert!(dirs_to_write.is_empty());
                return store.add_node_async(node).await;
            }
        }

        unreachable!("dirs_to_write must contain the root dir");
    }

    /// Loads the node at every dir touched by an override, from the root
    /// down. Missing dirs start out empty.
    async fn base_dirs(&self) -> BackendResult<BTreeMap<KeyBuf, Node>> {
        let mut dirs = BTreeMap::new();
        let root = match &self.base_node_id {
            Some(id) => (*self.store.get_node_async(id).await?).clone(),
            None => Node::empty(),
        };
        dirs.insert(KeyBuf::root(), root);

        for key in self.overrides.keys() {
            let dir = key.parent().unwrap();
            let mut missing: Vec<&Key> = dir
                .ancestors()
                .take_while(|ancestor| !dirs.contains_key(*ancestor))
                .collect();
            // Fill in from the shallowest missing dir down.
            while let Some(ancestor) = missing.pop() {
                let (parent, basename) = ancestor.split().unwrap();
                let node = match dirs[parent].child(basename) {
                    Some(id) => (*self.store.get_node_async(id).await?).clone(),
                    None => Node::empty(),
                };
                dirs.insert(ancestor.to_owned(), node);
            }
        }
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use pollster::FutureExt as _;

    use super::*;
    use crate::graph;

    fn key(value: &str) -> KeyBuf {
        KeyBuf::from_internal_string(value).unwrap()
    }

    fn build(
        store: &Arc<Store<String>>,
        base: Option<NodeId>,
        edits: impl FnOnce(&mut NodeBuilder<String>),
    ) -> NodeId {
        let mut builder = NodeBuilder::new(store.clone(), base);
        edits(&mut builder);
        builder.write().block_on().unwrap()
    }

    fn value_at(store: &Arc<Store<String>>, root: &NodeId, at: &str) -> Option<String> {
        let content_id = graph::find_in_node(store.as_ref(), root, &key(at))
            .block_on()
            .unwrap()?;
        Some(store.get_contents(&content_id).unwrap())
    }

    #[test]
    fn test_write_nested_keys() {
        let store: Arc<Store<String>> = Store::in_memory();
        let v1 = store.add_contents(&"1".to_string()).unwrap();
        let v2 = store.add_contents(&"2".to_string()).unwrap();

        let root = build(&store, None, |builder| {
            builder.set_contents(key("a/b"), v1);
            builder.set_contents(key("a/c/d"), v2);
        });

        assert_eq!(value_at(&store, &root, "a/b"), Some("1".to_string()));
        assert_eq!(value_at(&store, &root, "a/c/d"), Some("2".to_string()));
        assert_eq!(value_at(&store, &root, "a/c"), None);
    }

    #[test]
    fn test_removal_prunes_empty_dirs() {
        let store: Arc<Store<String>> = Store::in_memory();
        let v1 = store.add_contents(&"1".to_string()).unwrap();
        let v2 = store.add_contents(&"2".to_string()).unwrap();

        let root = build(&store, None, |builder| {
            builder.set_contents(key("a/b/c"), v1);
            builder.set_contents(key("x"), v2);
        });
        let root = build(&store, Some(root), |builder| {
            builder.remove_contents(key("a/b/c"));
        });

        // The whole "a" chain is gone; "x" is untouched.
        let node = store.get_node(&root).unwrap();
        assert_eq!(node.entries().len(), 1);
        assert_eq!(value_at(&store, &root, "x"), Some("2".to_string()));
    }

    #[test]
    fn test_no_edits_still_writes_root() {
        let store: Arc<Store<String>> = Store::in_memory();
        let builder = NodeBuilder::new(store.clone(), None);
        let root = builder.write().block_on().unwrap();
        assert!(store.get_node(&root).unwrap().is_empty());
    }

    #[test]
    fn test_graft_subtree() {
        let store: Arc<Store<String>> = Store::in_memory();
        let v1 = store.add_contents(&"1".to_string()).unwrap();

        let subtree = build(&store, None, |builder| {
            builder.set_contents(key("leaf"), v1);
        });
        let root = build(&store, None, |builder| {
            builder.set_child(key("grafted/here"), Some(subtree));
        });

        assert_eq!(
            value_at(&store, &root, "grafted/here/leaf"),
            Some("1".to_string())
        );
    }
}
