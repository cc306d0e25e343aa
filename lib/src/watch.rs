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

//! Watch registry: per-tag subscriber sets with notify-on-change.
//!
//! Each subscription is an independent bounded channel. A slow consumer
//! does not lose events; a full buffer suspends the producer instead.
//! Ordering is per tag only.

#![expect(missing_docs)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use futures::SinkExt as _;
use futures::StreamExt as _;
use futures::channel::mpsc;
use futures::future;
use futures::stream::BoxStream;
use pollster::FutureExt as _;

use crate::backend::CommitId;
use crate::backend::TagName;

const SUBSCRIBER_BUFFER: usize = 16;

/// Signature of the process-global directory-watch hook.
///
/// The hook receives a directory to watch and a callback to invoke with
/// the name of any file that changes inside it.
pub type DirListener = Box<dyn Fn(&Path, Box<dyn Fn(&str) + Send + Sync>) + Send + Sync>;

static DIR_LISTENER: RwLock<Option<DirListener>> = RwLock::new(None);

/// Registers the hook invoked by [`WatchRegistry::listen_dir`]. The
/// default is a no-op: without a registered hook, directory polling is
/// disabled.
pub fn set_dir_listener(listener: DirListener) {
    *DIR_LISTENER.write().unwrap() = Some(listener);
}

/// Fans out tag changes to subscribers.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    subscribers: Mutex<HashMap<TagName, Vec<mpsc::Sender<Option<CommitId>>>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Delivers `value` to every subscriber of `tag`.
    ///
    /// Suspends while any subscriber's buffer is full. Subscribers that
    /// dropped their stream are pruned.
    pub async fn notify(&self, tag: &TagName, value: Option<CommitId>) {
        let senders: Vec<_> = {
            let subscribers = self.subscribers.lock().unwrap();
            match subscribers.get(tag) {
                Some(senders) => senders.clone(),
                None => return,
            }
        };
        for mut sender in senders {
            // A send error means the subscriber is gone; pruned below.
            let _: Result<_, _> = sender.send(value.clone()).await;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(tag) {
            senders.retain(|sender| !sender.is_closed());
            if senders.is_empty() {
                subscribers.remove(tag);
            }
        }
    }

    /// Subscribes to `tag`. The stream yields the tag's value after each
    /// change, starting from (but not including) `initial`; writing the
    /// value the subscriber last saw is not a change.
    pub fn watch(
        &self,
        tag: &TagName,
        initial: Option<CommitId>,
    ) -> BoxStream<'static, Option<CommitId>> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .lock()
            .unwrap()
            .entry(tag.clone())
            .or_default()
            .push(sender);
        receiver
            .scan(initial, |last, value| {
                let changed = *last != value;
                last.clone_from(&value);
                future::ready(Some(changed.then_some(value)))
            })
            .filter_map(future::ready)
            .boxed()
    }

    /// Drives notifications from the directory-watch hook: a change to a
    /// file under `path` is parsed into a tag with `key_parser`, its
    /// current value loaded with `value_loader`, and the result fanned
    /// out.
    ///
    /// Does nothing unless a hook was registered with
    /// [`set_dir_listener`].
    pub fn listen_dir(
        self: &Arc<Self>,
        path: &Path,
        key_parser: impl Fn(&str) -> Option<TagName> + Send + Sync + 'static,
        value_loader: impl Fn(&TagName) -> Option<CommitId> + Send + Sync + 'static,
    ) {
        let registry = Arc::clone(self);
        let on_change = Box::new(move |file_name: &str| {
            if let Some(tag) = key_parser(file_name) {
                let value = value_loader(&tag);
                registry.notify(&tag, value).block_on();
            }
        });
        if let Some(listener) = &*DIR_LISTENER.read().unwrap() {
            listener(path, on_change);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;
    use pollster::FutureExt as _;

    use super::*;

    fn commit_id(byte: u8) -> CommitId {
        CommitId::from_bytes(&[byte; 4])
    }

    #[test]
    fn test_watch_observes_updates() {
        let registry = WatchRegistry::new();
        let tag = TagName::master();
        let mut watcher = registry.watch(&tag, None);

        registry.notify(&tag, Some(commit_id(1))).block_on();
        registry.notify(&tag, Some(commit_id(2))).block_on();
        registry.notify(&tag, None).block_on();

        assert_eq!(watcher.next().block_on(), Some(Some(commit_id(1))));
        assert_eq!(watcher.next().block_on(), Some(Some(commit_id(2))));
        assert_eq!(watcher.next().block_on(), Some(None));
    }

    #[test]
    fn test_watch_skips_redundant_writes() {
        let registry = WatchRegistry::new();
        let tag = TagName::master();
        let mut watcher = registry.watch(&tag, Some(commit_id(1)));

        // Writing the value the subscriber already saw is not a change.
        registry.notify(&tag, Some(commit_id(1))).block_on();
        registry.notify(&tag, Some(commit_id(2))).block_on();

        assert_eq!(watcher.next().block_on(), Some(Some(commit_id(2))));
    }

    #[test]
    fn test_watchers_are_independent() {
        let registry = WatchRegistry::new();
        let tag = TagName::master();
        let mut early = registry.watch(&tag, None);

        registry.notify(&tag, Some(commit_id(1))).block_on();
        let mut late = registry.watch(&tag, Some(commit_id(1)));
        registry.notify(&tag, Some(commit_id(2))).block_on();

        assert_eq!(early.next().block_on(), Some(Some(commit_id(1))));
        assert_eq!(early.next().block_on(), Some(Some(commit_id(2))));
        assert_eq!(late.next().block_on(), Some(Some(commit_id(2))));
    }

    #[test]
    fn test_dropped_watcher_is_pruned() {
        let registry = WatchRegistry::new();
        let tag = TagName::master();
        let watcher = registry.watch(&tag, None);
        drop(watcher);

        registry.notify(&tag, Some(commit_id(1))).block_on();
        assert!(registry.subscribers.lock().unwrap().is_empty());
    }
}
