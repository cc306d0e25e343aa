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

//! A simple on-disk backend: one file per object, one file per tag.
//!
//! Objects land under a directory named by their hex id, written through
//! a temp file and an atomic rename, so a crashed writer leaves at worst
//! an orphaned temp file. Tags are single files holding the commit id in
//! hex. Not compatible with any other tool's object format.

#![expect(missing_docs)]

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tempfile::NamedTempFile;
use tempfile::PersistError;

use crate::backend::AppendOnlyStore;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::backend::TagName;
use crate::backend::TagStore;
use crate::config::StoreConfig;
use crate::content_hash::BLAKE2B_HASH_LENGTH;
use crate::content_hash::blake2b_hash;
use crate::hex_util;
use crate::object_id::ObjectId as _;
use crate::watch::WatchRegistry;

fn to_other_err(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> BackendError {
    BackendError::Other(err.into())
}

fn to_tag_err(tag: &TagName) -> impl Fn(io::Error) -> BackendError {
    let name = tag.to_string();
    move |err| BackendError::Tag {
        name: name.clone(),
        source: Box::new(err),
    }
}

// Object files are named by the digest of their content, so two writers
// can only ever race on identical bytes. The content is flushed before
// the rename so the name never points at a partial write. If the rename
// itself is refused (Windows will not replace a file another handle has
// open), the file already at the target is the write we wanted.
fn persist_object(temp_file: NamedTempFile, target: &Path) -> io::Result<()> {
    temp_file.as_file().sync_data()?;
    match temp_file.persist(target) {
        Ok(_) => Ok(()),
        Err(PersistError { error: _, file: _ }) if target.exists() => Ok(()),
        Err(PersistError { error, file: _ }) => Err(error),
    }
}

/// An append-only store writing one file per object.
#[derive(Debug)]
pub struct SimpleAppendStore {
    path: PathBuf,
}

impl SimpleAppendStore {
    pub fn name() -> &'static str {
        "simple"
    }

    /// Creates the backing directory and returns the store.
    pub fn init(path: &Path) -> BackendResult<Self> {
        fs::create_dir_all(path).map_err(to_other_err)?;
        Ok(Self::load(path))
    }

    /// Opens an existing backing directory.
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn object_path(&self, id: &[u8]) -> PathBuf {
        self.path.join(hex_util::encode_hex(id))
    }
}

#[async_trait]
impl AppendOnlyStore for SimpleAppendStore {
    fn name(&self) -> &str {
        Self::name()
    }

    fn id_length(&self) -> usize {
        BLAKE2B_HASH_LENGTH
    }

    async fn add(&self, data: &[u8]) -> BackendResult<Vec<u8>> {
        let id = blake2b_hash(data);
        let target = self.object_path(&id);
        if target.exists() {
            return Ok(id);
        }
        let temp_file = NamedTempFile::new_in(&self.path).map_err(to_other_err)?;
        temp_file.as_file().write_all(data).map_err(|err| {
            BackendError::WriteObject {
                object_type: "object",
                source: Box::new(err),
            }
        })?;
        persist_object(temp_file, &target).map_err(|err| BackendError::WriteObject {
            object_type: "object",
            source: Box::new(err),
        })?;
        Ok(id)
    }

    async fn read(&self, id: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        match fs::read(self.object_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BackendError::ReadObject {
                object_type: "object".to_string(),
                hash: hex_util::encode_hex(id),
                source: Box::new(err),
            }),
        }
    }

    async fn mem(&self, id: &[u8]) -> BackendResult<bool> {
        Ok(self.object_path(id).exists())
    }

    async fn list(&self) -> BackendResult<Vec<Vec<u8>>> {
        let entries = fs::read_dir(&self.path).map_err(to_other_err)?;
        let mut ids = vec![];
        for entry in entries {
            let entry = entry.map_err(to_other_err)?;
            // Temp files and other strays don't have hex names.
            if let Some(id) = entry.file_name().to_str().and_then(hex_util::decode_hex) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// A tag store writing one file per tag, holding the commit id in hex.
#[derive(Debug)]
pub struct SimpleTagStore {
    path: PathBuf,
    watchers: Arc<WatchRegistry>,
}

impl SimpleTagStore {
    pub fn name() -> &'static str {
        "simple"
    }

    /// Creates the backing directory and returns the store.
    pub fn init(path: &Path) -> BackendResult<Self> {
        fs::create_dir_all(path).map_err(to_other_err)?;
        Ok(Self::load(path))
    }

    /// Opens an existing backing directory.
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            watchers: Arc::new(WatchRegistry::new()),
        }
    }

    /// Opens the tag store under the configured `root` directory, wiring
    /// the directory-watch hook when the `disk` key is set.
    pub fn from_config(config: &StoreConfig) -> BackendResult<Self> {
        let root = config
            .root()
            .map_err(|err| BackendError::Other(Box::new(err)))?
            .ok_or_else(|| {
                BackendError::Other("config key \"root\" is required for on-disk stores".into())
            })?;
        let store = Self::init(&Path::new(root).join("tags"))?;
        if config
            .disk()
            .map_err(|err| BackendError::Other(Box::new(err)))?
        {
            store.enable_disk_watch();
        }
        Ok(store)
    }

    /// The registry fanning out this store's tag changes.
    pub fn watch_registry(&self) -> &Arc<WatchRegistry> {
        &self.watchers
    }

    /// Wires this store's registry to the process-global directory-watch
    /// hook, so that tag files changed by other processes notify local
    /// watchers. No-op unless a hook is registered.
    pub fn enable_disk_watch(&self) {
        let path = self.path.clone();
        self.watchers.listen_dir(
            &self.path,
            |file_name| TagName::new(file_name).ok(),
            move |tag| {
                let raw = fs::read_to_string(path.join(tag.as_str())).ok()?;
                CommitId::try_from_hex(raw.trim())
            },
        );
    }

    fn tag_path(&self, tag: &TagName) -> PathBuf {
        self.path.join(tag.as_str())
    }

    fn read_sync(&self, tag: &TagName) -> BackendResult<Option<CommitId>> {
        let raw = match fs::read_to_string(self.tag_path(tag)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(to_tag_err(tag)(err)),
        };
        let id = CommitId::try_from_hex(raw.trim()).ok_or_else(|| BackendError::Corrupt {
            object_type: "tag".to_string(),
            hash: tag.to_string(),
            source: format!("not a hex commit id: {raw:?}").into(),
        })?;
        Ok(Some(id))
    }
}

#[async_trait]
impl TagStore for SimpleTagStore {
    fn name(&self) -> &str {
        Self::name()
    }

    async fn read(&self, tag: &TagName) -> BackendResult<Option<CommitId>> {
        self.read_sync(tag)
    }

    async fn mem(&self, tag: &TagName) -> BackendResult<bool> {
        Ok(self.tag_path(tag).exists())
    }

    async fn update(&self, tag: &TagName, id: CommitId) -> BackendResult<()> {
        // Unlike objects, a tag file is replaced wholesale: the rename
        // makes readers see either the previous commit id or the new
        // one, never a torn write.
        let temp_file = NamedTempFile::new_in(&self.path).map_err(to_tag_err(tag))?;
        temp_file
            .as_file()
            .write_all(id.hex().as_bytes())
            .map_err(to_tag_err(tag))?;
        temp_file.as_file().sync_data().map_err(to_tag_err(tag))?;
        temp_file
            .persist(self.tag_path(tag))
            .map_err(|PersistError { error, file: _ }| to_tag_err(tag)(error))?;
        self.watchers.notify(tag, Some(id)).await;
        Ok(())
    }

    async fn remove(&self, tag: &TagName) -> BackendResult<()> {
        match fs::remove_file(self.tag_path(tag)) {
            Ok(()) => {
                self.watchers.notify(tag, None).await;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(to_tag_err(tag)(err)),
        }
    }

    async fn list(&self) -> BackendResult<Vec<TagName>> {
        let entries = fs::read_dir(&self.path).map_err(to_other_err)?;
        let mut tags = vec![];
        for entry in entries {
            let entry = entry.map_err(to_other_err)?;
            if let Some(tag) = entry.file_name().to_str().and_then(|name| {
                // Skip temp files left by a crashed writer.
                TagName::new(name).ok().filter(|_| !name.starts_with('.'))
            }) {
                tags.push(tag);
            }
        }
        tags.sort();
        Ok(tags)
    }

    async fn dump(&self) -> BackendResult<Vec<(TagName, CommitId)>> {
        let mut dump = vec![];
        for tag in self.list().await? {
            if let Some(id) = self.read_sync(&tag)? {
                dump.push((tag, id));
            }
        }
        Ok(dump)
    }

    async fn watch(&self, tag: &TagName) -> BackendResult<BoxStream<'static, Option<CommitId>>> {
        let initial = self.read_sync(tag)?;
        Ok(self.watchers.watch(tag, initial))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use pollster::FutureExt as _;

    use super::*;

    #[test]
    fn test_persist_object_over_identical_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("object");
        fs::write(&target, b"bytes").unwrap();

        let mut temp_file = NamedTempFile::new_in(temp_dir.path()).unwrap();
        temp_file.write_all(b"bytes").unwrap();
        persist_object(temp_file, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"bytes");
    }

    #[test]
    fn test_object_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SimpleAppendStore::init(temp_dir.path()).unwrap();

        let id = store.add(b"some value").block_on().unwrap();
        assert_eq!(store.add(b"some value").block_on().unwrap(), id);
        assert_eq!(
            store.read(&id).block_on().unwrap(),
            Some(b"some value".to_vec())
        );
        assert!(store.mem(&id).block_on().unwrap());
        assert_eq!(store.list().block_on().unwrap(), vec![id]);
    }

    #[test]
    fn test_unknown_object_is_absent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SimpleAppendStore::init(temp_dir.path()).unwrap();
        assert_eq!(store.read(&[0; 64]).block_on().unwrap(), None);
    }

    #[test]
    fn test_tag_store_from_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().set(
            crate::config::CONFIG_ROOT,
            crate::config::ConfigValue::Str(temp_dir.path().to_str().unwrap().to_string()),
        );
        let store = SimpleTagStore::from_config(&config).unwrap();
        let id = CommitId::from_bytes(&[3; 4]);
        store.update(&TagName::master(), id.clone()).block_on().unwrap();
        assert_eq!(
            store.read(&TagName::master()).block_on().unwrap(),
            Some(id)
        );

        assert!(SimpleTagStore::from_config(&StoreConfig::new()).is_err());
    }

    #[test]
    fn test_tag_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SimpleTagStore::init(temp_dir.path()).unwrap();
        let tag = TagName::master();
        let id = CommitId::from_bytes(&[7; 4]);

        store.update(&tag, id.clone()).block_on().unwrap();
        assert_eq!(store.read(&tag).block_on().unwrap(), Some(id.clone()));

        // Reload sees the same state.
        let reloaded = SimpleTagStore::load(temp_dir.path());
        assert_eq!(reloaded.read(&tag).block_on().unwrap(), Some(id.clone()));
        assert_eq!(reloaded.dump().block_on().unwrap(), vec![(tag.clone(), id)]);

        store.remove(&tag).block_on().unwrap();
        assert_eq!(store.read(&tag).block_on().unwrap(), None);
        // Removing an absent tag is fine.
        store.remove(&tag).block_on().unwrap();
    }
}
