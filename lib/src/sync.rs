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

//! The thin driver over the remote capability.
//!
//! The wire protocol lives outside the core: a [`Remote`] implementation
//! moves objects between stores however it likes and reports resulting
//! heads as opaque hex strings. This module only resolves those reports
//! into commit ids and feeds them to the branch engine.

#![expect(missing_docs)]

use std::fmt::Debug;

use async_trait::async_trait;
use pollster::FutureExt as _;
use tracing::debug;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::CommitId;
use crate::branch::Branch;
use crate::branch::MergeOutcome;
use crate::config::StoreConfig;
use crate::contents::Contents;

/// The remote capability: two methods, heads as opaque hex strings.
#[async_trait]
pub trait Remote: Send + Sync + Debug {
    /// Fetches from `uri`, bounded by `depth`, and reports the resulting
    /// head if the remote has one.
    async fn fetch(
        &self,
        config: &StoreConfig,
        depth: Option<usize>,
        uri: &str,
    ) -> BackendResult<Option<String>>;

    /// Pushes to `uri`, bounded by `depth`, and reports the remote's
    /// resulting head if it has one.
    async fn push(
        &self,
        config: &StoreConfig,
        depth: Option<usize>,
        uri: &str,
    ) -> BackendResult<Option<String>>;
}

fn parse_head(hex: &str) -> BackendResult<CommitId> {
    CommitId::try_from_hex(hex)
        .ok_or_else(|| BackendError::Other(format!("remote reported a non-hex head: {hex:?}").into()))
}

/// Fetches from the remote and resolves the new head: the remote's
/// reported head if any, else the branch matching this handle's tag, else
/// any known ref.
pub async fn fetch_async<C: Contents>(
    branch: &Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
) -> BackendResult<Option<CommitId>> {
    if let Some(hex) = remote.fetch(config, depth, uri).await? {
        let head = parse_head(&hex)?;
        debug!(uri, head = %head, "fetched remote head");
        return Ok(Some(head));
    }
    if let Some(tag) = branch.tag() {
        if let Some(head) = branch.tag_store().read(tag).await? {
            return Ok(Some(head));
        }
    }
    Ok(branch
        .tag_store()
        .dump()
        .await?
        .into_iter()
        .map(|(_, id)| id)
        .next())
}

pub fn fetch<C: Contents>(
    branch: &Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
) -> BackendResult<Option<CommitId>> {
    fetch_async(branch, remote, config, uri, depth).block_on()
}

/// Fetches and integrates the result: a three-way merge when `merge` is
/// set, an unconditional head update otherwise. `None` when the fetch
/// resolved no head.
pub async fn pull_async<C: Contents>(
    branch: &mut Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
    merge: bool,
) -> BackendResult<Option<MergeOutcome>> {
    let Some(head) = fetch_async(branch, remote, config, uri, depth).await? else {
        return Ok(None);
    };
    let outcome = if merge {
        branch.merge_head_async(head).await?
    } else {
        branch.update_head_async(head.clone()).await?;
        MergeOutcome::FastForwarded(head)
    };
    Ok(Some(outcome))
}

pub fn pull<C: Contents>(
    branch: &mut Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
    merge: bool,
) -> BackendResult<Option<MergeOutcome>> {
    pull_async(branch, remote, config, uri, depth, merge).block_on()
}

/// Pushes to the remote and reports its resulting head, if any.
pub async fn push_async<C: Contents>(
    _branch: &Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
) -> BackendResult<Option<CommitId>> {
    match remote.push(config, depth, uri).await? {
        Some(hex) => {
            let head = parse_head(&hex)?;
            debug!(uri, head = %head, "pushed to remote");
            Ok(Some(head))
        }
        None => Ok(None),
    }
}

pub fn push<C: Contents>(
    branch: &Branch<C>,
    remote: &dyn Remote,
    config: &StoreConfig,
    uri: &str,
    depth: Option<usize>,
) -> BackendResult<Option<CommitId>> {
    push_async(branch, remote, config, uri, depth).block_on()
}
