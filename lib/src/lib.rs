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

//! Library for Silt - a distributed, history-preserving key-value store.
//!
//! Silt stores user-defined contents in content-addressed append-only
//! stores, organizes them into directory-like node trees, records history
//! as a DAG of commits, and names history tips with mutable tags. On top
//! of that substrate it provides three-way merging with pluggable conflict
//! resolution, transactional staging views, and slice export/import for
//! partial replication between stores.

#![warn(missing_docs)]

pub mod backend;
pub mod branch;
pub mod config;
pub mod content_hash;
pub mod contents;
pub mod graph;
pub mod hex_util;
pub mod key;
pub mod mem_store;
pub mod merge;
pub mod node_builder;
pub mod object_id;
pub mod simple_store;
pub mod slice;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod view;
pub mod watch;
