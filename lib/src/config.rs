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

//! Store configuration.
//!
//! A configuration is an ordered dictionary of tagged values. Backends
//! inject their own keys and read them back through the typed accessors;
//! keys the core does not recognize pass through unchanged.

use std::collections::BTreeMap;

use thiserror::Error;

/// Key for the backing directory of on-disk backends.
pub const CONFIG_ROOT: &str = "root";
/// Key suppressing working-tree materialization. Defaults to true.
pub const CONFIG_BARE: &str = "bare";
/// Key enabling disk-backed watch via the directory listener. Defaults to
/// false.
pub const CONFIG_DISK: &str = "disk";

/// A tagged configuration value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigValue {
    /// A boolean flag.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A string.
    Str(String),
}

/// Error from a typed configuration lookup.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigGetError {
    /// The key exists but holds a value of another type.
    #[error("Config key {key} is not a {expected}")]
    TypeMismatch {
        /// The looked-up key.
        key: String,
        /// The requested type.
        expected: &'static str,
    },
}

/// An ordered dictionary of named configuration values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl StoreConfig {
    /// An empty configuration; every recognized key is at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the configuration for chaining.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// The raw value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// The boolean value of `key`, if set.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigGetError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(ConfigGetError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
            }),
        }
    }

    /// The integer value of `key`, if set.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConfigGetError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(value)) => Ok(Some(*value)),
            Some(_) => Err(ConfigGetError::TypeMismatch {
                key: key.to_string(),
                expected: "int",
            }),
        }
    }

    /// The string value of `key`, if set.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>, ConfigGetError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Str(value)) => Ok(Some(value)),
            Some(_) => Err(ConfigGetError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// The backing directory for on-disk backends.
    pub fn root(&self) -> Result<Option<&str>, ConfigGetError> {
        self.get_str(CONFIG_ROOT)
    }

    /// Whether working-tree materialization is suppressed.
    pub fn bare(&self) -> Result<bool, ConfigGetError> {
        Ok(self.get_bool(CONFIG_BARE)?.unwrap_or(true))
    }

    /// Whether disk-backed watching is enabled.
    pub fn disk(&self) -> Result<bool, ConfigGetError> {
        Ok(self.get_bool(CONFIG_DISK)?.unwrap_or(false))
    }

    /// Iterates over all `(key, value)` entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new();
        assert_eq!(config.root(), Ok(None));
        assert_eq!(config.bare(), Ok(true));
        assert_eq!(config.disk(), Ok(false));
    }

    #[test]
    fn test_typed_accessors() {
        let config = StoreConfig::new()
            .set(CONFIG_ROOT, ConfigValue::Str("/tmp/store".to_string()))
            .set(CONFIG_BARE, ConfigValue::Bool(false))
            .set("depth", ConfigValue::Int(3));
        assert_eq!(config.root(), Ok(Some("/tmp/store")));
        assert_eq!(config.bare(), Ok(false));
        assert_eq!(config.get_int("depth"), Ok(Some(3)));
        assert_eq!(
            config.get_bool(CONFIG_ROOT),
            Err(ConfigGetError::TypeMismatch {
                key: "root".to_string(),
                expected: "bool",
            })
        );
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let config = StoreConfig::new().set("backend.shard-bits", ConfigValue::Int(8));
        let entries: Vec<_> = config.iter().collect();
        assert_eq!(
            entries,
            vec![("backend.shard-bits", &ConfigValue::Int(8))]
        );
    }
}
