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

//! Digests over canonical serializations.
//!
//! An object's id is the digest of its canonical byte serialization, so
//! equal values always map to equal ids. The digest function itself is a
//! backend parameter; this module provides the Blake2b-512 instance used by
//! the shipped backends.

use blake2::Blake2b512;
use digest::Digest as _;

/// Width in bytes of ids produced by [`blake2b_hash`].
pub const BLAKE2B_HASH_LENGTH: usize = 64;

/// Digests `data` with Blake2b-512.
pub fn blake2b_hash(data: impl AsRef<[u8]>) -> Vec<u8> {
    let mut hasher = Blake2b512::new();
    hasher.update(data.as_ref());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_determinism() {
        let a = blake2b_hash(b"hello");
        let b = blake2b_hash(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), BLAKE2B_HASH_LENGTH);
    }

    #[test]
    fn test_hash_distinguishes_inputs() {
        assert_ne!(blake2b_hash(b"hello"), blake2b_hash(b"hello "));
        assert_ne!(blake2b_hash(b""), blake2b_hash(b"\x00"));
    }
}
