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

//! Generic three-way merge combinators, plus specializations for some
//! common shapes of merged values.
//!
//! A merge function takes the common ancestor `old` and the two sides `a`
//! and `b`, and either resolves to a value or reports a [`Conflict`]. The
//! combinators in this module build merge functions for compound types out
//! of merge functions for their parts. Unless a particular merge function
//! documents otherwise, merges are commutative: swapping `a` and `b`
//! cannot change a conflict into a resolution or vice versa.

use std::collections::BTreeMap;
use std::fmt::Debug;

use itertools::Itertools as _;
use thiserror::Error;

/// A three-way merge could not resolve.
///
/// Conflicts are ordinary values, not panics: callers decide whether to
/// retry with another strategy, surface the message, or abort.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("Merge conflict: {0}")]
pub struct Conflict(pub String);

impl Conflict {
    /// Creates a conflict with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of a three-way merge.
pub type MergeResult<T> = Result<T, Conflict>;

/// The default merge: keeps a value that only one side changed.
///
/// If both sides agree, that value wins. If one side left the ancestor
/// value untouched, the other side's change wins. Anything else is a
/// conflict.
pub fn merge_default<T>(old: &T, a: &T, b: &T) -> MergeResult<T>
where
    T: Clone + Debug + Eq,
{
    if a == b {
        Ok(a.clone())
    } else if a == old {
        Ok(b.clone())
    } else if b == old {
        Ok(a.clone())
    } else {
        Err(Conflict::new(format!(
            "both sides changed the value: {a:?} vs {b:?}"
        )))
    }
}

/// Lifts a merge of `T` to a merge of `Option<T>`.
///
/// Presence and absence merge like any other change: agreeing sides win,
/// a side that kept the ancestor state yields to the other, and a
/// presence/absence disagreement where both sides changed is a conflict.
/// The inner merge runs only when all three values are present.
pub fn merge_option<T>(
    old: Option<&T>,
    a: Option<&T>,
    b: Option<&T>,
    merge: impl FnOnce(&T, &T, &T) -> MergeResult<T>,
) -> MergeResult<Option<T>>
where
    T: Clone + Eq,
{
    match (old, a, b) {
        (Some(old), Some(a), Some(b)) => merge(old, a, b).map(Some),
        _ if a == b => Ok(a.cloned()),
        _ if a == old => Ok(b.cloned()),
        _ if b == old => Ok(a.cloned()),
        _ => Err(Conflict::new(
            "one side added or removed a value the other side changed",
        )),
    }
}

/// Merges a pair componentwise.
pub fn merge_pair<A, B>(
    old: &(A, B),
    a: &(A, B),
    b: &(A, B),
    merge_first: impl FnOnce(&A, &A, &A) -> MergeResult<A>,
    merge_second: impl FnOnce(&B, &B, &B) -> MergeResult<B>,
) -> MergeResult<(A, B)> {
    let first = merge_first(&old.0, &a.0, &b.0)?;
    let second = merge_second(&old.1, &a.1, &b.1)?;
    Ok((first, second))
}

/// Merges key-value lists by aligning entries on their keys.
///
/// Each key present in any of the three lists is merged with
/// [`merge_option`] over the values it maps to. The result contains the
/// union of the key sets, minus keys whose merged value is absent, in key
/// order.
pub fn merge_assoc_list<K, V>(
    old: &[(K, V)],
    a: &[(K, V)],
    b: &[(K, V)],
    merge_value: impl Fn(&V, &V, &V) -> MergeResult<V>,
) -> MergeResult<Vec<(K, V)>>
where
    K: Clone + Debug + Ord,
    V: Clone + Eq,
{
    let to_map = |entries: &[(K, V)]| -> BTreeMap<K, V> {
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    let merged = merge_sorted_map(&to_map(old), &to_map(a), &to_map(b), merge_value)?;
    Ok(merged.into_iter().collect())
}

/// Merges sorted maps by key, with [`merge_option`] semantics per entry.
pub fn merge_sorted_map<K, V>(
    old: &BTreeMap<K, V>,
    a: &BTreeMap<K, V>,
    b: &BTreeMap<K, V>,
    merge_value: impl Fn(&V, &V, &V) -> MergeResult<V>,
) -> MergeResult<BTreeMap<K, V>>
where
    K: Clone + Debug + Ord,
    V: Clone + Eq,
{
    let keys: Vec<&K> = old
        .keys()
        .chain(a.keys())
        .chain(b.keys())
        .sorted()
        .dedup()
        .collect();
    let mut merged = BTreeMap::new();
    for key in keys {
        let value = merge_option(old.get(key), a.get(key), b.get(key), &merge_value)
            .map_err(|conflict| Conflict::new(format!("entry {key:?}: {}", conflict.0)))?;
        if let Some(value) = value {
            merged.insert(key.clone(), value);
        }
    }
    Ok(merged)
}

/// Tries each merge function in order; the first non-conflicting result
/// wins. Conflicts only if every candidate conflicts, in which case the
/// last conflict is reported.
pub fn merge_seq<T>(
    old: &T,
    a: &T,
    b: &T,
    mergers: &[&dyn Fn(&T, &T, &T) -> MergeResult<T>],
) -> MergeResult<T> {
    let mut last = Conflict::new("no merge function given");
    for merge in mergers {
        match merge(old, a, b) {
            Ok(value) => return Ok(value),
            Err(conflict) => last = conflict,
        }
    }
    Err(last)
}

/// Ports a merge of `B` to a merge of `A` through an invertible mapping.
///
/// All three `A` values are mapped forward, merged as `B`, and the result
/// is mapped back. A value outside the domain of either direction is a
/// conflict.
pub fn merge_bijection<A, B>(
    old: &A,
    a: &A,
    b: &A,
    merge: impl FnOnce(&B, &B, &B) -> MergeResult<B>,
    to: impl Fn(&A) -> Option<B>,
    from: impl Fn(&B) -> Option<A>,
) -> MergeResult<A> {
    let map = |value: &A| {
        to(value).ok_or_else(|| Conflict::new("value not in the domain of the mapping"))
    };
    let merged = merge(&map(old)?, &map(a)?, &map(b)?)?;
    from(&merged).ok_or_else(|| Conflict::new("merged value has no inverse image"))
}

/// Builds the merge function lazily, then applies it.
///
/// This is the tie for recursive merges: the closure may refer to the
/// merge being defined without forcing it up front.
pub fn merge_apply<T, M>(f: impl FnOnce() -> M, old: &T, a: &T, b: &T) -> MergeResult<T>
where
    M: FnOnce(&T, &T, &T) -> MergeResult<T>,
{
    f()(old, a, b)
}

/// Merges counters by summing the two sides' increments over the
/// ancestor. Never conflicts.
pub fn merge_counter(old: i64, a: i64, b: i64) -> i64 {
    old + (a - old) + (b - old)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_default_laws() {
        // Reflexivity
        assert_eq!(merge_default(&1, &2, &2), Ok(2));
        // Identity
        assert_eq!(merge_default(&1, &1, &2), Ok(2));
        assert_eq!(merge_default(&1, &2, &1), Ok(2));
        // Conflict, commutatively
        assert!(merge_default(&1, &2, &3).is_err());
        assert!(merge_default(&1, &3, &2).is_err());
    }

    #[test]
    fn test_option_merge() {
        let m = |old: &i32, a: &i32, b: &i32| merge_default(old, a, b);

        // All present delegates
        assert_eq!(merge_option(Some(&1), Some(&1), Some(&2), m), Ok(Some(2)));
        // All absent
        assert_eq!(merge_option(None, None, None, m), Ok(None));
        // One side unchanged, the other removed or added
        assert_eq!(merge_option(Some(&1), Some(&1), None, m), Ok(None));
        assert_eq!(merge_option(Some(&1), None, Some(&1), m), Ok(None));
        assert_eq!(merge_option(None, Some(&2), None, m), Ok(Some(2)));
        // Reflexivity across presence changes
        assert_eq!(merge_option(Some(&1), None, None, m), Ok(None));
        assert_eq!(merge_option(None, Some(&2), Some(&2), m), Ok(Some(2)));
        // Remove vs change conflicts
        assert!(merge_option(Some(&1), None, Some(&2), m).is_err());
        assert!(merge_option(Some(&1), Some(&2), None, m).is_err());
    }

    #[test]
    fn test_pair_merge() {
        let m = merge_default::<i32>;
        assert_eq!(merge_pair(&(1, 10), &(2, 10), &(1, 20), m, m), Ok((2, 20)));
        assert!(merge_pair(&(1, 10), &(2, 10), &(3, 10), m, m).is_err());
    }

    #[test]
    fn test_sorted_map_merge() {
        let m = merge_default::<&str>;
        let old = maplit::btreemap! {"k" => "a", "gone" => "x"};
        let a = maplit::btreemap! {"k" => "a", "gone" => "x", "ours" => "1"};
        let b = maplit::btreemap! {"k" => "b"};

        // "k" changed only on b's side; "gone" removed by b; "ours" added
        // by a.
        let merged = merge_sorted_map(&old, &a, &b, m).unwrap();
        assert_eq!(merged, maplit::btreemap! {"k" => "b", "ours" => "1"});

        // Swapping sides agrees.
        let swapped = merge_sorted_map(&old, &b, &a, m).unwrap();
        assert_eq!(swapped, merged);

        // Concurrent changes to one key conflict and name the key.
        let b2 = maplit::btreemap! {"k" => "c", "gone" => "x"};
        let err = merge_sorted_map(&old, &a, &b2, m).unwrap_err();
        assert!(err.0.contains("\"k\""));
    }

    #[test]
    fn test_assoc_list_merge() {
        let m = merge_default::<i32>;
        let merged = merge_assoc_list(
            &[("x", 1), ("y", 1)],
            &[("x", 2), ("y", 1)],
            &[("x", 1)],
            m,
        )
        .unwrap();
        assert_eq!(merged, vec![("x", 2)]);
    }

    #[test]
    fn test_seq_merge() {
        let always_conflict =
            |_: &i64, _: &i64, _: &i64| -> MergeResult<i64> { Err(Conflict::new("nope")) };
        let counter = |old: &i64, a: &i64, b: &i64| Ok(merge_counter(*old, *a, *b));

        assert_eq!(
            merge_seq(&10, &13, &15, &[&always_conflict, &counter]),
            Ok(18)
        );
        assert_eq!(
            merge_seq(&10, &13, &15, &[&always_conflict]),
            Err(Conflict::new("nope"))
        );
    }

    #[test]
    fn test_bijection_merge() {
        // Merge decimal strings through their integer representation.
        let to = |s: &String| s.parse::<i64>().ok();
        let from = |n: &i64| Some(n.to_string());
        let counter = |old: &i64, a: &i64, b: &i64| Ok(merge_counter(*old, *a, *b));

        let merged = merge_bijection(
            &"10".to_string(),
            &"13".to_string(),
            &"15".to_string(),
            counter,
            to,
            from,
        );
        assert_eq!(merged, Ok("18".to_string()));

        let err = merge_bijection(
            &"ten".to_string(),
            &"13".to_string(),
            &"15".to_string(),
            counter,
            to,
            from,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_apply_merge() {
        let merged = merge_apply(|| merge_default::<i32>, &1, &1, &5);
        assert_eq!(merged, Ok(5));
    }

    #[test_case(10, 13, 15, 18; "both sides increment")]
    #[test_case(10, 15, 13, 18; "commutes")]
    #[test_case(0, -2, 5, 3; "mixed signs")]
    #[test_case(7, 7, 7, 7; "unchanged")]
    fn test_counter_merge(old: i64, a: i64, b: i64, expected: i64) {
        assert_eq!(merge_counter(old, a, b), expected);
    }
}
