// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::hash::Hasher;

use fnv::FnvHasher;

/// Label set of one derived series.
pub type Dimensions = HashMap<String, String>;

const SEPARATOR: u8 = 0xff;

/// Identity hash of a dimension set.
///
/// Pairs are sorted by key and hashed as `key 0xff value 0xff ...`, so two maps
/// holding the same pairs hash identically regardless of insertion order.
/// Collisions are not detected.
#[must_use]
pub fn hash_from_map(dims: &Dimensions) -> u64 {
    let mut pairs: Vec<(&str, &str)> = dims
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut hasher = FnvHasher::default();
    for (key, value) in pairs {
        hasher.write(key.as_bytes());
        hasher.write_u8(SEPARATOR);
        hasher.write(value.as_bytes());
        hasher.write_u8(SEPARATOR);
    }
    hasher.finish()
}
