// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write-once storage of dimension sets keyed by their hash.
//!
//! The dimension names of one metric stream form a small, stable vocabulary
//! while values vary per series. Names are interned once into a per-store key
//! table and entries only keep the key index next to the value.

use std::sync::{PoisonError, RwLock};

use hashbrown::HashMap;
use ustr::Ustr;

use crate::labels::Dimensions;

#[derive(Default)]
struct Inner {
    keys: Vec<Ustr>,
    key_index: HashMap<Ustr, u32>,
    entries: HashMap<u64, Box<[(u32, Box<str>)]>>,
}

impl Inner {
    fn intern(&mut self, key: &str) -> u32 {
        let key = Ustr::from(key);
        if let Some(idx) = self.key_index.get(&key) {
            return *idx;
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = self.keys.len() as u32;
        self.keys.push(key);
        self.key_index.insert(key, idx);
        idx
    }
}

#[derive(Default)]
pub struct Storage {
    inner: RwLock<Inner>,
}

impl Storage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dims` under `hash` unless the hash is already known.
    pub fn set_if(&self, hash: u64, dims: &Dimensions) {
        if self.exist(hash) {
            return;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.contains_key(&hash) {
            return;
        }
        let entry: Box<[(u32, Box<str>)]> = dims
            .iter()
            .map(|(k, v)| (inner.intern(k), Box::from(v.as_str())))
            .collect();
        inner.entries.insert(hash, entry);
    }

    /// Returns an owned copy of the dimension set stored under `hash`.
    #[must_use]
    pub fn get(&self, hash: u64) -> Option<Dimensions> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.entries.get(&hash)?;
        Some(
            entry
                .iter()
                .filter_map(|(idx, value)| {
                    inner
                        .keys
                        .get(*idx as usize)
                        .map(|key| (key.as_str().to_string(), value.to_string()))
                })
                .collect(),
        )
    }

    pub fn del(&self, hash: u64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(&hash);
    }

    #[must_use]
    pub fn exist(&self, hash: u64) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(&hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry and the interned key table.
    pub fn clean(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = Inner::default();
    }
}
