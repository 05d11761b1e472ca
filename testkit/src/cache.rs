// Copyright 2025 The Lathe Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A bounded in-memory cache honoring hash-key immutability.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::{bail, Result};
use lathe::chain::adapters::Cache;
use serde_json::Value as Json;

const DEFAULT_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, Json>,
    order: VecDeque<String>,
    limit: usize,
}

/// In-memory [`Cache`] backend. Clones share state.
#[derive(Debug, Clone)]
pub struct LocalCache {
    inner: Rc<RefCell<Inner>>,
}

impl Default for LocalCache {
    fn default() -> Self {
        LocalCache::with_limit(DEFAULT_LIMIT)
    }
}

impl LocalCache {
    /// A cache bounded to the default entry count.
    pub fn new() -> LocalCache {
        LocalCache::default()
    }

    /// A cache bounded to `limit` entries.
    pub fn with_limit(limit: usize) -> LocalCache {
        LocalCache {
            inner: Rc::new(RefCell::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                limit,
            })),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().map.is_empty()
    }
}

fn immutable_key(key: &str) -> bool {
    key.starts_with("jig://") || key.starts_with("tx://")
}

impl Cache for LocalCache {
    fn get(&self, key: &str) -> Result<Option<Json>> {
        Ok(self.inner.borrow().map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Json) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing) = inner.map.get(key) {
            if immutable_key(key) && existing != value {
                bail!("cache key {} is immutable", key);
            }
        } else {
            inner.order.push_back(key.to_owned());
            let mut scanned = 0;
            let scan_limit = inner.order.len();
            while inner.map.len() >= inner.limit && scanned < scan_limit {
                scanned += 1;
                match inner.order.pop_front() {
                    // Configuration entries survive eviction.
                    Some(old) if old.starts_with("config://") => {
                        inner.order.push_back(old);
                    }
                    Some(old) => {
                        inner.map.remove(&old);
                    }
                    None => break,
                }
            }
        }
        inner.map.insert(key.to_owned(), value.clone());
        Ok(())
    }
}
