//! Bounded numeric ID allocators for services and backends.
//!
//! IDs live in `[1, max]` and are bound to a key (a frontend or backend
//! address). Allocation returns the smallest free ID, so freed IDs are
//! reused before the space grows.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use tracing::debug;

use crate::error::{LbError, LbResult};

#[derive(Debug)]
pub struct IdAllocator<K> {
    kind: &'static str,
    max: u32,
    /// Lowest ID never handed out (or handed back at the top of the range).
    next_fresh: u32,
    /// Freed IDs below `next_fresh`.
    free: BTreeSet<u32>,
    by_key: HashMap<K, u32>,
    by_id: BTreeMap<u32, K>,
}

impl<K: Clone + Eq + Hash> IdAllocator<K> {
    pub fn new(kind: &'static str, max: u32) -> Self {
        Self {
            kind,
            max,
            next_fresh: 1,
            free: BTreeSet::new(),
            by_key: HashMap::new(),
            by_id: BTreeMap::new(),
        }
    }

    /// ID bound to `key`, allocating the smallest free one if needed.
    pub fn allocate(&mut self, key: &K) -> LbResult<u32> {
        if let Some(id) = self.by_key.get(key) {
            return Ok(*id);
        }
        let id = match self.free.pop_first() {
            Some(id) => id,
            None if self.next_fresh <= self.max => {
                self.next_fresh += 1;
                self.next_fresh - 1
            }
            None => return Err(LbError::IdExhausted { kind: self.kind }),
        };
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, key.clone());
        debug!(kind = self.kind, id, "ID allocated");
        Ok(id)
    }

    /// Bind a specific `id` to `key`, e.g. when recovering IDs found in the
    /// datapath. Fails if the ID is out of range or bound to another key.
    pub fn restore(&mut self, key: &K, id: u32) -> LbResult<()> {
        if id == 0 || id > self.max {
            return Err(LbError::InvariantViolation(format!(
                "{} ID {id} outside 1..={}",
                self.kind, self.max
            )));
        }
        match (self.by_key.get(key), self.by_id.contains_key(&id)) {
            (Some(&bound), _) if bound == id => return Ok(()),
            (Some(&bound), _) => {
                return Err(LbError::InvariantViolation(format!(
                    "{} key already bound to ID {bound}, cannot restore {id}",
                    self.kind
                )));
            }
            (None, true) => {
                return Err(LbError::InvariantViolation(format!(
                    "{} ID {id} already in use",
                    self.kind
                )));
            }
            (None, false) => {}
        }

        if id >= self.next_fresh {
            self.free.extend(self.next_fresh..id);
            self.next_fresh = id + 1;
        } else {
            self.free.remove(&id);
        }
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, key.clone());
        Ok(())
    }

    /// Release the ID bound to `key`. Returns it, if there was one.
    pub fn free(&mut self, key: &K) -> Option<u32> {
        let id = self.by_key.remove(key)?;
        self.by_id.remove(&id);
        self.free.insert(id);
        // Give back a free tail so `free` only holds holes.
        while self.next_fresh > 1 && self.free.remove(&(self.next_fresh - 1)) {
            self.next_fresh -= 1;
        }
        debug!(kind = self.kind, id, "ID freed");
        Some(id)
    }

    pub fn lookup(&self, key: &K) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    pub fn key_of(&self, id: u32) -> Option<&K> {
        self.by_id.get(&id)
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Bound IDs and their keys, in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &K)> {
        self.by_id.iter().map(|(id, key)| (*id, key))
    }

    /// Number of bound IDs.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
