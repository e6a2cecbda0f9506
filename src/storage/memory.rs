use super::{Batch, Range, Scan, Store, Write};
use crate::error::Result;

use std::collections::BTreeMap;

/// An in-memory key/value store using the Rust standard library B-tree
/// implementation. Data is not persisted. Used e.g. for testing.
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new in-memory key-value store.
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Store for Memory {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(&self, range: Range) -> Scan<'_> {
        Box::new(self.data.range(range).map(|(key, value)| Ok((key.clone(), value.clone()))))
    }

    fn write(&mut self, batch: Batch) -> Result<()> {
        // The batch is trivially atomic, since we hold an exclusive reference.
        for write in batch {
            match write {
                Write::Put(key, value) => self.data.insert(key, value),
                Write::Delete(key) => self.data.remove(&key),
            };
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
