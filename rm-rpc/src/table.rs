//! Per-key inhibition tables (§3 Client, §4.5): a class, a client, or
//! an object each get their own `Inhibitable` the first time they are
//! named, grounded on `libhurd-cap-server/table.c`'s lazily-populated
//! client/object tables.

use crate::inhibit::Inhibitable;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct InhibitTable<K> {
    entries: Mutex<HashMap<K, Arc<Inhibitable>>>,
}

impl<K: Eq + Hash + Clone> Default for InhibitTable<K> {
    fn default() -> Self {
        InhibitTable { entries: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone> InhibitTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: K) -> Arc<Inhibitable> {
        let mut entries = self.entries.lock().unwrap();
        Arc::clone(entries.entry(key).or_insert_with(|| Arc::new(Inhibitable::new())))
    }

    pub fn get(&self, key: &K) -> Option<Arc<Inhibitable>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &K) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// A class is named by an RPC label's class id (§3 Client); a client
/// and an object are each named by their own id space.
pub type ClassTable = InhibitTable<u32>;
pub type ClientTable = InhibitTable<u64>;
pub type ObjectTable = InhibitTable<u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_one_inhibitable() {
        let clients = ClientTable::new();
        let a = clients.get_or_create(7);
        let b = clients.get_or_create(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(clients.get(&8).is_none());
    }
}
