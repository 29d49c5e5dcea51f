//! Insertion-ordered UID list with O(1) membership and removal.

use std::collections::{HashMap, HashSet};

/// Ordered list of record UIDs. Callers hold it behind a mutex; the
/// check-and-append in [`UidList::push`] is the put critical section.
///
/// Removal leaves a tombstone in `order`; the vector is compacted once
/// tombstones outnumber live entries.
#[derive(Debug, Default)]
pub(crate) struct UidList {
    order: Vec<Option<String>>,
    positions: HashMap<String, usize>,
}

impl UidList {
    pub(crate) fn from_sorted(uids: Vec<String>) -> Self {
        let mut list = Self::default();
        for uid in uids {
            list.push(&uid);
        }
        list
    }

    /// Appends `uid` if absent; returns true if it was appended.
    pub(crate) fn push(&mut self, uid: &str) -> bool {
        if self.positions.contains_key(uid) {
            return false;
        }
        self.positions.insert(uid.to_string(), self.order.len());
        self.order.push(Some(uid.to_string()));
        true
    }

    pub(crate) fn remove(&mut self, uid: &str) -> bool {
        let Some(pos) = self.positions.remove(uid) else {
            return false;
        };
        self.order[pos] = None;
        if self.order.len() > 2 * self.positions.len() + 16 {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        self.order.retain(Option::is_some);
        for (pos, uid) in self.order.iter().flatten().enumerate() {
            if let Some(slot) = self.positions.get_mut(uid) {
                *slot = pos;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, uid: &str) -> bool {
        self.positions.contains_key(uid)
    }

    pub(crate) fn len(&self) -> usize {
        self.positions.len()
    }

    pub(crate) fn to_vec(&self) -> Vec<String> {
        self.order.iter().flatten().cloned().collect()
    }

    /// Keeps the order of UIDs still present, drops the rest and appends
    /// newcomers in the order given.
    pub(crate) fn reconcile(&mut self, present: &[String]) {
        let present_set: HashSet<&str> = present.iter().map(String::as_str).collect();
        for slot in self.order.iter_mut() {
            if slot.as_deref().is_some_and(|uid| !present_set.contains(uid)) {
                *slot = None;
            }
        }
        self.positions.retain(|uid, _| present_set.contains(uid.as_str()));
        self.compact();
        for uid in present {
            self.push(uid);
        }
    }
}
