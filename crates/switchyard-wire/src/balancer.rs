//! Capability balancer.
//!
//! Items are grouped under a key (the peer name). [`Balancer::balance`] picks
//! the group to serve from by scanning every group in key insertion order and
//! keeping the *last* one that holds a matching item, then rotates through
//! that group round robin.
//!
//! The balancer is a plain data structure; the owning node keeps it behind
//! its own lock together with the rest of its routing state.

/// One key's candidates plus its rotation cursor.
#[derive(Debug, Clone)]
struct Group<T> {
    items: Vec<T>,
    /// Index of the item served last. The next pick starts at `cursor + 1`.
    cursor: usize,
}

impl<T> Group<T> {
    fn new(item: T) -> Self {
        Self {
            items: vec![item],
            cursor: 0,
        }
    }
}

/// Round-robin registry of items grouped by key.
#[derive(Debug, Clone)]
pub struct Balancer<T> {
    groups: Vec<(String, Group<T>)>,
}

impl<T> Default for Balancer<T> {
    fn default() -> Self {
        Self { groups: Vec::new() }
    }
}

impl<T: Clone + PartialEq> Balancer<T> {
    /// Create an empty balancer.
    pub fn new() -> Self {
        Self::default()
    }

    fn group_mut(&mut self, key: &str) -> Option<&mut Group<T>> {
        self.groups
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, g)| g)
    }

    /// Register `item` under `key`, appending to the key's rotation.
    pub fn connect(&mut self, key: &str, item: T) {
        match self.group_mut(key) {
            Some(group) => group.items.push(item),
            None => self.groups.push((key.to_string(), Group::new(item))),
        }
    }

    /// Remove `item` from `key`. No-op if it is not registered there.
    ///
    /// The cursor is rebased so the item that would have been served next is
    /// still served next.
    /// A key whose last item leaves is dropped; connecting under it again
    /// registers it as a new key at the end of the scan order.
    pub fn disconnect(&mut self, key: &str, item: &T) {
        let Some(slot) = self.groups.iter().position(|(k, _)| k == key) else {
            return;
        };
        let group = &mut self.groups[slot].1;
        let Some(removed) = group.items.iter().position(|i| i == item) else {
            return;
        };
        group.items.remove(removed);

        let len = group.items.len();
        if len == 0 {
            self.groups.remove(slot);
            return;
        }
        if removed <= group.cursor {
            group.cursor = group.cursor.checked_sub(1).unwrap_or(len - 1);
        }
        group.cursor %= len;
    }

    /// Pick the next item satisfying `predicate`, or `None` if no registered
    /// item does.
    pub fn balance<F>(&mut self, predicate: F) -> Option<T>
    where
        F: Fn(&T) -> bool,
    {
        let group = self
            .groups
            .iter_mut()
            .map(|(_, g)| g)
            .filter(|g| g.items.iter().any(&predicate))
            .last()?;

        let len = group.items.len();
        for step in 1..=len {
            let idx = (group.cursor + step) % len;
            if predicate(&group.items[idx]) {
                group.cursor = idx;
                return Some(group.items[idx].clone());
            }
        }
        None
    }

    /// Total number of registered items.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, g)| g.items.len()).sum()
    }

    /// Whether no item is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys with at least one item, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.groups.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Items currently registered under `key`, in connection order.
    pub fn items(&self, key: &str) -> Vec<T> {
        self.groups
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, g)| g.items.clone())
            .unwrap_or_default()
    }
}
