//! Frequency counts for a set of named items, such as syscalls handled by a thread.

use std::collections::BTreeMap;

/// Counts how many times each key was seen. Keys are added the first time they're incremented.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    // a BTreeMap so that items with equal counts are always displayed in the same order
    items: BTreeMap<&'static str, u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count for `id`, returning the new count.
    pub fn add_one(&mut self, id: &'static str) -> u64 {
        let val = self.items.entry(id).or_insert(0);
        *val += 1;
        *val
    }

    /// The count for `id`, or 0 if it was never incremented.
    pub fn get_value(&self, id: &str) -> u64 {
        self.items.get(id).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for Counter {
    /// Lists the counts as space-separated "key=value" pairs with the heaviest hitters first.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut items: Vec<_> = self.items.iter().collect();
        // stable sort, so ties stay in key order
        items.sort_by(|(_, a), (_, b)| b.cmp(a));

        write!(f, "Counts:")?;
        for (id, count) in items {
            write!(f, " {id}={count}")?;
        }
        Ok(())
    }
}
