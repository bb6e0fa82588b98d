// src/utils/grouping.rs

use std::mem;

#[derive(Debug)]
pub struct ConsecutiveGrouper<K, T> {
    current: Option<K>,
    items: Vec<T>,
}

impl<K: PartialEq, T> Default for ConsecutiveGrouper<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq, T> ConsecutiveGrouper<K, T> {
    pub fn new() -> Self {
        Self {
            current: None,
            items: Vec::new(),
        }
    }

    /// Adds an item. Returns the previous group when `key` differs from the
    /// key of the group being accumulated.
    pub fn push(&mut self, key: K, item: T) -> Option<(K, Vec<T>)> {
        let completed = match &self.current {
            Some(current) if *current == key => None,
            Some(_) => {
                let previous_key = self.current.take();
                let previous_items = mem::take(&mut self.items);
                previous_key.map(|k| (k, previous_items))
            }
            None => None,
        };
        if self.current.is_none() {
            self.current = Some(key);
        }
        self.items.push(item);
        completed
    }

    /// Returns the trailing group, if any. The grouper is empty afterwards.
    pub fn finish(&mut self) -> Option<(K, Vec<T>)> {
        let key = self.current.take()?;
        Some((key, mem::take(&mut self.items)))
    }
}

/// Iterator adapter over [`ConsecutiveGrouper`].
pub struct GroupConsecutive<I, F, K, T> {
    inner: I,
    key_fn: F,
    grouper: ConsecutiveGrouper<K, T>,
    done: bool,
}

impl<I, F, K, T> GroupConsecutive<I, F, K, T>
where
    I: Iterator<Item = T>,
    F: FnMut(&T) -> K,
    K: PartialEq,
{
    pub fn new(inner: I, key_fn: F) -> Self {
        Self {
            inner,
            key_fn,
            grouper: ConsecutiveGrouper::new(),
            done: false,
        }
    }
}

impl<I, F, K, T> Iterator for GroupConsecutive<I, F, K, T>
where
    I: Iterator<Item = T>,
    F: FnMut(&T) -> K,
    K: PartialEq,
{
    type Item = (K, Vec<T>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for item in self.inner.by_ref() {
            let key = (self.key_fn)(&item);
            if let Some(group) = self.grouper.push(key, item) {
                return Some(group);
            }
        }
        self.done = true;
        self.grouper.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_consecutive_runs() {
        let rows = vec![(1, 'a'), (1, 'b'), (2, 'c'), (3, 'd'), (3, 'e')];
        let groups: Vec<(i32, Vec<char>)> = GroupConsecutive::new(rows.into_iter(), |r| r.0)
            .map(|(k, items)| (k, items.into_iter().map(|r| r.1).collect()))
            .collect();
        assert_eq!(groups, vec![(1, vec!['a', 'b']), (2, vec!['c']), (3, vec!['d', 'e'])]);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let rows: Vec<(i32, char)> = Vec::new();
        assert_eq!(GroupConsecutive::new(rows.into_iter(), |r| r.0).count(), 0);
    }

    #[test]
    fn test_reappearing_key_starts_new_group() {
        let mut grouper = ConsecutiveGrouper::new();
        assert!(grouper.push(1, "x").is_none());
        assert_eq!(grouper.push(2, "y"), Some((1, vec!["x"])));
        assert_eq!(grouper.push(1, "z"), Some((2, vec!["y"])));
        assert_eq!(grouper.finish(), Some((1, vec!["z"])));
        assert_eq!(grouper.finish(), None);
    }
}
