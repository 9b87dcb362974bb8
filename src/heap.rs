//! A binary min-heap ordered by a comparator passed to each call.
//! The priority and delay queues keep their entries here, under their mutex.

use std::cmp::Ordering;

pub(crate) struct Heap<E> {
    entries: Vec<E>,
}

impl<E> Heap<E> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// the least entry
    pub(crate) fn peek(&self) -> Option<&E> {
        self.entries.first()
    }

    pub(crate) fn push<C>(&mut self, entry: E, cmp: C)
    where
        C: Fn(&E, &E) -> Ordering,
    {
        self.entries.push(entry);
        let mut child = self.entries.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if cmp(&self.entries[child], &self.entries[parent]) != Ordering::Less {
                break;
            }
            self.entries.swap(child, parent);
            child = parent;
        }
    }

    pub(crate) fn pop<C>(&mut self, cmp: C) -> Option<E>
    where
        C: Fn(&E, &E) -> Ordering,
    {
        if self.entries.is_empty() {
            return None;
        }
        let least = self.entries.swap_remove(0);
        let len = self.entries.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smaller = if right < len
                && cmp(&self.entries[right], &self.entries[left]) == Ordering::Less
            {
                right
            } else {
                left
            };
            if cmp(&self.entries[smaller], &self.entries[parent]) != Ordering::Less {
                break;
            }
            self.entries.swap(parent, smaller);
            parent = smaller;
        }
        Some(least)
    }
}
