//! Fixed-capacity history of recent frames

use core::fmt;

use heapless::HistoryBuffer;

/// Ring buffer keeping the `N` most recent items. Appending to a full
/// buffer evicts the oldest item.
/// Items live on the heap.
pub struct RecentBuffer<T, const N: usize> {
    items: Box<HistoryBuffer<T, N>>,
}

impl<T, const N: usize> RecentBuffer<T, N> {
    /// Empty buffer
    pub fn new() -> Self {
        Self {
            items: Box::new(HistoryBuffer::new()),
        }
    }

    /// Append an item, evicting the oldest when full
    pub fn push(&mut self, item: T) {
        self.items.write(item);
    }

    /// Most recent item
    pub fn last(&self) -> Option<&T> {
        self.items.recent()
    }

    /// Items, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.oldest_ordered()
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.items.len() == 0
    }

    /// Capacity
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for RecentBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, const N: usize> Clone for RecentBuffer<T, N> {
    fn clone(&self) -> Self {
        self.iter().cloned().collect()
    }
}

impl<T: PartialEq, const N: usize> PartialEq for RecentBuffer<T, N> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: fmt::Debug, const N: usize> fmt::Debug for RecentBuffer<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, const N: usize> FromIterator<T> for RecentBuffer<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut buf = Self::new();
        for item in iter {
            buf.push(item);
        }
        buf
    }
}
