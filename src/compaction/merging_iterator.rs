//! K-way merge over sorted entry streams.
//!
//! Produces entries in internal-key order (user key ascending, newest version
//! first). Unlike a deduplicating merge, every version is emitted: choosing
//! which versions survive is the job of the [`CompactionIterator`].
//!
//! [`CompactionIterator`]: super::CompactionIterator

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::types::Entry;

/// Head of one source, ordered for a min-heap
struct HeapEntry {
    entry: Entry,
    /// Index into `sources`
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the smallest key. Ties go to
        // the lower source index.
        other
            .entry
            .key
            .cmp(&self.entry.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges N individually sorted streams into one sorted stream
pub struct MergingIterator {
    sources: Vec<std::vec::IntoIter<Entry>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergingIterator {
    pub fn new(sources: Vec<Vec<Entry>>) -> Self {
        let mut iters: Vec<std::vec::IntoIter<Entry>> = Vec::with_capacity(sources.len());
        let mut heap = BinaryHeap::with_capacity(sources.len());

        for (i, source) in sources.into_iter().enumerate() {
            let mut iter = source.into_iter();
            if let Some(entry) = iter.next() {
                heap.push(HeapEntry { entry, source: i });
            }
            iters.push(iter);
        }

        Self {
            sources: iters,
            heap,
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let top = self.heap.pop()?;
        if let Some(next) = self.sources[top.source].next() {
            self.heap.push(HeapEntry {
                entry: next,
                source: top.source,
            });
        }
        Some(top.entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.heap.len() + self.sources.iter().map(|s| s.len()).sum::<usize>();
        (n, Some(n))
    }
}
