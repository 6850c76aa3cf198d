//! Per-segment document cursors and the index heap used by sorted merges.

use std::cmp::Ordering;

use crate::error::{MergeError, Result};
use crate::reclaim::sort::{AttributeSource, SortDescriptions, SortKey, evaluate_sort_key};
use crate::segment::{DeletionMapReader, DocId, SegmentId, SegmentMergeInfo};

/// Walks one segment's live documents in local order, evaluating each
/// document's sort key when it becomes current.
pub struct WeightedDocIterator<'a> {
    segment: SegmentMergeInfo,
    source: &'a dyn AttributeSource,
    sort: &'a SortDescriptions,
    deletions: &'a dyn DeletionMapReader,
    next_local: u32,
    current: Option<(u32, SortKey)>,
}

impl<'a> WeightedDocIterator<'a> {
    pub fn new(
        segment: SegmentMergeInfo,
        source: &'a dyn AttributeSource,
        sort: &'a SortDescriptions,
        deletions: &'a dyn DeletionMapReader,
    ) -> Self {
        WeightedDocIterator {
            segment,
            source,
            sort,
            deletions,
            next_local: 0,
            current: None,
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment.segment_id
    }

    /// Move to the next live document. Returns false once exhausted.
    ///
    /// A document ordering before its live predecessor is `CorruptData`.
    pub fn advance(&mut self) -> Result<bool> {
        while self.next_local < self.segment.doc_count {
            let local = self.next_local;
            self.next_local += 1;
            if self.deletions.is_deleted(self.segment.base_doc_id + local) {
                continue;
            }
            let key = evaluate_sort_key(self.source, self.sort, self.segment.segment_id, local)?;
            if let Some((previous, previous_key)) = &self.current
                && self.sort.compare(&key, previous_key) == Ordering::Less
            {
                return Err(MergeError::corrupt(format!(
                    "segment {} is not sorted by {}: doc {local} orders before doc {previous}",
                    self.segment.segment_id, self.sort
                )));
            }
            self.current = Some((local, key));
            return Ok(true);
        }
        self.current = None;
        Ok(false)
    }

    /// Local id of the current document.
    pub fn current_local(&self) -> Option<u32> {
        self.current.as_ref().map(|(local, _)| *local)
    }

    /// Global id of the current document.
    pub fn current_global(&self) -> Option<DocId> {
        self.current_local()
            .map(|local| self.segment.base_doc_id + local)
    }

    pub fn current_key(&self) -> Option<&SortKey> {
        self.current.as_ref().map(|(_, key)| key)
    }
}

/// Merge order of two current documents: sort key first, then segment id
/// descending.
pub fn compare_current(
    sort: &SortDescriptions,
    left: &WeightedDocIterator<'_>,
    right: &WeightedDocIterator<'_>,
) -> Ordering {
    let empty = SortKey::new();
    sort.compare(
        left.current_key().unwrap_or(&empty),
        right.current_key().unwrap_or(&empty),
    )
    .then_with(|| right.segment_id().cmp(&left.segment_id()))
}

/// Binary min-heap of arena indexes.
///
/// The heap holds no reference to the arena; every operation takes the
/// comparator, so the caller may mutate arena entries between operations as
/// long as only popped entries change.
#[derive(Debug, Default)]
pub struct IndexHeap {
    slots: Vec<usize>,
}

impl IndexHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        IndexHeap {
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn peek(&self) -> Option<usize> {
        self.slots.first().copied()
    }

    pub fn push<F>(&mut self, index: usize, cmp: F)
    where
        F: Fn(usize, usize) -> Ordering,
    {
        self.slots.push(index);
        let mut child = self.slots.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if cmp(self.slots[child], self.slots[parent]) != Ordering::Less {
                break;
            }
            self.slots.swap(child, parent);
            child = parent;
        }
    }

    pub fn pop<F>(&mut self, cmp: F) -> Option<usize>
    where
        F: Fn(usize, usize) -> Ordering,
    {
        let last = self.slots.len().checked_sub(1)?;
        self.slots.swap(0, last);
        let top = self.slots.pop();

        let len = self.slots.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let smallest = if right < len
                && cmp(self.slots[right], self.slots[left]) == Ordering::Less
            {
                right
            } else {
                left
            };
            if cmp(self.slots[smallest], self.slots[parent]) != Ordering::Less {
                break;
            }
            self.slots.swap(parent, smallest);
            parent = smallest;
        }
        top
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeValue;
    use crate::reclaim::sort::InMemoryAttributeSource;
    use crate::segment::{DeletionMap, NoDeletions};

    #[test]
    fn test_index_heap_orders_by_comparator() {
        let values = [5, 1, 4, 1, 3, 9, 2];
        let cmp = |a: usize, b: usize| values[a].cmp(&values[b]).then(a.cmp(&b));
        let mut heap = IndexHeap::with_capacity(values.len());
        for idx in 0..values.len() {
            heap.push(idx, cmp);
        }
        assert_eq!(heap.peek(), Some(1));

        let mut popped = Vec::new();
        while let Some(idx) = heap.pop(cmp) {
            popped.push(values[idx]);
        }
        assert_eq!(popped, vec![1, 1, 2, 3, 4, 5, 9]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_iterator_skips_deleted_docs() {
        let segment = SegmentMergeInfo::new(2, 10, 4, 2);
        let source = InMemoryAttributeSource::new().with_column(
            2,
            "a",
            (0..4).map(|v| Some(AttributeValue::Int(v))).collect(),
        );
        let sort = SortDescriptions::parse("a").unwrap();
        let mut deletions = DeletionMap::new();
        deletions.add_segment(2, 10, 4);
        deletions.delete(10).unwrap();
        deletions.delete(12).unwrap();

        let mut iter = WeightedDocIterator::new(segment, &source, &sort, &deletions);
        assert!(iter.advance().unwrap());
        assert_eq!(iter.current_global(), Some(11));
        assert_eq!(iter.current_key(), Some(&vec![Some(AttributeValue::Int(1))]));
        assert!(iter.advance().unwrap());
        assert_eq!(iter.current_local(), Some(3));
        assert!(!iter.advance().unwrap());
        assert_eq!(iter.current_local(), None);
    }

    #[test]
    fn test_iterator_rejects_unsorted_segment() {
        let source = InMemoryAttributeSource::new().with_column(
            0,
            "a",
            vec![
                Some(AttributeValue::Int(1)),
                Some(AttributeValue::Int(9)),
                Some(AttributeValue::Int(4)),
            ],
        );
        let sort = SortDescriptions::parse("a").unwrap();
        let mut deletions = DeletionMap::new();
        deletions.add_segment(0, 0, 3);
        let mut iter =
            WeightedDocIterator::new(SegmentMergeInfo::new(0, 0, 3, 0), &source, &sort, &deletions);
        assert!(iter.advance().unwrap());
        assert!(iter.advance().unwrap());
        assert!(matches!(iter.advance(), Err(MergeError::CorruptData(_))));

        // The out-of-order doc is skipped once deleted.
        deletions.delete(1).unwrap();
        let mut iter =
            WeightedDocIterator::new(SegmentMergeInfo::new(0, 0, 3, 1), &source, &sort, &deletions);
        assert!(iter.advance().unwrap());
        assert!(iter.advance().unwrap());
        assert_eq!(iter.current_local(), Some(2));
        assert!(!iter.advance().unwrap());
    }

    #[test]
    fn test_equal_keys_prefer_higher_segment() {
        let source = InMemoryAttributeSource::new()
            .with_column(1, "a", vec![Some(AttributeValue::Int(7))])
            .with_column(2, "a", vec![Some(AttributeValue::Int(7))]);
        let sort = SortDescriptions::parse("a").unwrap();
        let mut low = WeightedDocIterator::new(SegmentMergeInfo::new(1, 0, 1, 0), &source, &sort, &NoDeletions);
        let mut high = WeightedDocIterator::new(SegmentMergeInfo::new(2, 1, 1, 0), &source, &sort, &NoDeletions);
        low.advance().unwrap();
        high.advance().unwrap();
        assert_eq!(compare_current(&sort, &high, &low), Ordering::Less);
    }
}
