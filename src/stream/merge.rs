//! K-way merge of sorted, deduplicated row sources.
//!
//! Partitions and worker results are each internally deduplicated and sorted
//! by the schema's comparer; reconciling M of them is a heap-backed
//! multi-way merge that combines equal-identity heads with the same
//! fact-summation rule as in-memory collisions. O(total rows · log M),
//! degrading to a plain pass-through for M = 1.

use crate::error::Result;
use crate::table::comparer::RowComparer;
use crate::value::Row;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// One sorted, deduplicated input sequence.
pub type RowSource = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Merge `sources` into one sorted, further-deduplicated sequence.
///
/// On equal identities the row from the earliest source wins its key,
/// dimension and label values; facts are summed across all of them.
pub fn merge_rows(
    mut sources: Vec<RowSource>,
    comparer: RowComparer,
    fact_columns: Vec<usize>,
) -> MergedRows {
    match sources.len() {
        0 => MergedRows::Empty,
        1 => MergedRows::Single(sources.remove(0)),
        _ => MergedRows::Many(MultiwayMerge {
            sources,
            heap: BinaryHeap::new(),
            comparer: Arc::new(comparer),
            fact_columns,
            primed: false,
            failed: false,
        }),
    }
}

/// Iterator over the merged sequence. `Empty` and `Single` carry no merge
/// overhead at all.
pub enum MergedRows {
    Empty,
    Single(RowSource),
    Many(MultiwayMerge),
}

impl Iterator for MergedRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            MergedRows::Empty => None,
            MergedRows::Single(source) => source.next(),
            MergedRows::Many(merge) => merge.next(),
        }
    }
}

struct HeapEntry {
    row: Row,
    source: usize,
    comparer: Arc<RowComparer>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap pops the smallest row; source index
    // breaks ties to keep "earliest source wins" stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparer
            .compare(&other.row, &self.row)
            .then_with(|| other.source.cmp(&self.source))
    }
}

pub struct MultiwayMerge {
    sources: Vec<RowSource>,
    heap: BinaryHeap<HeapEntry>,
    comparer: Arc<RowComparer>,
    fact_columns: Vec<usize>,
    primed: bool,
    failed: bool,
}

impl MultiwayMerge {
    /// Pull the next head of `source` onto the heap, if any.
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(head) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                row: head?,
                source,
                comparer: Arc::clone(&self.comparer),
            });
        }
        Ok(())
    }
}

impl Iterator for MultiwayMerge {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.advance(source) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let mut top = self.heap.pop()?;
        if let Err(e) = self.advance(top.source) {
            self.failed = true;
            return Some(Err(e));
        }

        // Fold every other head that shares this identity into the winner.
        while self
            .heap
            .peek()
            .is_some_and(|next| self.comparer.identity_eq(&top.row, &next.row))
        {
            let Some(other) = self.heap.pop() else { break };
            for &col in &self.fact_columns {
                if let Err(e) = top.row[col].sum(&other.row[col], col) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            if let Err(e) = self.advance(other.source) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok(top.row))
    }
}
