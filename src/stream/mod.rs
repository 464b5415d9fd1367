//! Streaming: the single-worker driver, disk spill, external merge, and the
//! producer/worker orchestration on top of them.

pub mod codec;
pub mod driver;
pub mod merge;
pub mod parallel;
pub mod partition;

pub use codec::CodecKind;
pub use driver::{FinalTable, JobResult, JobStatus, Progress, StreamAggregator};
pub use merge::{merge_rows, MergedRows, RowSource};
pub use parallel::{run_parallel, CancelToken};
pub use partition::{BatchWriter, DiskBudget, Partition, PartitionSet, RowCursor};
