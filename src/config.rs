use crate::stream::codec::CodecKind;
use std::path::PathBuf;

/// Engine resource limits and spill settings.
///
/// The three caps compose independently: `queue_capacity` bounds
/// producer/consumer memory, `flush_row_threshold` bounds each worker's
/// in-memory rows, `max_disk_bytes` bounds total spill across all workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Flush to disk once the sum of all in-memory table rows exceeds this.
    pub flush_row_threshold: usize,

    /// Stop pulling items once cumulative spilled bytes exceed this.
    pub max_disk_bytes: Option<u64>,

    /// Bounded item queue between the producer and the workers.
    pub queue_capacity: usize,

    /// Number of worker threads for the parallel path.
    pub workers: usize,

    /// Spill directory. `None` disables spilling entirely (everything stays
    /// in memory and the flush threshold is moot).
    pub spill_dir: Option<PathBuf>,

    /// Row encoding for partitions.
    pub codec: CodecKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flush_row_threshold: 500_000,
            max_disk_bytes: None,
            queue_capacity: 1024,
            workers: 1,
            spill_dir: None,
            codec: CodecKind::Binary,
        }
    }
}
