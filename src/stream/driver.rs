//! Single-worker streaming driver.
//!
//! Pulls items in one pass, drives the table-mapper tree per item, flushes
//! to disk when the in-memory row volume crosses the threshold, and stops
//! pulling once the disk budget is spent. The final table set is either the
//! in-memory builders directly or the external merge of those builders with
//! every spilled partition.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mapper::{ItemSelector, TableMapper};
use crate::schema::Schema;
use crate::scope::{ScopeContext, ScopeId, ScopeTree};
use crate::stream::codec::CodecKind;
use crate::stream::merge::{merge_rows, MergedRows, RowSource};
use crate::stream::partition::{BatchWriter, DiskBudget, Partition, PartitionSet};
use crate::table::builder::{Table, TableId, TableRegistry};
use crate::table::comparer::RowComparer;
use crate::value::Row;
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

/// How a finished job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The item stream was consumed to the end.
    Completed,
    /// Item pulls stopped early because cumulative spill crossed the
    /// configured disk maximum. Handled, not an error.
    SizeLimitExceeded,
}

/// Progress reporting for the item stream: an optional total estimate (used
/// only for display) and a per-item callback.
#[derive(Default)]
pub struct Progress {
    pub total_hint: Option<u64>,
    on_loaded: Option<Box<dyn Fn(u64) + Send + Sync>>,
}

impl Progress {
    pub fn new() -> Self {
        Progress::default()
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total_hint = Some(total);
        self
    }

    pub fn on_loaded(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_loaded = Some(Box::new(callback));
        self
    }

    pub(crate) fn loaded(&self, count: u64) {
        if let Some(callback) = &self.on_loaded {
            callback(count);
        }
    }
}

/// A mapper node bound to its builder and scope.
struct BoundNode {
    table: TableId,
    scope: ScopeId,
    selector: ItemSelector,
    children: Vec<BoundNode>,
}

/// One worker's streaming pass over an item sequence.
pub struct StreamAggregator {
    registry: TableRegistry,
    tree: ScopeTree,
    nodes: Vec<BoundNode>,
    writer: Option<BatchWriter>,
    flush_threshold: usize,
    size_exceeded: bool,
    items: u64,
}

impl StreamAggregator {
    pub fn new(mappers: Vec<TableMapper>, config: &EngineConfig) -> Result<Self> {
        let writer = match &config.spill_dir {
            Some(dir) => {
                let budget = Arc::new(DiskBudget::new(config.max_disk_bytes));
                Some(BatchWriter::new(dir.clone(), config.codec, budget)?)
            }
            None => None,
        };
        Self::with_writer(mappers, config.flush_row_threshold, writer)
    }

    /// Used by the parallel orchestration, where each worker gets its own
    /// writer sharing one disk budget.
    pub(crate) fn with_writer(
        mappers: Vec<TableMapper>,
        flush_threshold: usize,
        writer: Option<BatchWriter>,
    ) -> Result<Self> {
        let mut registry = TableRegistry::new();
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let nodes = mappers
            .into_iter()
            .map(|m| Self::bind(&mut registry, &mut tree, root, None, m))
            .collect::<Result<Vec<_>>>()?;
        Ok(StreamAggregator {
            registry,
            tree,
            nodes,
            writer,
            flush_threshold,
            size_exceeded: false,
            items: 0,
        })
    }

    fn bind(
        registry: &mut TableRegistry,
        tree: &mut ScopeTree,
        parent_scope: ScopeId,
        parent_table: Option<TableId>,
        mapper: TableMapper,
    ) -> Result<BoundNode> {
        let table = registry.add_table(&mapper.name, mapper.mappers, parent_table)?;
        registry.initialize_mappers(table)?;
        let scope = tree.add_child(parent_scope, mapper.name);
        let children = mapper
            .children
            .into_iter()
            .map(|child| Self::bind(registry, tree, scope, Some(table), child))
            .collect::<Result<Vec<_>>>()?;
        Ok(BoundNode {
            table,
            scope,
            selector: mapper.selector,
            children,
        })
    }

    /// Drive the whole mapper tree for one item.
    pub fn process_item(&mut self, item: &Value) -> Result<()> {
        for node in &self.nodes {
            Self::process_node(&mut self.registry, &mut self.tree, node, item)?;
        }
        self.registry.drain_related()?;
        self.items += 1;
        Ok(())
    }

    /// Recursive descent: select sub-items, advance the node's scope, build
    /// a row; only a row that actually inserted opens the children — a
    /// discarded parent row produces zero child rows.
    fn process_node(
        registry: &mut TableRegistry,
        tree: &mut ScopeTree,
        node: &BoundNode,
        source: &Value,
    ) -> Result<()> {
        for object in node.selector.select(source) {
            let child_source = if node.children.is_empty() {
                None
            } else {
                Some(object.clone())
            };
            tree.set(node.scope, object);

            let inserted = {
                let ctx = ScopeContext::new(tree, node.scope);
                registry.add_row_from_context(node.table, &ctx)?
            };
            if inserted {
                if let Some(src) = child_source {
                    for child in &node.children {
                        Self::process_node(registry, tree, child, &src)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn items_processed(&self) -> u64 {
        self.items
    }

    pub(crate) fn size_exceeded(&self) -> bool {
        self.size_exceeded
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.writer.is_some() && self.registry.total_rows() > self.flush_threshold
    }

    /// Finalize all builders, persist them as one partition, clear.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let tables = self.registry.finalize_all()?;
        let rows: usize = tables.iter().map(Table::len).sum();
        writer.write_batch(&tables)?;
        debug!("flushed {rows} rows after {} items", self.items);
        if writer.end() {
            self.size_exceeded = true;
        }
        Ok(())
    }

    /// Consume the item sequence in a single pass.
    pub fn run<I>(&mut self, items: I, progress: &Progress) -> Result<JobStatus>
    where
        I: IntoIterator<Item = Value>,
    {
        for item in items {
            self.process_item(&item)?;
            progress.loaded(self.items);
            if self.should_flush() {
                self.flush()?;
            }
            if self.size_exceeded {
                info!("disk size limit exceeded after {} items", self.items);
                break;
            }
        }
        Ok(if self.size_exceeded {
            JobStatus::SizeLimitExceeded
        } else {
            JobStatus::Completed
        })
    }

    /// Tear down into mergeable pieces: final in-memory snapshots plus any
    /// spilled partitions.
    pub(crate) fn into_parts(mut self) -> Result<WorkerParts> {
        let tables = self.registry.finalize_all()?;
        let (partitions, codec) = match self.writer.as_mut() {
            Some(writer) => (writer.take_partitions(), writer.codec()),
            None => (Vec::new(), CodecKind::Binary),
        };
        Ok(WorkerParts {
            tables,
            partitions,
            codec,
            size_exceeded: self.size_exceeded,
        })
    }

    /// Produce the final table set for this worker alone.
    pub fn finish(self) -> Result<JobResult> {
        let status = if self.size_exceeded {
            JobStatus::SizeLimitExceeded
        } else {
            JobStatus::Completed
        };
        JobResult::assemble(vec![self.into_parts()?], status)
    }
}

/// One worker's mergeable output.
pub(crate) struct WorkerParts {
    pub tables: Vec<Table>,
    pub partitions: Vec<Partition>,
    pub codec: CodecKind,
    pub size_exceeded: bool,
}

/// One final output table: immutable schema plus a rows sequence ordered by
/// the table's comparer, consumable once.
pub struct FinalTable {
    schema: Arc<Schema>,
    rows: MergedRows,
    _partitions: Arc<PartitionSet>,
}

impl FinalTable {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Drain into memory. Mostly for tests and small results; exporters
    /// should iterate instead.
    pub fn collect_rows(self) -> Result<Vec<Row>> {
        self.collect()
    }
}

impl Iterator for FinalTable {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// The finished job: status plus one consumable table per schema.
pub struct JobResult {
    pub status: JobStatus,
    tables: Vec<FinalTable>,
}

impl JobResult {
    /// Reconcile worker parts into final tables. For every schema the merge
    /// sources are ordered worker by worker, each worker's partitions in
    /// write order followed by its in-memory snapshot, so "first written
    /// wins" follows stream order.
    pub(crate) fn assemble(parts: Vec<WorkerParts>, status: JobStatus) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Ok(JobResult {
                status,
                tables: Vec::new(),
            });
        };

        // All workers run the same wiring; verify instead of trusting it.
        let schemas: Vec<Arc<Schema>> =
            first.tables.iter().map(|t| Arc::clone(t.schema())).collect();
        for part in &parts {
            if part.tables.len() != schemas.len() {
                return Err(EngineError::SchemaConflict {
                    table: "<table set>".to_string(),
                });
            }
            for (schema, table) in schemas.iter().zip(&part.tables) {
                if table.schema().name() != schema.name()
                    || table.schema().fields() != schema.fields()
                {
                    return Err(EngineError::SchemaConflict {
                        table: table.schema().name().to_string(),
                    });
                }
            }
        }
        let codec = first.codec;

        let mut partitions_flat: Vec<Partition> = Vec::new();
        let mut partition_ranges: Vec<std::ops::Range<usize>> = Vec::new();
        let mut memory_tables: Vec<std::vec::IntoIter<Table>> = Vec::new();
        for part in parts {
            let start = partitions_flat.len();
            partitions_flat.extend(part.partitions);
            partition_ranges.push(start..partitions_flat.len());
            memory_tables.push(part.tables.into_iter());
        }
        let partition_set = Arc::new(PartitionSet::new(partitions_flat));

        let mut tables = Vec::with_capacity(schemas.len());
        for schema in &schemas {
            let comparer = RowComparer::new(schema);
            let fact_columns = schema.fact_columns().to_vec();

            let mut sources: Vec<RowSource> = Vec::new();
            for (worker, range) in partition_ranges.iter().enumerate() {
                for partition in &partition_set.partitions()[range.clone()] {
                    sources.push(Box::new(partition.open_cursor(schema.name(), codec)?));
                }
                if let Some(table) = memory_tables[worker].next() {
                    if !table.is_empty() {
                        sources.push(Box::new(table.into_rows().into_iter().map(Ok)));
                    }
                }
            }

            tables.push(FinalTable {
                schema: Arc::clone(schema),
                rows: merge_rows(sources, comparer, fact_columns),
                _partitions: Arc::clone(&partition_set),
            });
        }

        Ok(JobResult { status, tables })
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name()).collect()
    }

    /// Remove one table by name for consumption. A table can be taken (and
    /// its rows iterated) once.
    pub fn take_table(&mut self, name: &str) -> Option<FinalTable> {
        let idx = self.tables.iter().position(|t| t.name() == name)?;
        Some(self.tables.remove(idx))
    }

    pub fn into_tables(self) -> Vec<FinalTable> {
        self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mappers::{DimensionField, JsonField, OncePerField};
    use crate::schema::{Field, FieldRole};
    use crate::value::Datum;
    use serde_json::json;
    use std::collections::HashSet;

    /// 1000 synthetic visits across 37 groups, each with a fixed 3-call
    /// sub-sequence contributing 2 + 4 + 8 = 14.
    fn visit_items() -> Vec<Value> {
        (0..1000)
            .map(|i| {
                json!({
                    "id": i,
                    "group": format!("g{:02}", i % 37),
                    "bucket": i % 9,
                    "total": 14,
                    "calls": [{"value": 2}, {"value": 4}, {"value": 8}],
                })
            })
            .collect()
    }

    fn visit_tree() -> Vec<TableMapper> {
        vec![TableMapper::new("visits", ItemSelector::Identity)
            .with_field(JsonField::new(Field::new("id", FieldRole::Key), "/id"))
            .with_field(JsonField::new(Field::new("group", FieldRole::Label), "/group"))
            .with_child(
                TableMapper::new("visit_calls", ItemSelector::Path("/calls".into()))
                    .with_field(JsonField::new(Field::new("value", FieldRole::Fact), "/value"))
                    .with_field(OncePerField::new(
                        Field::new("visit_total", FieldRole::Fact),
                        "visits",
                        "/total",
                    )),
            )]
    }

    fn fact_sum(rows: &[Row], col: usize) -> i64 {
        rows.iter()
            .map(|r| match &r[col] {
                Datum::Int(i) => *i,
                other => panic!("expected int fact, got {other:?}"),
            })
            .sum()
    }

    #[test]
    fn test_visits_aggregate_in_memory() {
        let mut agg = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
        let status = agg.run(visit_items(), &Progress::new()).unwrap();
        assert_eq!(status, JobStatus::Completed);

        let mut result = agg.finish().unwrap();
        let visits = result.take_table("visits").unwrap();
        assert_eq!(visits.collect_rows().unwrap().len(), 1000);

        let calls = result.take_table("visit_calls").unwrap();
        let value_col = calls.schema().position("value").unwrap();
        let total_col = calls.schema().position("visit_total").unwrap();
        let rows = calls.collect_rows().unwrap();

        // The 3-call sub-sequences collapse onto their visit's row.
        assert_eq!(rows.len(), 1000);
        assert_eq!(fact_sum(&rows, value_col), 14000);
        // The visit-level total contributed once per visit, not once per call.
        assert_eq!(fact_sum(&rows, total_col), 14000);
    }

    #[test]
    fn test_referential_integrity() {
        let mut agg = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
        agg.run(visit_items(), &Progress::new()).unwrap();
        let mut result = agg.finish().unwrap();

        let visits = result.take_table("visits").unwrap();
        let id_col = visits.schema().position("id").unwrap();
        let ids: HashSet<Datum> = visits
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r[id_col].clone())
            .collect();

        let calls = result.take_table("visit_calls").unwrap();
        let fk_col = calls.schema().position("id").unwrap();
        for row in calls.collect_rows().unwrap() {
            assert!(ids.contains(&row[fk_col]));
        }
    }

    #[test]
    fn test_once_per_scope_for_any_fanout() {
        for n in 1..=5 {
            let calls: Vec<Value> = (0..n).map(|c| json!({"value": c})).collect();
            let item = json!({"id": 1, "total": 14, "calls": calls});

            let mut agg = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
            agg.run([item], &Progress::new()).unwrap();
            let mut result = agg.finish().unwrap();

            let calls_table = result.take_table("visit_calls").unwrap();
            let total_col = calls_table.schema().position("visit_total").unwrap();
            let rows = calls_table.collect_rows().unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][total_col], Datum::Int(14));
        }
    }

    #[test]
    fn test_dimension_table_and_references() {
        let tree = vec![TableMapper::new("visits", ItemSelector::Identity)
            .with_field(JsonField::new(Field::new("id", FieldRole::Key), "/id"))
            .with_field(DimensionField::new(
                "buckets",
                Field::new("bucket_key", FieldRole::Dimension),
                vec![(Field::new("bucket", FieldRole::Dimension), "/bucket".into())],
            ))];

        let mut agg = StreamAggregator::new(tree, &EngineConfig::default()).unwrap();
        agg.run(visit_items(), &Progress::new()).unwrap();
        let mut result = agg.finish().unwrap();

        let dim = result.take_table("buckets").unwrap();
        let hash_col = dim.schema().hash_key_column().unwrap();
        let dim_keys: HashSet<Datum> = dim
            .collect_rows()
            .unwrap()
            .iter()
            .map(|r| r[hash_col].clone())
            .collect();
        assert_eq!(dim_keys.len(), 9);

        let visits = result.take_table("visits").unwrap();
        let ref_col = visits.schema().position("bucket_key").unwrap();
        let rows = visits.collect_rows().unwrap();
        assert_eq!(rows.len(), 1000);
        let referenced: HashSet<Datum> = rows.iter().map(|r| r[ref_col].clone()).collect();
        assert_eq!(referenced, dim_keys);
    }

    #[test]
    fn test_flush_and_merge_match_in_memory_run() {
        let mut in_memory = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
        in_memory.run(visit_items(), &Progress::new()).unwrap();
        let mut expected = in_memory.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let spill_config = EngineConfig {
            flush_row_threshold: 50,
            spill_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let mut spilled = StreamAggregator::new(visit_tree(), &spill_config).unwrap();
        spilled.run(visit_items(), &Progress::new()).unwrap();
        let mut result = spilled.finish().unwrap();

        for name in ["visits", "visit_calls"] {
            let want = expected
                .take_table(name)
                .unwrap()
                .collect_rows()
                .unwrap();
            let got = result.take_table(name).unwrap().collect_rows().unwrap();
            assert_eq!(want, got, "table {name} diverged after spill+merge");
        }
    }

    #[test]
    fn test_size_limit_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            flush_row_threshold: 10,
            max_disk_bytes: Some(1),
            spill_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let mut agg = StreamAggregator::new(visit_tree(), &config).unwrap();
        let status = agg.run(visit_items(), &Progress::new()).unwrap();
        assert_eq!(status, JobStatus::SizeLimitExceeded);
        assert!(agg.items_processed() < 1000);
    }

    #[test]
    fn test_discarded_parent_produces_no_children() {
        // Items with sub-items but nothing for the parent row to map.
        let items = vec![json!({"calls": [{"value": 2}]})];
        let mut agg = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
        agg.run(items, &Progress::new()).unwrap();
        let mut result = agg.finish().unwrap();

        assert!(result
            .take_table("visits")
            .unwrap()
            .collect_rows()
            .unwrap()
            .is_empty());
        assert!(result
            .take_table("visit_calls")
            .unwrap()
            .collect_rows()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_progress_callback_counts_items() {
        use std::sync::atomic::{AtomicU64, Ordering};
        let seen = Arc::new(AtomicU64::new(0));
        let progress = {
            let seen = Arc::clone(&seen);
            Progress::new()
                .with_total(1000)
                .on_loaded(move |n| seen.store(n, Ordering::Relaxed))
        };

        let mut agg = StreamAggregator::new(visit_tree(), &EngineConfig::default()).unwrap();
        agg.run(visit_items(), &progress).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1000);
    }
}
