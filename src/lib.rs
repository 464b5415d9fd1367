//! # Smelter - Streaming Aggregation Engine
//!
//! Melts a stream of hierarchical JSON records — a root item with nested
//! collections of sub-items — into a set of related, deduplicated tables (a
//! small star schema) under configurable memory and disk bounds.
//!
//! ## How it works
//!
//! - A tree of [`TableMapper`]s drives row construction per item, parent
//!   first; child rows carry their parent's key and are never built for a
//!   parent row that produced no data.
//! - Rows are deduplicated by declared identity (Key columns, else Dimension
//!   columns); Fact columns are summed on collision.
//! - When in-memory volume crosses a threshold, tables spill to immutable
//!   disk partitions; partitions and worker results are reconciled by a
//!   k-way external merge, so memory use scales with the bounds, not the
//!   input.
//! - N workers can consume one bounded queue in parallel, each with fully
//!   private state, merged after the fact.
//!
//! ## Quick Start
//!
//! ```rust
//! use smelter::{
//!     aggregate, EngineConfig, Field, FieldRole, ItemSelector, JsonField, TableMapper,
//! };
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let tree = vec![TableMapper::new("orders", ItemSelector::Identity)
//!     .with_field(JsonField::new(Field::new("id", FieldRole::Key), "/id"))
//!     .with_field(JsonField::new(Field::new("amount", FieldRole::Fact), "/amount"))];
//!
//! let items = vec![
//!     json!({"id": 1, "amount": 10}),
//!     json!({"id": 1, "amount": 5}),
//!     json!({"id": 2, "amount": 7}),
//! ];
//!
//! let mut result = aggregate(tree, items, &EngineConfig::default())?;
//! let orders = result.take_table("orders").unwrap();
//! let rows = orders.collect_rows()?;
//! assert_eq!(rows.len(), 2); // id 1 merged, amounts summed
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod mapper;
pub mod mappers;
pub mod schema;
pub mod scope;
pub mod stream;
pub mod table;
pub mod value;

// Re-export the types most jobs touch.
pub use config::EngineConfig;
pub use error::EngineError;
pub use mapper::{FieldMapper, ItemSelector, TableMapper};
pub use mappers::{DimensionField, IndexField, IndexOrigin, JsonField, OncePerField};
pub use schema::{Field, FieldRole, Relation, RelationKind, Schema, SortDir};
pub use scope::{Occurrence, ScopeContext, ScopeTree};
pub use stream::{
    run_parallel, CancelToken, CodecKind, FinalTable, JobResult, JobStatus, Progress,
    StreamAggregator,
};
pub use table::{RowComparer, RowWindow, Table, TableRegistry};
pub use value::{Datum, Row};

use serde_json::Value;

/// Main entry point: run one single-worker aggregation over an item stream.
pub fn aggregate<I>(
    mappers: Vec<TableMapper>,
    items: I,
    config: &EngineConfig,
) -> error::Result<JobResult>
where
    I: IntoIterator<Item = Value>,
{
    let mut aggregator = StreamAggregator::new(mappers, config)?;
    aggregator.run(items, &Progress::new())?;
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_aggregation() {
        let tree = vec![TableMapper::new("orders", ItemSelector::Identity)
            .with_field(JsonField::new(Field::new("id", FieldRole::Key), "/id"))
            .with_field(JsonField::new(
                Field::new("amount", FieldRole::Fact),
                "/amount",
            ))];

        let items = vec![
            json!({"id": 1, "amount": 10}),
            json!({"id": 1, "amount": 5}),
            json!({"id": 2, "amount": 7}),
        ];

        let mut result = aggregate(tree, items, &EngineConfig::default()).unwrap();
        assert_eq!(result.status, JobStatus::Completed);

        let orders = result.take_table("orders").unwrap();
        let amount = orders.schema().position("amount").unwrap();
        let rows = orders.collect_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][amount], Datum::Int(15));
        assert_eq!(rows[1][amount], Datum::Int(7));
    }
}
