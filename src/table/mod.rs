//! Aggregating table stores and their supporting pieces.

pub mod builder;
pub mod comparer;
pub mod window;

pub use builder::{Table, TableBuilder, TableId, TableRegistry};
pub use comparer::{RowComparer, RowKey};
pub use window::{Contribution, MapperSet, RowWindow};
