use thiserror::Error;

/// Errors that abort a job.
///
/// Everything here is fatal by design: a half-built dimension table is worse
/// than a failed job. Threshold crossings and the disk size limit are *not*
/// errors — they surface as [`crate::stream::JobStatus`] values instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A field mapper failed while producing values for a row.
    #[error("field mapper failed: {0}")]
    Mapper(#[source] anyhow::Error),

    /// A child row was built while its parent table had no current row.
    #[error("table '{table}': child row inserted with no current parent row")]
    MissingParentRow { table: String },

    /// Two tables share a name but disagree on schema.
    #[error("table '{table}': conflicting schemas for the same table name")]
    SchemaConflict { table: String },

    /// A table was declared with neither Key nor Dimension fields.
    #[error("table '{table}': no key or dimension fields, row identity is undefined")]
    UndefinedIdentity { table: String },

    /// A field name occurs twice within one table.
    #[error("table '{table}': duplicate field '{field}'")]
    DuplicateField { table: String, field: String },

    /// Fact summation was asked to combine incompatible value kinds.
    #[error("fact column {column}: cannot sum {left} with {right}")]
    FactType {
        column: usize,
        left: &'static str,
        right: &'static str,
    },

    /// A deferred contribution was placed on a non-Fact column.
    #[error("table '{table}': deferred value on non-fact column {column}")]
    DeferredOnNonFact { table: String, column: usize },

    /// A partition file failed to decode.
    #[error("partition decode error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
