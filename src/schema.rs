//! Table schemas: fields, roles and relations.
//!
//! A schema is declared once during mapper wiring and frozen before any data
//! flows. Fields are canonically grouped `Key, Dimension, Label, Fact` (ties
//! broken by declaration order) and downstream row layout depends on that
//! grouping, so any change to the field list forces a full re-derivation.

use crate::error::{EngineError, Result};
use crate::value::Datum;

/// What a column means to the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldRole {
    /// Part of row identity (always, when any key exists).
    Key,
    /// Descriptive grouping column; identity when no keys are declared.
    Dimension,
    /// Carried text column, first-written value wins on merge.
    Label,
    /// Numeric/duration measure, summed on identity collision.
    Fact,
}

impl FieldRole {
    fn rank(self) -> u8 {
        match self {
            FieldRole::Key => 0,
            FieldRole::Dimension => 1,
            FieldRole::Label => 2,
            FieldRole::Fact => 3,
        }
    }
}

/// Explicit output ordering directive on a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Ascending,
    Descending,
}

/// One declared column. Immutable once the owning schema is derived.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub role: FieldRole,
    pub sort: Option<SortDir>,
    pub default: Datum,
}

impl Field {
    pub fn new(name: impl Into<String>, role: FieldRole) -> Self {
        Field {
            name: name.into(),
            role,
            sort: None,
            default: Datum::Null,
        }
    }

    pub fn with_sort(mut self, dir: SortDir) -> Self {
        self.sort = Some(dir);
        self
    }

    pub fn with_default(mut self, default: Datum) -> Self {
        self.default = default;
        self
    }
}

/// How one table relates to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Parent,
    Child,
    Dimension,
    DimensionReference,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub kind: RelationKind,
    pub table: String,
}

/// Name of the hidden surrogate key column added by [`Schema::ensure_hash_key`].
pub const HASH_KEY_FIELD: &str = "_key_hash";

/// An ordered, role-grouped field list for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
    key_columns: Vec<usize>,
    dimension_columns: Vec<usize>,
    label_columns: Vec<usize>,
    fact_columns: Vec<usize>,
    hash_key: Option<usize>,
    relations: Vec<Relation>,
}

impl Schema {
    /// Derive a schema from declared fields.
    ///
    /// Rejects duplicate field names and tables with neither Key nor
    /// Dimension columns (row identity would be undefined). Dimension tables
    /// without a natural key go through [`Schema::ensure_hash_key`] instead.
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Result<Self> {
        let mut schema = Schema {
            name: name.into(),
            fields,
            key_columns: Vec::new(),
            dimension_columns: Vec::new(),
            label_columns: Vec::new(),
            fact_columns: Vec::new(),
            hash_key: None,
            relations: Vec::new(),
        };
        schema.derive()?;
        if schema.key_columns.is_empty() && schema.dimension_columns.is_empty() {
            return Err(EngineError::UndefinedIdentity {
                table: schema.name,
            });
        }
        Ok(schema)
    }

    /// Re-derive grouping and index sets from the current field list.
    fn derive(&mut self) -> Result<()> {
        // Stable sort keeps declaration order within each role group.
        self.fields.sort_by_key(|f| f.role.rank());

        self.key_columns.clear();
        self.dimension_columns.clear();
        self.label_columns.clear();
        self.fact_columns.clear();

        for (idx, field) in self.fields.iter().enumerate() {
            if self.fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(EngineError::DuplicateField {
                    table: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            match field.role {
                FieldRole::Key => self.key_columns.push(idx),
                FieldRole::Dimension => self.dimension_columns.push(idx),
                FieldRole::Label => self.label_columns.push(idx),
                FieldRole::Fact => self.fact_columns.push(idx),
            }
        }

        self.hash_key = self
            .fields
            .iter()
            .position(|f| f.name == HASH_KEY_FIELD);
        Ok(())
    }

    /// Synthesize a hidden hash-surrogate Key field when no natural key
    /// exists, then re-derive. No-op when a key is already declared.
    pub fn ensure_hash_key(&mut self) -> Result<()> {
        if !self.key_columns.is_empty() {
            return Ok(());
        }
        self.fields.push(Field::new(HASH_KEY_FIELD, FieldRole::Key));
        self.derive()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    pub fn dimension_columns(&self) -> &[usize] {
        &self.dimension_columns
    }

    pub fn label_columns(&self) -> &[usize] {
        &self.label_columns
    }

    pub fn fact_columns(&self) -> &[usize] {
        &self.fact_columns
    }

    /// Columns that determine row equality: keys when any exist, else
    /// dimensions.
    pub fn identity_columns(&self) -> &[usize] {
        if self.key_columns.is_empty() {
            &self.dimension_columns
        } else {
            &self.key_columns
        }
    }

    /// The hidden surrogate key column, when one was synthesized.
    pub fn hash_key_column(&self) -> Option<usize> {
        self.hash_key
    }

    /// Columns feeding the surrogate hash: every Key and Dimension column in
    /// schema order, excluding the hash column itself.
    pub fn hash_source_columns(&self) -> Vec<usize> {
        self.key_columns
            .iter()
            .chain(self.dimension_columns.iter())
            .copied()
            .filter(|c| Some(*c) != self.hash_key)
            .collect()
    }

    /// Default-valued row for this schema.
    pub fn empty_row(&self) -> Vec<Datum> {
        self.fields.iter().map(|f| f.default.clone()).collect()
    }

    pub fn add_relation(&mut self, kind: RelationKind, table: impl Into<String>) {
        self.relations.push(Relation {
            kind,
            table: table.into(),
        });
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }
}
