//! In-memory aggregating table stores.
//!
//! A [`TableBuilder`] owns the rows of one table between flushes: rows are
//! deduplicated by identity, facts are summed on collision, surrogate keys
//! are synthesized, and parent key values are injected into child rows at the
//! moment of insertion. The [`TableRegistry`] owns every builder of a worker
//! and wires parent/child and dimension links between them.

use crate::error::{EngineError, Result};
use crate::mapper::FieldMapper;
use crate::schema::{Field, FieldRole, RelationKind, Schema};
use crate::scope::{Occurrence, ScopeContext};
use crate::table::comparer::{RowComparer, RowKey};
use crate::table::window::{Contribution, MapperSet};
use crate::value::{fnv1a32, Datum, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Handle to a table within one worker's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(usize);

/// An immutable, finalized snapshot of one table: schema plus rows sorted by
/// the table's comparer.
#[derive(Debug, Clone)]
pub struct Table {
    schema: Arc<Schema>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Arc<Schema>, rows: Vec<Row>) -> Self {
        Table { schema, rows }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

/// Aggregating row store for one table.
pub struct TableBuilder {
    schema: Arc<Schema>,
    comparer: RowComparer,
    mappers: MapperSet,
    rows: HashMap<RowKey, Row>,
    current: Option<RowKey>,
    parent: Option<TableId>,
    /// Columns of this table receiving the parent's identity values, in the
    /// parent's identity-column order.
    fk_columns: Vec<usize>,
    /// (ancestor occurrence, destination identity, column) triples already
    /// resolved. Survives flushes — resolution is per worker lifetime.
    once_seen: HashSet<(Occurrence, RowKey, usize)>,
}

impl TableBuilder {
    fn new(
        schema: Schema,
        mappers: MapperSet,
        parent: Option<TableId>,
        fk_columns: Vec<usize>,
    ) -> Self {
        let comparer = RowComparer::new(&schema);
        TableBuilder {
            schema: Arc::new(schema),
            comparer,
            mappers,
            rows: HashMap::new(),
            current: None,
            parent,
            fk_columns,
            once_seen: HashSet::new(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn comparer(&self) -> &RowComparer {
        &self.comparer
    }

    pub fn parent(&self) -> Option<TableId> {
        self.parent
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Identity values of the row the last insertion landed on, for FK
    /// injection into child rows.
    pub fn current_key_values(&self) -> Option<Vec<Datum>> {
        self.current.as_ref().map(|key| key.0.clone())
    }

    /// Build a row from the current scope via the composed field mappers.
    ///
    /// Returns `Ok(false)` when no mapper produced a value — the row is
    /// discarded, which is "no data", not an error. `fk_values` must carry
    /// the parent's current identity values whenever this table has a parent.
    pub fn add_row_from_context(
        &mut self,
        ctx: &ScopeContext<'_>,
        fk_values: Option<&[Datum]>,
    ) -> Result<bool> {
        let mut cells: Vec<Contribution> = self
            .schema
            .fields()
            .iter()
            .map(|f| Contribution::Immediate(f.default.clone()))
            .collect();

        let mut set = std::mem::replace(&mut self.mappers, MapperSet::empty());
        let produced = set.set_values(ctx, &mut cells);
        self.mappers = set;

        if !produced? {
            return Ok(false);
        }
        self.insert_cells(cells, fk_values)?;
        Ok(true)
    }

    /// Insert a fully materialized row (dimension rows, merge re-feeds).
    /// Runs the same surrogate-key and dedup pipeline, minus mappers and FK.
    pub fn insert_row(&mut self, row: Row) -> Result<()> {
        let cells = row.into_iter().map(Contribution::Immediate).collect();
        self.insert_cells(cells, None)
    }

    /// The insertion pipeline: FK injection, surrogate key, deferred
    /// resolution, identity probe with fact summation.
    fn insert_cells(
        &mut self,
        mut cells: Vec<Contribution>,
        fk_values: Option<&[Datum]>,
    ) -> Result<()> {
        if let Some(values) = fk_values {
            for (&col, value) in self.fk_columns.iter().zip(values) {
                cells[col] = Contribution::Immediate(value.clone());
            }
        }

        if let Some(hash_col) = self.schema.hash_key_column() {
            let source = self.schema.hash_source_columns();
            let mut feed = Vec::with_capacity(source.len());
            for col in source {
                match cells[col].immediate() {
                    Some(v) => feed.push(v.clone()),
                    None => {
                        return Err(EngineError::DeferredOnNonFact {
                            table: self.schema.name().to_string(),
                            column: col,
                        })
                    }
                }
            }
            cells[hash_col] = Contribution::Immediate(Datum::Int(i64::from(fnv1a32(feed.iter()))));
        }

        // Identity must be concrete before deferred cells can resolve
        // against it.
        let mut identity = Vec::with_capacity(self.comparer.identity_columns().len());
        for &col in self.comparer.identity_columns() {
            match cells[col].immediate() {
                Some(v) => identity.push(v.clone()),
                None => {
                    return Err(EngineError::DeferredOnNonFact {
                        table: self.schema.name().to_string(),
                        column: col,
                    })
                }
            }
        }
        let key = RowKey(identity);

        let fact_columns = self.schema.fact_columns();
        let mut row: Row = Vec::with_capacity(cells.len());
        for (col, cell) in cells.into_iter().enumerate() {
            let value = match cell {
                Contribution::Immediate(v) => v,
                Contribution::OncePer { occurrence, value } => {
                    if !fact_columns.contains(&col) {
                        return Err(EngineError::DeferredOnNonFact {
                            table: self.schema.name().to_string(),
                            column: col,
                        });
                    }
                    if self.once_seen.insert((occurrence, key.clone(), col)) {
                        value
                    } else {
                        Datum::Null
                    }
                }
            };
            row.push(value);
        }

        match self.rows.get_mut(&key) {
            Some(existing) => {
                for &col in fact_columns {
                    let incoming = std::mem::replace(&mut row[col], Datum::Null);
                    existing[col].sum(&incoming, col)?;
                }
                // Key, dimension and label columns keep first-written values.
            }
            None => {
                self.rows.insert(key.clone(), row);
            }
        }
        self.current = Some(key);
        Ok(())
    }

    /// Close out the current flush: one batched post-process pass, then an
    /// immutable snapshot sorted by the comparer. The builder is reusable
    /// afterwards; only the row store and current-row tracking reset.
    pub fn finalize(&mut self) -> Result<Table> {
        let mut rows: Vec<Row> = self.rows.drain().map(|(_, row)| row).collect();
        self.current = None;

        let schema = Arc::clone(&self.schema);
        let mut set = std::mem::replace(&mut self.mappers, MapperSet::empty());
        let post = set.for_each_mapper(|m| m.post_process_rows(&schema, &mut rows));
        self.mappers = set;
        post?;

        let comparer = &self.comparer;
        rows.sort_by(|a, b| comparer.compare(a, b));
        Ok(Table::new(schema, rows))
    }
}

/// Every table builder of one worker, addressable by id and name.
pub struct TableRegistry {
    builders: Vec<TableBuilder>,
    names: HashMap<String, TableId>,
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry {
            builders: Vec::new(),
            names: HashMap::new(),
        }
    }

    /// Register a table fed by field mappers.
    ///
    /// Declared fields are collected from the mappers (their one
    /// `declare_fields` call); when `parent` is given, the parent's identity
    /// fields are appended as Key-role FK columns (renamed
    /// `<parent>_<field>` on a name clash) and both schemas get the
    /// parent/child relation recorded.
    pub fn add_table(
        &mut self,
        name: &str,
        mappers: Vec<Box<dyn FieldMapper>>,
        parent: Option<TableId>,
    ) -> Result<TableId> {
        let mut fields: Vec<Field> = Vec::new();
        let mut mapper_fields: Vec<Vec<String>> = Vec::new();
        for mapper in &mappers {
            let declared = mapper.declare_fields();
            mapper_fields.push(declared.iter().map(|f| f.name.clone()).collect());
            fields.extend(declared);
        }

        let mut fk_names: Vec<String> = Vec::new();
        if let Some(parent_id) = parent {
            let parent_builder = &self.builders[parent_id.0];
            let parent_schema = parent_builder.schema();
            let parent_name = parent_schema.name().to_string();
            for &col in parent_schema.identity_columns() {
                let source = &parent_schema.fields()[col];
                let fk_name = if fields.iter().any(|f| f.name == source.name) {
                    format!("{}_{}", parent_name, source.name)
                } else {
                    source.name.clone()
                };
                fields.push(Field::new(fk_name.clone(), FieldRole::Key));
                fk_names.push(fk_name);
            }
        }

        let mut schema = Schema::new(name, fields)?;
        if let Some(parent_id) = parent {
            let parent_name = self.builders[parent_id.0].schema().name().to_string();
            schema.add_relation(RelationKind::Parent, parent_name);
        }

        if let Some(existing) = self.names.get(name) {
            // Same name must mean the same structure; relations may differ.
            if self.builders[existing.0].schema().fields() != schema.fields() {
                return Err(EngineError::SchemaConflict {
                    table: name.to_string(),
                });
            }
            return Ok(*existing);
        }

        let windows = Self::windows_for(&schema, &mapper_fields);
        let fk_columns = fk_names
            .iter()
            .map(|n| schema.position(n).expect("fk field present"))
            .collect();

        let id = TableId(self.builders.len());
        if let Some(parent_id) = parent {
            // Record the back relation on the parent.
            let child_name = schema.name().to_string();
            let parent_schema = Arc::make_mut(self.builders[parent_id.0].schema_arc_mut());
            parent_schema.add_relation(RelationKind::Child, child_name);
        }
        self.builders.push(TableBuilder::new(
            schema,
            MapperSet::new(mappers, windows),
            parent,
            fk_columns,
        ));
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register a dimension table (no mappers — rows arrive via
    /// [`TableRegistry::insert_row`]). A hash-surrogate key is synthesized
    /// when no natural key is declared, and the dimension/reference relation
    /// pair is recorded.
    pub fn add_dimension_table(
        &mut self,
        name: &str,
        fields: Vec<Field>,
        owner: TableId,
    ) -> Result<TableId> {
        let mut schema = Schema::new(name, fields)?;
        schema.ensure_hash_key()?;
        let owner_name = self.builders[owner.0].schema().name().to_string();
        schema.add_relation(RelationKind::Dimension, owner_name);

        if let Some(existing) = self.names.get(name).copied() {
            if self.builders[existing.0].schema().fields() != schema.fields() {
                return Err(EngineError::SchemaConflict {
                    table: name.to_string(),
                });
            }
            let dim_name = schema.name().to_string();
            let owner_schema = Arc::make_mut(self.builders[owner.0].schema_arc_mut());
            if !owner_schema
                .relations()
                .iter()
                .any(|r| r.kind == RelationKind::DimensionReference && r.table == dim_name)
            {
                owner_schema.add_relation(RelationKind::DimensionReference, dim_name);
            }
            return Ok(existing);
        }

        let dim_name = schema.name().to_string();
        let owner_schema = Arc::make_mut(self.builders[owner.0].schema_arc_mut());
        owner_schema.add_relation(RelationKind::DimensionReference, dim_name);

        let id = TableId(self.builders.len());
        self.builders
            .push(TableBuilder::new(schema, MapperSet::empty(), None, Vec::new()));
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Run `initialize` then `initialize_related_tables` for a table's
    /// mappers, giving them registry access.
    pub fn initialize_mappers(&mut self, id: TableId) -> Result<()> {
        let mut set = std::mem::replace(&mut self.builders[id.0].mappers, MapperSet::empty());
        let result = set.for_each_mapper(|m| {
            m.initialize(self)?;
            m.initialize_related_tables(self, id)
        });
        self.builders[id.0].mappers = set;
        result
    }

    /// Hand every mapper's buffered related-table rows to their builders.
    pub fn drain_related(&mut self) -> Result<()> {
        for idx in 0..self.builders.len() {
            let mut set = std::mem::replace(&mut self.builders[idx].mappers, MapperSet::empty());
            let result = set.for_each_mapper(|m| m.drain_related(self));
            self.builders[idx].mappers = set;
            result?;
        }
        Ok(())
    }

    /// Build and insert a row for `id` from the current scope, injecting the
    /// parent's current identity values when the table has a parent.
    pub fn add_row_from_context(&mut self, id: TableId, ctx: &ScopeContext<'_>) -> Result<bool> {
        let fk_values = match self.builders[id.0].parent {
            Some(parent_id) => Some(
                self.builders[parent_id.0]
                    .current_key_values()
                    .ok_or_else(|| EngineError::MissingParentRow {
                        table: self.builders[id.0].schema.name().to_string(),
                    })?,
            ),
            None => None,
        };
        self.builders[id.0].add_row_from_context(ctx, fk_values.as_deref())
    }

    pub fn insert_row(&mut self, id: TableId, row: Row) -> Result<()> {
        self.builders[id.0].insert_row(row)
    }

    pub fn builder(&self, id: TableId) -> &TableBuilder {
        &self.builders[id.0]
    }

    pub fn lookup(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }

    pub fn table_ids(&self) -> impl Iterator<Item = TableId> {
        (0..self.builders.len()).map(TableId)
    }

    /// Total in-memory rows across all tables — the flush trigger input.
    pub fn total_rows(&self) -> usize {
        self.builders.iter().map(|b| b.row_count()).sum()
    }

    /// Finalize every table, emitting one snapshot per schema and clearing
    /// the in-memory stores.
    pub fn finalize_all(&mut self) -> Result<Vec<Table>> {
        self.builders.iter_mut().map(|b| b.finalize()).collect()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    fn schema_arc_mut(&mut self) -> &mut Arc<Schema> {
        &mut self.schema
    }
}

impl TableRegistry {
    fn windows_for(schema: &Schema, mapper_fields: &[Vec<String>]) -> Vec<Vec<usize>> {
        mapper_fields
            .iter()
            .map(|names| {
                names
                    .iter()
                    .map(|n| schema.position(n).expect("declared field present"))
                    .collect()
            })
            .collect()
    }
}
