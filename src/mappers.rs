//! Built-in field mappers.
//!
//! These cover the common cases a job wires together: pulling a JSON value
//! out of the current object, numbering items by scope, contributing a fact
//! once per ancestor object, and maintaining a hash-keyed dimension table.
//! Anything fancier implements [`FieldMapper`] directly.

use crate::error::Result;
use crate::mapper::FieldMapper;
use crate::schema::Field;
use crate::scope::ScopeContext;
use crate::table::builder::{TableId, TableRegistry};
use crate::table::window::RowWindow;
use crate::value::{fnv1a32, Datum, Row};

/// Extracts one value from the scope's current object by JSON pointer.
///
/// Declines (leaving the declared default) when the pointer is missing or
/// null — "no data" never forces a row.
pub struct JsonField {
    field: Field,
    pointer: String,
}

impl JsonField {
    pub fn new(field: Field, pointer: impl Into<String>) -> Self {
        JsonField {
            field,
            pointer: pointer.into(),
        }
    }
}

impl FieldMapper for JsonField {
    fn declare_fields(&self) -> Vec<Field> {
        vec![self.field.clone()]
    }

    fn set_values(&mut self, ctx: &ScopeContext<'_>, window: &mut RowWindow<'_>) -> Result<bool> {
        let Some(item) = ctx.item() else {
            return Ok(false);
        };
        match item.pointer(&self.pointer) {
            None | Some(serde_json::Value::Null) => Ok(false),
            Some(value) => {
                window.set(0, Datum::from_json(value));
                Ok(true)
            }
        }
    }
}

/// Where an [`IndexField`] counts from.
#[derive(Debug, Clone)]
pub enum IndexOrigin {
    /// Sequence over the whole stream.
    Global,
    /// Sequence under the immediate parent scope.
    Parent,
    /// Sequence under the nearest ancestor scope of this kind.
    Kind(String),
}

/// Writes the scope's 0-based sequence number as an Int column.
pub struct IndexField {
    field: Field,
    origin: IndexOrigin,
}

impl IndexField {
    pub fn new(field: Field, origin: IndexOrigin) -> Self {
        IndexField { field, origin }
    }
}

impl FieldMapper for IndexField {
    fn declare_fields(&self) -> Vec<Field> {
        vec![self.field.clone()]
    }

    fn set_values(&mut self, ctx: &ScopeContext<'_>, window: &mut RowWindow<'_>) -> Result<bool> {
        let index = match &self.origin {
            IndexOrigin::Global => ctx.global_index(),
            IndexOrigin::Parent => ctx.child_index(),
            IndexOrigin::Kind(kind) => ctx.index_of(kind),
        };
        match index {
            Some(i) => {
                window.set(0, Datum::Int(i as i64));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A fact read from the nearest ancestor of a given kind, contributed to the
/// destination row only once per ancestor object.
///
/// The classic case: a visit-level total on a row that several of the
/// visit's sub-items map to — the total must not multiply by the number of
/// sub-items.
pub struct OncePerField {
    field: Field,
    ancestor: String,
    pointer: String,
}

impl OncePerField {
    pub fn new(field: Field, ancestor: impl Into<String>, pointer: impl Into<String>) -> Self {
        OncePerField {
            field,
            ancestor: ancestor.into(),
            pointer: pointer.into(),
        }
    }
}

impl FieldMapper for OncePerField {
    fn declare_fields(&self) -> Vec<Field> {
        vec![self.field.clone()]
    }

    fn set_values(&mut self, ctx: &ScopeContext<'_>, window: &mut RowWindow<'_>) -> Result<bool> {
        let Some(occurrence) = ctx.occurrence_of(&self.ancestor) else {
            return Ok(false);
        };
        let Some(object) = ctx.current_of(&self.ancestor) else {
            return Ok(false);
        };
        match object.pointer(&self.pointer) {
            None | Some(serde_json::Value::Null) => Ok(false),
            Some(value) => {
                window.set_once_per(0, occurrence, Datum::from_json(value));
                Ok(true)
            }
        }
    }
}

/// Maintains a hash-keyed dimension table and writes the surrogate key into
/// the owning row.
///
/// The surrogate is a pure function of the dimension values, so the owning
/// row never waits on the dimension insert: dimension rows are buffered and
/// drained into their builder after each item.
pub struct DimensionField {
    table: String,
    ref_field: Field,
    columns: Vec<(Field, String)>,
    dim_id: Option<TableId>,
    positions: Vec<usize>,
    hash_source: Vec<usize>,
    row_len: usize,
    pending: Vec<Row>,
}

impl DimensionField {
    /// `ref_field` is the column written into the owning table (typically a
    /// Dimension-role Int); `columns` are the dimension table's fields with
    /// the JSON pointers they load from.
    pub fn new(
        table: impl Into<String>,
        ref_field: Field,
        columns: Vec<(Field, String)>,
    ) -> Self {
        DimensionField {
            table: table.into(),
            ref_field,
            columns,
            dim_id: None,
            positions: Vec::new(),
            hash_source: Vec::new(),
            row_len: 0,
            pending: Vec::new(),
        }
    }
}

impl FieldMapper for DimensionField {
    fn declare_fields(&self) -> Vec<Field> {
        vec![self.ref_field.clone()]
    }

    fn initialize_related_tables(
        &mut self,
        registry: &mut TableRegistry,
        owner: TableId,
    ) -> Result<()> {
        let fields: Vec<Field> = self.columns.iter().map(|(f, _)| f.clone()).collect();
        let id = registry.add_dimension_table(&self.table, fields, owner)?;
        let schema = registry.builder(id).schema();
        self.positions = self
            .columns
            .iter()
            .map(|(f, _)| schema.position(&f.name).expect("declared dimension field"))
            .collect();
        self.hash_source = schema.hash_source_columns();
        self.row_len = schema.len();
        self.dim_id = Some(id);
        Ok(())
    }

    fn set_values(&mut self, ctx: &ScopeContext<'_>, window: &mut RowWindow<'_>) -> Result<bool> {
        let Some(item) = ctx.item() else {
            return Ok(false);
        };

        let mut row: Row = vec![Datum::Null; self.row_len];
        let mut any = false;
        for ((_, pointer), &position) in self.columns.iter().zip(&self.positions) {
            if let Some(value) = item.pointer(pointer) {
                if !value.is_null() {
                    row[position] = Datum::from_json(value);
                    any = true;
                }
            }
        }
        if !any {
            return Ok(false);
        }

        let surrogate = fnv1a32(self.hash_source.iter().map(|&c| &row[c]));
        window.set(0, Datum::Int(i64::from(surrogate)));
        self.pending.push(row);
        Ok(true)
    }

    fn drain_related(&mut self, registry: &mut TableRegistry) -> Result<()> {
        if let Some(id) = self.dim_id {
            for row in self.pending.drain(..) {
                registry.insert_row(id, row)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldRole;
    use crate::scope::ScopeTree;
    use crate::table::window::Contribution;
    use serde_json::json;

    #[test]
    fn test_json_field_extracts_and_declines() {
        let mut tree = ScopeTree::new();
        let scope = tree.add_child(tree.root(), "visit");
        tree.set(scope, json!({"spent": 12, "gone": null}));
        let ctx = ScopeContext::new(&tree, scope);

        let mut cells = vec![Contribution::Immediate(Datum::Null)];
        let columns = [0usize];

        let mut present = JsonField::new(Field::new("spent", FieldRole::Fact), "/spent");
        let mut window = RowWindow::new(&mut cells, &columns);
        assert!(present.set_values(&ctx, &mut window).unwrap());
        assert_eq!(cells[0], Contribution::Immediate(Datum::Int(12)));

        let mut cells = vec![Contribution::Immediate(Datum::Null)];
        let mut absent = JsonField::new(Field::new("x", FieldRole::Fact), "/missing");
        let mut window = RowWindow::new(&mut cells, &columns);
        assert!(!absent.set_values(&ctx, &mut window).unwrap());

        let mut cells = vec![Contribution::Immediate(Datum::Null)];
        let mut null = JsonField::new(Field::new("gone", FieldRole::Fact), "/gone");
        let mut window = RowWindow::new(&mut cells, &columns);
        assert!(!null.set_values(&ctx, &mut window).unwrap());
    }

    #[test]
    fn test_index_field_counts_per_ancestor() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        let call = tree.add_child(visit, "call");

        tree.set(visit, json!({"id": 1}));
        tree.set(call, json!({}));
        tree.set(call, json!({}));

        let ctx = ScopeContext::new(&tree, call);
        let mut cells = vec![Contribution::Immediate(Datum::Null)];
        let columns = [0usize];
        let mut field = IndexField::new(
            Field::new("n", FieldRole::Key),
            IndexOrigin::Kind("visit".into()),
        );
        let mut window = RowWindow::new(&mut cells, &columns);
        assert!(field.set_values(&ctx, &mut window).unwrap());
        assert_eq!(cells[0], Contribution::Immediate(Datum::Int(1)));
    }

    #[test]
    fn test_once_per_field_defers() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        let call = tree.add_child(visit, "call");
        tree.set(visit, json!({"total": 14}));
        tree.set(call, json!({}));

        let ctx = ScopeContext::new(&tree, call);
        let occurrence = ctx.occurrence_of("visit").unwrap();
        let mut cells = vec![Contribution::Immediate(Datum::Null)];
        let columns = [0usize];
        let mut field = OncePerField::new(Field::new("total", FieldRole::Fact), "visit", "/total");
        let mut window = RowWindow::new(&mut cells, &columns);
        assert!(field.set_values(&ctx, &mut window).unwrap());
        assert_eq!(
            cells[0],
            Contribution::OncePer {
                occurrence,
                value: Datum::Int(14)
            }
        );
    }

    #[test]
    fn test_dimension_field_registers_and_buffers() {
        let mut registry = TableRegistry::new();
        let owner = registry
            .add_table(
                "visits",
                vec![Box::new(JsonField::new(
                    Field::new("id", FieldRole::Key),
                    "/id",
                ))],
                None,
            )
            .unwrap();

        let mut dim = DimensionField::new(
            "groups",
            Field::new("group_key", FieldRole::Dimension),
            vec![(Field::new("group", FieldRole::Dimension), "/group".into())],
        );
        dim.initialize_related_tables(&mut registry, owner).unwrap();
        let dim_id = registry.lookup("groups").unwrap();

        let mut tree = ScopeTree::new();
        let scope = tree.add_child(tree.root(), "visit");

        let mut keys = Vec::new();
        for g in ["a", "b", "a"] {
            tree.set(scope, json!({"group": g}));
            let ctx = ScopeContext::new(&tree, scope);
            let mut cells = vec![Contribution::Immediate(Datum::Null)];
            let columns = [0usize];
            let mut window = RowWindow::new(&mut cells, &columns);
            assert!(dim.set_values(&ctx, &mut window).unwrap());
            keys.push(cells[0].immediate().unwrap().clone());
        }
        // Same group value, same surrogate.
        assert_eq!(keys[0], keys[2]);
        assert_ne!(keys[0], keys[1]);

        dim.drain_related(&mut registry).unwrap();
        assert_eq!(registry.builder(dim_id).row_count(), 2);

        // Surrogate in the dimension rows matches the reference written to
        // the owner.
        let tables = registry.finalize_all().unwrap();
        let table = tables
            .into_iter()
            .find(|t| t.schema().name() == "groups")
            .unwrap();
        let hash_col = table.schema().hash_key_column().unwrap();
        let mut dim_keys: Vec<Datum> =
            table.rows().iter().map(|r| r[hash_col].clone()).collect();
        dim_keys.sort();
        let mut referenced = keys.clone();
        referenced.sort();
        referenced.dedup();
        assert_eq!(dim_keys, referenced);
    }
}
