//! The mapper contract: how field values and table trees are declared.
//!
//! Configuration parsing lives outside this crate; whatever builds the job
//! hands the engine a tree of [`TableMapper`]s carrying [`FieldMapper`]
//! implementations. The engine invokes the contract in a fixed order —
//! `declare_fields` (once, during wiring), `initialize`,
//! `initialize_related_tables`, then `set_values` per candidate row, with
//! `drain_related` after each item and `post_process_rows` per flush — and
//! never interprets configuration syntax itself.

use crate::error::Result;
use crate::schema::{Field, Schema};
use crate::scope::ScopeContext;
use crate::table::builder::{TableId, TableRegistry};
use crate::table::window::RowWindow;
use crate::value::Row;
use serde_json::Value;
use std::fmt;

/// A provider of values for a disjoint set of columns in one table.
///
/// Implementations are frozen after initialization; `set_values` runs once
/// per candidate row against a private window over the shared row buffer.
/// Returning `Ok(false)` means "nothing to contribute for this item" — the
/// columns keep their declared defaults. Returning an error is fatal to the
/// whole job.
pub trait FieldMapper: Send {
    /// Columns this mapper owns. Called exactly once, during wiring.
    fn declare_fields(&self) -> Vec<Field>;

    fn initialize(&mut self, _registry: &mut TableRegistry) -> Result<()> {
        Ok(())
    }

    /// Register any related tables (dimension tables and the like) this
    /// mapper feeds. `owner` is the table the mapper writes rows for.
    fn initialize_related_tables(
        &mut self,
        _registry: &mut TableRegistry,
        _owner: TableId,
    ) -> Result<()> {
        Ok(())
    }

    /// Produce values for the current scope into the window.
    fn set_values(&mut self, ctx: &ScopeContext<'_>, window: &mut RowWindow<'_>) -> Result<bool>;

    /// Hand rows buffered for related tables to their builders. Called after
    /// every item so related rows land in the same flush cycle.
    fn drain_related(&mut self, _registry: &mut TableRegistry) -> Result<()> {
        Ok(())
    }

    /// One batched pass over a flush's final rows, for deferred work such as
    /// resolving labels once instead of once per row.
    fn post_process_rows(&mut self, _schema: &Schema, _rows: &mut [Row]) -> Result<()> {
        Ok(())
    }
}

/// Selects the sub-items a table-mapper node iterates for one parent object.
pub enum ItemSelector {
    /// The parent object itself, as a single-element sequence.
    Identity,
    /// A JSON pointer; an array there yields its elements, any other value
    /// yields itself, a missing or null target yields nothing.
    Path(String),
    /// Arbitrary selection logic.
    Func(Box<dyn Fn(&Value) -> Vec<Value> + Send>),
}

impl ItemSelector {
    pub fn select(&self, source: &Value) -> Vec<Value> {
        match self {
            ItemSelector::Identity => vec![source.clone()],
            ItemSelector::Path(pointer) => match source.pointer(pointer) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(other) => vec![other.clone()],
            },
            ItemSelector::Func(f) => f(source),
        }
    }
}

impl fmt::Debug for ItemSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemSelector::Identity => write!(f, "Identity"),
            ItemSelector::Path(p) => write!(f, "Path({p:?})"),
            ItemSelector::Func(_) => write!(f, "Func(..)"),
        }
    }
}

/// One node of the table-mapper tree: a table definition plus the nested
/// tables built from its sub-items.
pub struct TableMapper {
    pub name: String,
    pub selector: ItemSelector,
    pub mappers: Vec<Box<dyn FieldMapper>>,
    pub children: Vec<TableMapper>,
}

impl TableMapper {
    pub fn new(name: impl Into<String>, selector: ItemSelector) -> Self {
        TableMapper {
            name: name.into(),
            selector,
            mappers: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_field(mut self, mapper: impl FieldMapper + 'static) -> Self {
        self.mappers.push(Box::new(mapper));
        self
    }

    pub fn with_child(mut self, child: TableMapper) -> Self {
        self.children.push(child);
        self
    }
}

impl fmt::Debug for TableMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMapper")
            .field("name", &self.name)
            .field("selector", &self.selector)
            .field("mappers", &self.mappers.len())
            .field("children", &self.children)
            .finish()
    }
}
