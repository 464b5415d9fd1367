//! Column windows: independently authored field mappers sharing one row.
//!
//! Each mapper declares a handful of columns and is written as if it owned a
//! small private row; the window remaps its local indexes onto the one shared
//! buffer, so composition costs nothing at runtime.

use crate::error::Result;
use crate::mapper::FieldMapper;
use crate::scope::{Occurrence, ScopeContext};
use crate::value::Datum;

/// A cell of the working row buffer, before insertion resolves it.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    /// A plain value.
    Immediate(Datum),
    /// Contribute `value` only the first time `occurrence` touches the
    /// destination row on this field. Resolved once, at insertion.
    OncePer { occurrence: Occurrence, value: Datum },
}

impl Contribution {
    pub fn immediate(&self) -> Option<&Datum> {
        match self {
            Contribution::Immediate(v) => Some(v),
            Contribution::OncePer { .. } => None,
        }
    }
}

/// A mapper's private view over the shared row buffer.
pub struct RowWindow<'a> {
    cells: &'a mut [Contribution],
    columns: &'a [usize],
}

impl<'a> RowWindow<'a> {
    pub fn new(cells: &'a mut [Contribution], columns: &'a [usize]) -> Self {
        RowWindow { cells, columns }
    }

    /// Number of columns in this window.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, local: usize) -> &Contribution {
        &self.cells[self.columns[local]]
    }

    pub fn set(&mut self, local: usize, value: Datum) {
        self.cells[self.columns[local]] = Contribution::Immediate(value);
    }

    /// Place a deferred once-per-ancestor contribution.
    pub fn set_once_per(&mut self, local: usize, occurrence: Occurrence, value: Datum) {
        self.cells[self.columns[local]] = Contribution::OncePer { occurrence, value };
    }
}

/// The composed field mappers of one table, with their column windows.
pub struct MapperSet {
    mappers: Vec<Box<dyn FieldMapper>>,
    windows: Vec<Vec<usize>>,
}

impl MapperSet {
    /// Pair each mapper with the post-derivation positions of its declared
    /// columns. `windows[i]` must line up with `mappers[i]`.
    pub fn new(mappers: Vec<Box<dyn FieldMapper>>, windows: Vec<Vec<usize>>) -> Self {
        debug_assert_eq!(mappers.len(), windows.len());
        MapperSet { mappers, windows }
    }

    pub fn empty() -> Self {
        MapperSet {
            mappers: Vec::new(),
            windows: Vec::new(),
        }
    }

    /// Run every mapper against its own window. True iff at least one
    /// produced a value; decliners leave their columns at declared defaults.
    pub fn set_values(
        &mut self,
        ctx: &ScopeContext<'_>,
        cells: &mut [Contribution],
    ) -> Result<bool> {
        let mut any = false;
        for (mapper, columns) in self.mappers.iter_mut().zip(&self.windows) {
            let mut window = RowWindow::new(cells, columns);
            any |= mapper.set_values(ctx, &mut window)?;
        }
        Ok(any)
    }

    pub fn for_each_mapper<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn FieldMapper) -> Result<()>,
    {
        for mapper in &mut self.mappers {
            f(mapper.as_mut())?;
        }
        Ok(())
    }
}
