//! Row identity and ordering for one schema.

use crate::schema::{Schema, SortDir};
use crate::value::{Datum, Row};
use std::cmp::Ordering;

/// The identity-column values of a row, extracted for map keying.
///
/// Equality and hashing come from [`Datum`]'s manual impls, so they are
/// consistent with [`RowComparer::identity_eq`] by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey(pub Vec<Datum>);

/// Compares rows of one schema: equality over identity columns only,
/// ordering by explicit sort directives first, then identity columns.
///
/// Every spilled partition is sorted with this ordering, and the external
/// merge assumes all of its sources agree on it.
#[derive(Debug, Clone)]
pub struct RowComparer {
    identity: Vec<usize>,
    order: Vec<(usize, bool)>,
}

impl RowComparer {
    pub fn new(schema: &Schema) -> Self {
        let identity = schema.identity_columns().to_vec();

        // Sort-directive fields first (declaration order), then identity
        // fields not already covered.
        let mut order: Vec<(usize, bool)> = schema
            .fields()
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| f.sort.map(|dir| (idx, dir == SortDir::Descending)))
            .collect();
        for &col in &identity {
            if !order.iter().any(|(c, _)| *c == col) {
                order.push((col, false));
            }
        }

        RowComparer { identity, order }
    }

    pub fn identity_columns(&self) -> &[usize] {
        &self.identity
    }

    /// True when two rows agree on every identity column.
    pub fn identity_eq(&self, a: &Row, b: &Row) -> bool {
        if std::ptr::eq(a, b) {
            return true;
        }
        self.identity.iter().all(|&c| a[c] == b[c])
    }

    /// Extract the identity values of a row.
    pub fn identity_of(&self, row: &Row) -> RowKey {
        RowKey(self.identity.iter().map(|&c| row[c].clone()).collect())
    }

    /// Total order over rows. Nulls sort first under both directions.
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        for &(col, descending) in &self.order {
            let (x, y) = (&a[col], &b[col]);
            let step = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => {
                    let natural = x.cmp(y);
                    if descending {
                        natural.reverse()
                    } else {
                        natural
                    }
                }
            };
            if step != Ordering::Equal {
                return step;
            }
        }
        Ordering::Equal
    }
}
