//! Row materialization.
//!
//! Each target type lists its columns and maps them to fields by name. A
//! decode failure discards everything accumulated so far: a call either
//! yields all of its rows or none.

use super::{QueryError, QueryResult};
use rusqlite::Row;

/// Explicit column-to-field mapping for a row type.
pub trait FromRow: Sized {
    /// Columns read by `from_row`, in select order.
    const COLUMNS: &'static [&'static str];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Decodes `row` into `target`, clearing `target` on the first failure.
pub fn materialize<T: FromRow>(target: &mut Vec<T>, row: &Row<'_>) -> QueryResult<()> {
    match T::from_row(row) {
        Ok(value) => {
            target.push(value);
            Ok(())
        }
        Err(err) => {
            target.clear();
            Err(QueryError::Stream(err))
        }
    }
}

/// Comma-separated column list for a select clause.
pub fn column_list<T: FromRow>() -> String {
    T::COLUMNS.join(", ")
}
