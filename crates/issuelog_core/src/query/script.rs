//! Script runner shared by every execution path.
//!
//! A script is one or more `;`-separated statements. Statements run in
//! program order on the given connection; each statement that yields columns
//! is one result set. The first failure stops the script, and the caller's
//! transaction (if any) is rolled back when it is dropped uncommitted.

use super::{Params, QueryError, QueryResult};
use rusqlite::{Batch, Connection, ErrorCode, Row, Statement};
use tokio_util::sync::CancellationToken;

/// Row callback: `(result_set_index, row)`.
pub type RowSink<'a> = dyn FnMut(usize, &Row<'_>) -> QueryResult<()> + 'a;

pub(crate) fn run_script(
    conn: &Connection,
    sql: &str,
    params: &Params,
    cancel: Option<&CancellationToken>,
    on_row: &mut RowSink<'_>,
) -> QueryResult<()> {
    let mut batch = Batch::new(conn, sql);
    let mut result_set = 0;

    loop {
        check_cancelled(cancel)?;
        let mut stmt = match batch.next().map_err(execution_error)? {
            Some(stmt) => stmt,
            None => break,
        };
        bind_named(&mut stmt, params)?;

        if stmt.column_count() == 0 {
            stmt.raw_execute().map_err(execution_error)?;
            continue;
        }

        let mut rows = stmt.raw_query();
        let mut delivered = false;
        loop {
            check_cancelled(cancel)?;
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) if delivered => return Err(stream_error(err)),
                Err(err) => return Err(execution_error(err)),
            };
            on_row(result_set, row)?;
            delivered = true;
        }
        result_set += 1;
    }

    Ok(())
}

pub(crate) fn check_cancelled(cancel: Option<&CancellationToken>) -> QueryResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(QueryError::Cancelled),
        _ => Ok(()),
    }
}

/// Maps an engine rejection, reporting interrupts as cancellation.
pub(crate) fn execution_error(err: rusqlite::Error) -> QueryError {
    if is_interrupt(&err) {
        QueryError::Cancelled
    } else {
        QueryError::Execution(err)
    }
}

fn stream_error(err: rusqlite::Error) -> QueryError {
    if is_interrupt(&err) {
        QueryError::Cancelled
    } else {
        QueryError::Stream(err)
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
}

fn bind_named(stmt: &mut Statement<'_>, params: &Params) -> QueryResult<()> {
    for index in 1..=stmt.parameter_count() {
        let name = match stmt.parameter_name(index) {
            Some(name) => name.to_string(),
            None => return Err(QueryError::UnboundParameter(format!("?{index}"))),
        };
        let value = params
            .get(&name)
            .ok_or_else(|| QueryError::UnboundParameter(name.clone()))?;
        stmt.raw_bind_parameter(index, value)
            .map_err(QueryError::Execution)?;
    }
    Ok(())
}
