//! Execution engine: one compiled statement, at most one live driver cursor,
//! and the row cache that makes a drained result replayable.

use std::sync::Arc;

use super::statement::CompiledStatement;
use crate::db::{Connections, DriverCursor, Row};
use crate::error::{QuerySetError, Result};

pub struct ResultCursor {
    statement: Arc<CompiledStatement>,
    connections: Arc<Connections>,
    /// Statement text; differs from the compiled text only during an
    /// index or slice pass.
    sql: String,
    driver: Option<Box<dyn DriverCursor>>,
    executed: bool,
    rows: Vec<Row>,
    position: usize,
    /// Set once the driver is drained or the cursor is closed; from then on
    /// every read is served from `rows`.
    iterated: bool,
}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("sql", &self.sql)
            .field("live", &self.driver.is_some())
            .field("executed", &self.executed)
            .field("cached", &self.rows.len())
            .field("position", &self.position)
            .field("iterated", &self.iterated)
            .finish()
    }
}

impl ResultCursor {
    /// Bind a cursor to `statement`, opening a driver cursor unless the
    /// statement is empty.
    pub fn open(statement: Arc<CompiledStatement>, connections: Arc<Connections>) -> Result<Self> {
        let driver = if statement.is_empty {
            None
        } else {
            Some(connections.cursor(&statement.database)?)
        };
        Ok(Self {
            sql: statement.sql.clone(),
            statement,
            connections,
            driver,
            executed: false,
            rows: Vec::new(),
            position: 0,
            iterated: false,
        })
    }

    /// An independent cursor over the same statement. No driver cursor is
    /// shared; one is opened on first use. A fully materialized cache is
    /// carried over, a partial one is not.
    pub fn fork(&self) -> Self {
        let rows = if self.iterated {
            self.rows.clone()
        } else {
            Vec::new()
        };
        Self {
            statement: Arc::clone(&self.statement),
            connections: Arc::clone(&self.connections),
            sql: self.statement.sql.clone(),
            driver: None,
            executed: false,
            rows,
            position: 0,
            iterated: self.iterated,
        }
    }

    pub fn statement(&self) -> &Arc<CompiledStatement> {
        &self.statement
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_materialized(&self) -> bool {
        self.iterated
    }

    /// Executed only when both our flag and the held driver cursor agree: a
    /// reconnect substitutes a cursor that has not run anything yet.
    pub fn is_executed(&self) -> bool {
        self.executed && self.driver.as_ref().is_some_and(|d| d.is_executed())
    }

    /// Run the statement once. No-op for empty statements, after a previous
    /// execution, or once the cache is authoritative.
    pub fn execute(&mut self) -> Result<()> {
        if self.sql.is_empty() || self.iterated || self.is_executed() {
            return Ok(());
        }
        let driver = match self.driver.take() {
            Some(driver) => driver,
            None => self.connections.cursor(&self.statement.database)?,
        };
        self.driver = Some(self.execute_on(driver, &self.sql)?);
        self.executed = true;
        Ok(())
    }

    /// Execute `sql` on `driver`. A connectivity failure reconnects the
    /// alias and retries exactly once on the fresh cursor.
    fn execute_on(
        &self,
        mut driver: Box<dyn DriverCursor>,
        sql: &str,
    ) -> Result<Box<dyn DriverCursor>> {
        let database = self.statement.database.as_str();
        let params = &self.statement.params;
        tracing::debug!(database, sql, ?params, "executing statement");

        match driver.execute(sql, params) {
            Ok(()) => Ok(driver),
            Err(err) if err.is_connectivity() => {
                driver.close();
                tracing::warn!(database, error = %err, "connection lost, reconnecting and retrying once");
                let mut retry = self.connections.reconnect(database)?;
                match retry.execute(sql, params) {
                    Ok(()) => Ok(retry),
                    Err(err) => {
                        retry.close();
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                tracing::debug!(database, error = %err.display_full(), "statement failed");
                driver.close();
                Err(err.into())
            }
        }
    }

    /// Run the current statement text on a cursor of its own, leaving this
    /// cursor's state untouched.
    fn run_pass(&self) -> Result<Box<dyn DriverCursor>> {
        let driver = self.connections.cursor(&self.statement.database)?;
        self.execute_on(driver, &self.sql)
    }

    /// Append `suffix` to the statement text for the duration of `pass`.
    fn with_rewritten_sql<T>(
        &mut self,
        suffix: &str,
        pass: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        let original = std::mem::take(&mut self.sql);
        self.sql = format!("{}{}", original, suffix);
        let result = pass(self);
        self.sql = original;
        result
    }

    /// Advance one row: from the cache while it lasts, then from the driver.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if let Some(row) = self.rows.get(self.position) {
            self.position += 1;
            return Ok(Some(row.clone()));
        }
        if self.iterated {
            self.position = 0;
            return Ok(None);
        }
        if self.sql.is_empty() {
            self.close();
            return Ok(None);
        }

        self.execute()?;
        let fetched = match self.driver.as_mut() {
            Some(driver) if driver.is_executed() => driver.fetch_one()?,
            _ => None,
        };
        match fetched {
            Some(row) => {
                self.rows.push(row.clone());
                self.position += 1;
                Ok(Some(row))
            }
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    /// Drain the driver into the cache and release it.
    pub fn fetch_all(&mut self) -> Result<()> {
        if self.sql.is_empty() || self.iterated {
            return Ok(());
        }
        self.execute()?;
        if let Some(driver) = self.driver.as_mut() {
            let rest = driver.fetch_all()?;
            self.rows.extend(rest);
        }
        self.close();
        Ok(())
    }

    /// Number of rows the statement yields.
    pub fn count(&self) -> Result<usize> {
        if self.sql.is_empty() {
            return Ok(0);
        }
        if self.iterated {
            return Ok(self.rows.len());
        }
        let mut pass = self.run_pass()?;
        let counted = match pass.row_count() {
            Some(n) => Ok(n as usize),
            None => pass.fetch_all().map(|rows| rows.len()),
        };
        pass.close();
        Ok(counted?)
    }

    /// Row `index` via `LIMIT 1 OFFSET index`, or from the cache once
    /// materialized.
    pub fn row_at(&mut self, index: usize) -> Result<Row> {
        if self.iterated || self.sql.is_empty() {
            return self
                .rows
                .get(index)
                .cloned()
                .ok_or(QuerySetError::OutOfRange(index));
        }
        let row = self.with_rewritten_sql(&format!(" LIMIT 1 OFFSET {}", index), |this| {
            let mut pass = this.run_pass()?;
            let row = pass.fetch_one();
            pass.close();
            Ok(row?)
        })?;
        row.ok_or(QuerySetError::OutOfRange(index))
    }

    /// Rows `[start, stop)` via a `LIMIT`/`OFFSET` rewrite, or from the cache
    /// once materialized.
    pub fn rows_in(&mut self, start: Option<usize>, stop: Option<usize>) -> Result<Vec<Row>> {
        if let (Some(start), Some(stop)) = (start, stop) {
            if stop <= start {
                return Ok(Vec::new());
            }
        }
        if self.iterated || self.sql.is_empty() {
            let from = start.unwrap_or(0).min(self.rows.len());
            let to = stop.unwrap_or(self.rows.len()).min(self.rows.len()).max(from);
            return Ok(self.rows[from..to].to_vec());
        }

        let suffix = match (start, stop) {
            (Some(start), Some(stop)) => format!(" LIMIT {} OFFSET {}", stop - start, start),
            (None, Some(stop)) => format!(" LIMIT {}", stop),
            (Some(start), None) => format!(" OFFSET {}", start),
            (None, None) => String::new(),
        };
        self.with_rewritten_sql(&suffix, |this| {
            let mut pass = this.run_pass()?;
            let rows = pass.fetch_all();
            pass.close();
            Ok(rows?)
        })
    }

    /// Replace the cache with a materialized snapshot.
    pub fn restore_rows(&mut self, rows: Vec<Row>) {
        self.close();
        self.rows = rows;
    }

    /// Release the driver cursor and make the cache authoritative. Safe to
    /// call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }
        self.iterated = true;
        self.position = 0;
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ModelMeta, QueryDescriptor};
    use crate::config::Settings;
    use crate::db::stub::StubDriver;
    use crate::db::{ErrorCategory, Value};
    use crate::queryset::statement::compile;

    fn rows(n: i32) -> Vec<Row> {
        (1..=n).map(|i| vec![Value::Int32(i)]).collect()
    }

    fn setup(stub: &StubDriver, descriptor: QueryDescriptor) -> ResultCursor {
        let connections = Arc::new(
            Connections::connect_all(Arc::new(stub.clone()), &Settings::for_aliases(&["default"]))
                .unwrap(),
        );
        let statement = Arc::new(compile(&descriptor).unwrap());
        ResultCursor::open(statement, connections).unwrap()
    }

    fn numbers() -> QueryDescriptor {
        ModelMeta::new("Number", "numbers").primary_key("n").into()
    }

    #[test]
    fn test_execute_runs_once() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        cursor.execute().unwrap();
        cursor.execute().unwrap();
        assert!(cursor.is_executed());
        assert_eq!(stub.executions(), 1);
    }

    #[test]
    fn test_next_row_then_replay_from_cache() {
        let stub = StubDriver::new(rows(2));
        let mut cursor = setup(&stub, numbers());
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(2)]));
        assert_eq!(cursor.next_row().unwrap(), None);
        assert!(cursor.is_materialized());

        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(2)]));
        assert_eq!(cursor.next_row().unwrap(), None);
        assert_eq!(stub.executions(), 1);
    }

    #[test]
    fn test_fetch_all_is_idempotent() {
        let stub = StubDriver::new(rows(4));
        let mut cursor = setup(&stub, numbers());
        cursor.fetch_all().unwrap();
        cursor.fetch_all().unwrap();
        assert_eq!(cursor.rows().len(), 4);
        assert_eq!(stub.executions(), 1);
        assert_eq!(stub.cursors_closed(), 1);
    }

    #[test]
    fn test_fetch_all_keeps_partially_read_rows() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        cursor.next_row().unwrap();
        cursor.fetch_all().unwrap();
        assert_eq!(cursor.rows(), rows(3).as_slice());
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_slice_rewrites_and_restores_sql() {
        let stub = StubDriver::new(rows(10));
        let mut cursor = setup(&stub, numbers());
        let original = cursor.sql().to_string();

        let slice = cursor.rows_in(Some(2), Some(5)).unwrap();
        assert_eq!(slice, vec![
            vec![Value::Int32(3)],
            vec![Value::Int32(4)],
            vec![Value::Int32(5)],
        ]);
        assert_eq!(stub.executed_sql(), vec![format!("{} LIMIT 3 OFFSET 2", original)]);
        assert_eq!(cursor.sql(), original);
        assert!(!cursor.is_executed());
    }

    #[test]
    fn test_slice_boundary_variants() {
        let stub = StubDriver::new(rows(10));
        let mut cursor = setup(&stub, numbers());
        let original = cursor.sql().to_string();

        assert_eq!(cursor.rows_in(None, Some(2)).unwrap().len(), 2);
        assert_eq!(cursor.rows_in(Some(8), None).unwrap().len(), 2);
        assert!(cursor.rows_in(Some(5), Some(5)).unwrap().is_empty());
        assert_eq!(
            stub.executed_sql(),
            vec![format!("{} LIMIT 2", original), format!("{} OFFSET 8", original)]
        );
    }

    #[test]
    fn test_row_at_and_out_of_range() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        let original = cursor.sql().to_string();
        assert_eq!(cursor.row_at(1).unwrap(), vec![Value::Int32(2)]);
        assert!(matches!(cursor.row_at(7), Err(QuerySetError::OutOfRange(7))));
        assert_eq!(stub.executed_sql()[0], format!("{} LIMIT 1 OFFSET 1", original));
        assert_eq!(cursor.sql(), original);
    }

    #[test]
    fn test_sql_restored_after_failed_pass() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        let original = cursor.sql().to_string();
        stub.fail_next(2);
        assert!(cursor.row_at(0).is_err());
        assert_eq!(cursor.sql(), original);
    }

    #[test]
    fn test_materialized_reads_use_cache() {
        let stub = StubDriver::new(rows(5));
        let mut cursor = setup(&stub, numbers());
        cursor.fetch_all().unwrap();
        stub.fail_next(10);
        assert_eq!(cursor.row_at(4).unwrap(), vec![Value::Int32(5)]);
        assert_eq!(cursor.rows_in(Some(3), Some(9)).unwrap().len(), 2);
        assert_eq!(cursor.count().unwrap(), 5);
        assert_eq!(stub.executions(), 1);
    }

    #[test]
    fn test_count_does_not_consume() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        assert_eq!(cursor.count().unwrap(), 3);
        assert!(!cursor.is_executed());
        assert!(!cursor.is_materialized());
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(stub.executions(), 2);
    }

    #[test]
    fn test_empty_statement_never_touches_driver() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers().none());
        assert_eq!(cursor.count().unwrap(), 0);
        assert_eq!(cursor.next_row().unwrap(), None);
        assert!(cursor.rows_in(Some(0), Some(2)).unwrap().is_empty());
        assert!(matches!(cursor.row_at(0), Err(QuerySetError::OutOfRange(0))));
        cursor.fetch_all().unwrap();
        assert_eq!(stub.executions(), 0);
        assert_eq!(stub.cursors_opened(), 0);
    }

    #[test]
    fn test_reconnect_once_then_succeed() {
        let stub = StubDriver::new(rows(2));
        let mut cursor = setup(&stub, numbers());
        stub.fail_next(1);
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(stub.connects(), 2);
        assert_eq!(stub.executions(), 2);
        assert!(cursor.is_executed());
    }

    #[test]
    fn test_second_failure_propagates() {
        let stub = StubDriver::new(rows(2));
        let mut cursor = setup(&stub, numbers());
        stub.fail_next(2);
        let err = cursor.next_row().unwrap_err();
        assert!(err.is_connectivity());
        assert_eq!(stub.connects(), 2);
        assert_eq!(stub.executions(), 2);
        assert!(!cursor.is_executed());
    }

    #[test]
    fn test_statement_errors_do_not_reconnect() {
        let stub = StubDriver::new(rows(2));
        let mut cursor = setup(&stub, numbers());
        stub.fail_next_with(1, ErrorCategory::Execution);
        let err = cursor.next_row().unwrap_err();
        assert!(!err.is_connectivity());
        assert!(matches!(
            err,
            QuerySetError::Driver(ref e) if e.category == ErrorCategory::Execution
        ));
        assert_eq!(stub.connects(), 1);
        assert_eq!(stub.executions(), 1);
        assert!(!cursor.is_executed());

        // The alias' connection was kept; the next read runs normally.
        assert_eq!(cursor.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(stub.connects(), 1);
    }

    #[test]
    fn test_fork_carries_only_materialized_cache() {
        let stub = StubDriver::new(rows(3));
        let mut cursor = setup(&stub, numbers());
        cursor.next_row().unwrap();
        let partial = cursor.fork();
        assert!(partial.rows().is_empty());
        assert!(!partial.is_materialized());

        cursor.fetch_all().unwrap();
        let mut snapshot = cursor.fork();
        assert!(snapshot.is_materialized());
        assert_eq!(snapshot.rows().len(), 3);
        assert_eq!(snapshot.next_row().unwrap(), Some(vec![Value::Int32(1)]));
        assert_eq!(stub.executions(), 1);
    }

    #[test]
    fn test_close_is_repeatable() {
        let stub = StubDriver::new(rows(1));
        let mut cursor = setup(&stub, numbers());
        cursor.close();
        cursor.close();
        assert!(cursor.is_materialized());
        assert_eq!(cursor.position(), 0);
        assert_eq!(stub.cursors_closed(), 1);
        assert_eq!(cursor.next_row().unwrap(), None);
    }
}
