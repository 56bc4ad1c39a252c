//! In-memory driver for unit tests.
//!
//! Serves a fixed row set, records every executed statement, honours a
//! trailing `LIMIT`/`OFFSET`, and can inject connectivity or statement
//! failures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::connection::DatabaseConfig;
use super::driver::{Driver, DriverConnection, DriverCursor, DriverError, ErrorCategory};
use super::value::{Row, Value};

#[derive(Debug, Default)]
struct StubState {
    rows: Vec<Row>,
    executed: Vec<(String, Vec<Value>)>,
    connects: usize,
    cursors_opened: usize,
    cursors_closed: usize,
    failures_left: usize,
    failure: Option<ErrorCategory>,
}

#[derive(Debug, Clone, Default)]
pub struct StubDriver {
    state: Arc<Mutex<StubState>>,
}

impl StubDriver {
    pub fn new(rows: Vec<Row>) -> Self {
        let driver = Self::default();
        driver.state().rows = rows;
        driver
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` executions fail with a connectivity error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next_with(count, ErrorCategory::Connection);
    }

    /// The next `count` executions fail with an error of `category`.
    pub fn fail_next_with(&self, count: usize, category: ErrorCategory) {
        let mut state = self.state();
        state.failures_left = count;
        state.failure = Some(category);
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn executions(&self) -> usize {
        self.state().executed.len()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.state().executed.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn executed_params(&self) -> Vec<Vec<Value>> {
        self.state().executed.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn cursors_opened(&self) -> usize {
        self.state().cursors_opened
    }

    pub fn cursors_closed(&self) -> usize {
        self.state().cursors_closed
    }
}

impl Driver for StubDriver {
    fn name(&self) -> &str {
        "stub"
    }

    fn connect(&self, _config: &DatabaseConfig) -> Result<Box<dyn DriverConnection>, DriverError> {
        self.state().connects += 1;
        Ok(Box::new(StubConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct StubConnection {
    state: Arc<Mutex<StubState>>,
}

impl DriverConnection for StubConnection {
    fn cursor(&mut self) -> Result<Box<dyn DriverCursor>, DriverError> {
        if let Ok(mut state) = self.state.lock() {
            state.cursors_opened += 1;
        }
        Ok(Box::new(StubCursor {
            state: Arc::clone(&self.state),
            buffered: VecDeque::new(),
            row_count: None,
            executed: false,
            closed: false,
        }))
    }
}

struct StubCursor {
    state: Arc<Mutex<StubState>>,
    buffered: VecDeque<Row>,
    row_count: Option<u64>,
    executed: bool,
    closed: bool,
}

impl DriverCursor for StubCursor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DriverError::connection("stub poisoned"))?;
        state.executed.push((sql.to_string(), params.to_vec()));
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(match state.failure.clone() {
                Some(ErrorCategory::Connection) | None => {
                    DriverError::connection("server closed the connection unexpectedly")
                }
                Some(category) => DriverError::new(category, "cannot bind parameter $1"),
            });
        }

        let (limit, offset) = parse_limit_offset(sql);
        let rows: Vec<Row> = state
            .rows
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        self.row_count = Some(rows.len() as u64);
        self.buffered = rows.into();
        self.executed = true;
        Ok(())
    }

    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError> {
        if self.closed {
            return Err(DriverError::connection("cursor is closed"));
        }
        Ok(self.buffered.pop_front())
    }

    fn fetch_all(&mut self) -> Result<Vec<Row>, DriverError> {
        if self.closed {
            return Err(DriverError::connection("cursor is closed"));
        }
        Ok(self.buffered.drain(..).collect())
    }

    fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    fn is_executed(&self) -> bool {
        self.executed
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Ok(mut state) = self.state.lock() {
                state.cursors_closed += 1;
            }
        }
    }
}

/// Read a trailing `LIMIT n` / `OFFSET m` pair from statement text.
fn parse_limit_offset(sql: &str) -> (Option<usize>, usize) {
    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let mut limit = None;
    let mut offset = 0;
    for pair in tokens.windows(2) {
        match pair[0] {
            "LIMIT" => limit = pair[1].parse().ok(),
            "OFFSET" => offset = pair[1].parse().unwrap_or(0),
            _ => {}
        }
    }
    (limit, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit_offset() {
        assert_eq!(parse_limit_offset("SELECT 1"), (None, 0));
        assert_eq!(parse_limit_offset("SELECT 1 LIMIT 3 OFFSET 2"), (Some(3), 2));
        assert_eq!(parse_limit_offset("SELECT 1 OFFSET 4"), (None, 4));
    }

    #[test]
    fn test_stub_cursor_applies_limit() {
        let stub = StubDriver::new(vec![
            vec![Value::Int32(1)],
            vec![Value::Int32(2)],
            vec![Value::Int32(3)],
        ]);
        let mut conn = stub.connect(&DatabaseConfig::default()).unwrap();
        let mut cursor = conn.cursor().unwrap();
        cursor.execute("SELECT id FROM t LIMIT 1 OFFSET 1", &[]).unwrap();
        assert_eq!(cursor.fetch_all().unwrap(), vec![vec![Value::Int32(2)]]);
        assert_eq!(stub.executions(), 1);
    }
}
