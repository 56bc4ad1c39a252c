//! Blocking relational driver interface.
//!
//! The adapter only ever talks to a database through these traits: a
//! [`Driver`] opens connections, a [`DriverConnection`] hands out cursors,
//! and a [`DriverCursor`] executes raw SQL with positional parameters and
//! yields opaque row tuples.

use std::error::Error as StdError;
use std::fmt;

use super::connection::DatabaseConfig;
use super::value::{Row, Value};

/// Categorized error types for driver failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Structured driver error with the context PostgreSQL reports.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{category}: {message}")]
pub struct DriverError {
    pub category: ErrorCategory,
    /// SQLSTATE error code (e.g., "42601" for syntax_error)
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based (line, column) within the executed statement
    pub location: Option<(usize, usize)>,
}

impl DriverError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: String::new(),
            message: message.into(),
            detail: None,
            hint: None,
            location: None,
        }
    }

    /// A transport-level failure: the connection dropped or was refused.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    /// Whether the one-shot reconnect path applies to this failure.
    pub fn is_connectivity(&self) -> bool {
        self.category == ErrorCategory::Connection
    }

    /// Build from a tokio_postgres error. A server-reported position is
    /// resolved to a line and column of `query`.
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            let location = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => {
                    Some(byte_offset_to_line_col(query, *pos as usize))
                }
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });

            DriverError {
                category: categorize_sqlstate(&code),
                code,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                location,
            }
        } else {
            DriverError {
                category: transport_category(err.is_closed(), err.source()),
                code: String::new(),
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
                hint: None,
                location: None,
            }
        }
    }

    /// Every reported field, one per line, for logs.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let Some((line, col)) = self.location {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }

        lines.join("\n")
    }
}

/// 1-based byte offset in `query` → 1-based (line, column).
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    if byte_pos == 0 || query.is_empty() {
        return (1, 1);
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Category of an error that carries no server response. Only a closed
/// connection or an I/O failure somewhere in the source chain counts as
/// connectivity; parameter encoding and row decoding failures are not.
fn transport_category(is_closed: bool, source: Option<&(dyn StdError + 'static)>) -> ErrorCategory {
    if is_closed {
        return ErrorCategory::Connection;
    }
    let mut next = source;
    while let Some(err) = next {
        if err.is::<std::io::Error>() {
            return ErrorCategory::Connection;
        }
        next = err.source();
    }
    if source.is_some() {
        ErrorCategory::Execution
    } else {
        ErrorCategory::Unknown
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "53" | "54" | "55" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        // Class 08: Connection Exception; 57P01..57P03: server shutting down
        "08" => ErrorCategory::Connection,
        "57" if code.starts_with("57P") => ErrorCategory::Connection,
        "57" => ErrorCategory::Execution,
        _ => ErrorCategory::Unknown,
    }
}

/// Opens connections for a configured logical database.
pub trait Driver: Send + Sync {
    /// Human-readable driver name, used in logs.
    fn name(&self) -> &str;

    fn connect(&self, config: &DatabaseConfig) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// A live connection. Cursors it hands out are independent of each other.
pub trait DriverConnection: Send {
    fn cursor(&mut self) -> Result<Box<dyn DriverCursor>, DriverError>;
}

/// A stateful execution handle.
pub trait DriverCursor: Send {
    /// Run `sql` with positional `params`. Marks the cursor as executed on success.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError>;

    /// Next row, or `None` once the result is drained.
    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError>;

    /// All remaining rows.
    fn fetch_all(&mut self) -> Result<Vec<Row>, DriverError>;

    /// Rows produced by the last execution, if the driver knows.
    fn row_count(&self) -> Option<u64>;

    /// The driver's own "already executed" flag.
    fn is_executed(&self) -> bool;

    fn close(&mut self);
}
