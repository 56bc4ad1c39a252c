use crate::ast::CompileError;
use crate::db::DriverError;

/// Errors surfaced by the result-set adapter.
#[derive(Debug, thiserror::Error)]
pub enum QuerySetError {
    /// Structural emptiness is handled internally; anything else the
    /// builder rejects lands here.
    #[error("cannot compile query: {0}")]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("index {0} is out of range")]
    OutOfRange(usize),
    #[error("unsupported index key: {0}")]
    UnsupportedKeyType(String),
    #[error("no materializer for iteration mode `{0}`")]
    UnknownOutputShape(String),
    #[error("database alias `{0}` is not configured")]
    UnknownDatabase(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl QuerySetError {
    /// Driver failures that the one-shot reconnect path may recover from.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, QuerySetError::Driver(err) if err.is_connectivity())
    }
}

pub type Result<T> = std::result::Result<T, QuerySetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ErrorCategory;

    #[test]
    fn test_connectivity_only_for_connection_category() {
        assert!(QuerySetError::from(DriverError::connection("reset by peer")).is_connectivity());
        assert!(
            !QuerySetError::from(DriverError::new(ErrorCategory::Semantic, "no such table"))
                .is_connectivity()
        );
        assert!(!QuerySetError::OutOfRange(3).is_connectivity());
    }

    #[test]
    fn test_messages() {
        assert_eq!(QuerySetError::OutOfRange(4).to_string(), "index 4 is out of range");
        assert_eq!(
            QuerySetError::from(CompileError::EmptyResultSet).to_string(),
            "cannot compile query: query can never match any rows"
        );
    }
}
