//! Descriptor → compiled statement bridge.

use std::sync::Arc;

use crate::ast::{CompileError, IterMode, ModelMeta, QueryDescriptor};
use crate::db::Value;
use crate::error::Result;

/// The form materialized rows take, resolved once per statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputShape {
    Entity,
    Mapping,
    Tuple,
    /// An iteration mode with no materializer.
    Unrecognized(String),
}

impl From<&IterMode> for OutputShape {
    fn from(mode: &IterMode) -> Self {
        match mode {
            IterMode::Model => OutputShape::Entity,
            IterMode::Values => OutputShape::Mapping,
            IterMode::ValuesList | IterMode::FlatValuesList => OutputShape::Tuple,
            IterMode::Custom(name) => OutputShape::Unrecognized(name.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub name: String,
    /// Foreign-key or one-to-one column: materializes as a raw `<name>_id` scalar.
    pub is_relation: bool,
}

/// Everything needed to execute and materialize one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    /// Empty when no SQL can be produced.
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<ColumnRef>,
    pub selected: Vec<usize>,
    /// Explicit output names of a `values`-style projection, by selected index.
    pub projection: Vec<String>,
    pub entity: Option<Arc<ModelMeta>>,
    pub shape: OutputShape,
    pub database: String,
    pub is_empty: bool,
}

/// Compile `descriptor` once. A structurally empty descriptor is not an
/// error: it yields an empty statement with metadata but no SQL.
pub fn compile(descriptor: &QueryDescriptor) -> Result<CompiledStatement> {
    let compiler = descriptor.compiler();
    let (select, info) = compiler.get_select()?;
    let projection = compiler.field_names()?;
    let shape = OutputShape::from(descriptor.iter_mode());

    let (sql, params, is_empty) = match compiler.as_sql() {
        Ok((sql, params)) => (sql, params, false),
        Err(CompileError::EmptyResultSet) => (String::new(), Vec::new(), true),
        Err(err) => return Err(err.into()),
    };

    let entity = match shape {
        OutputShape::Entity => Some(info.model),
        _ => None,
    };

    Ok(CompiledStatement {
        sql,
        params,
        columns: select
            .into_iter()
            .map(|c| ColumnRef {
                is_relation: c.relation.is_some(),
                name: c.name,
            })
            .collect(),
        selected: info.select_fields,
        projection,
        entity,
        shape,
        database: descriptor.database().to_string(),
        is_empty,
    })
}
