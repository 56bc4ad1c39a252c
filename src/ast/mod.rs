/// Query description and SQL generation.
///
/// ```text
/// QueryDescriptor + Q predicates   (descriptor.rs)
///       ↓
/// SELECT AST                       (types.rs, raw predicates via parser.rs)
///       ↓
/// SQL Compiler                     (compiler.rs)
///       ↓
/// (sql, params) handed to the driver layer (db/ module)
/// ```
pub mod compiler;
pub mod descriptor;
pub mod parser;
pub mod types;

pub use compiler::compile;
pub use descriptor::{
    CompileError, FieldMeta, IterMode, Lookup, ModelMeta, QueryDescriptor, RelationKind,
    SelectColumn, SelectInfo, SqlCompiler, Q,
};
pub use parser::parse_expr;
pub use types::*;
