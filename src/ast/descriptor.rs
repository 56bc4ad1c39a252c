//! Declarative query descriptors.
//!
//! A [`QueryDescriptor`] is an immutable description of a read query against
//! one model: predicates, ordering, projection and related-object hints.
//! Every method returns a new descriptor. [`QueryDescriptor::compiler`]
//! lowers it to the SELECT AST and from there to SQL text plus positional
//! bind values.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use super::compiler::compile;
use super::parser::parse_expr;
use super::types::*;
use crate::db::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The predicate can never match; there is no SQL to run.
    #[error("query can never match any rows")]
    EmptyResultSet,
    #[error("{model} has no field named `{field}`")]
    UnknownField { model: String, field: String },
    #[error("unsupported lookup `{lookup}` on `{field}`")]
    UnknownLookup { field: String, lookup: String },
    #[error("`{field}` is not a relation on {model}")]
    NotARelation { model: String, field: String },
    #[error("invalid value for `{field}__{lookup}`: {reason}")]
    InvalidValue {
        field: String,
        lookup: String,
        reason: String,
    },
    #[error("invalid raw predicate: {0}")]
    RawExpression(String),
}

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ForeignKey,
    OneToOne,
}

/// One concrete field of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub column: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub relation: Option<RelationKind>,
}

impl FieldMeta {
    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    /// Attribute holding the raw value: `dept_id` for relation `dept`.
    pub fn attname(&self) -> String {
        if self.is_relation() {
            format!("{}_id", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Table-level metadata for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    pub fields: Vec<FieldMeta>,
    /// Default ordering, applied when a descriptor has none of its own.
    #[serde(default)]
    pub ordering: Vec<String>,
}

fn default_database() -> String {
    String::from("default")
}

impl ModelMeta {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            schema: None,
            database: default_database(),
            fields: Vec::new(),
            ordering: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn database(mut self, alias: impl Into<String>) -> Self {
        self.database = alias.into();
        self
    }

    pub fn ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = ordering.into_iter().map(Into::into).collect();
        self
    }

    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.push(FieldMeta {
            column: name.clone(),
            name,
            primary_key: true,
            relation: None,
        });
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields.push(FieldMeta {
            column: name.clone(),
            name,
            primary_key: false,
            relation: None,
        });
        self
    }

    /// A many-to-one relation stored in `<name>_id`.
    pub fn foreign_key(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let column = format!("{}_id", name);
        self.relation(name, column, RelationKind::ForeignKey)
    }

    pub fn relation(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        kind: RelationKind,
    ) -> Self {
        self.fields.push(FieldMeta {
            name: name.into(),
            column: column.into(),
            primary_key: false,
            relation: Some(kind),
        });
        self
    }

    pub fn pk(&self) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Resolve `pk`, a field name, an attname, or a column name.
    pub fn get_field(&self, name: &str) -> Option<&FieldMeta> {
        if name == "pk" {
            return self.pk();
        }
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.fields.iter().find(|f| f.attname() == name || f.column == name))
    }

    fn require_field(&self, name: &str) -> Result<&FieldMeta> {
        self.get_field(name).ok_or_else(|| CompileError::UnknownField {
            model: self.name.clone(),
            field: name.to_string(),
        })
    }
}

/// Field lookups understood by [`Q::new`]'s `field__lookup` syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    IsNull,
    Range,
}

impl Lookup {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => Lookup::Exact,
            "iexact" => Lookup::IExact,
            "contains" => Lookup::Contains,
            "icontains" => Lookup::IContains,
            "startswith" => Lookup::StartsWith,
            "istartswith" => Lookup::IStartsWith,
            "endswith" => Lookup::EndsWith,
            "iendswith" => Lookup::IEndsWith,
            "gt" => Lookup::Gt,
            "gte" => Lookup::Gte,
            "lt" => Lookup::Lt,
            "lte" => Lookup::Lte,
            "in" => Lookup::In,
            "isnull" => Lookup::IsNull,
            "range" => Lookup::Range,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::IExact => "iexact",
            Lookup::Contains => "contains",
            Lookup::IContains => "icontains",
            Lookup::StartsWith => "startswith",
            Lookup::IStartsWith => "istartswith",
            Lookup::EndsWith => "endswith",
            Lookup::IEndsWith => "iendswith",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::In => "in",
            Lookup::IsNull => "isnull",
            Lookup::Range => "range",
        }
    }
}

/// A composable predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    Lookup {
        field: String,
        lookup: Lookup,
        value: Value,
    },
    /// A literal SQL expression, parsed at compile time.
    Raw(String),
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    /// `Q::new("age__gte", 18)`; a bare field name means `exact`.
    pub fn new(path: &str, value: impl Into<Value>) -> Self {
        let (field, lookup) = match path.rsplit_once("__") {
            Some((field, suffix)) => match Lookup::parse(suffix) {
                Some(lookup) => (field, lookup),
                None => (path, Lookup::Exact),
            },
            None => (path, Lookup::Exact),
        };
        Q::Lookup {
            field: field.to_string(),
            lookup,
            value: value.into(),
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Q::Raw(sql.into())
    }
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        match self {
            Q::And(mut parts) => {
                parts.push(rhs);
                Q::And(parts)
            }
            lhs => Q::And(vec![lhs, rhs]),
        }
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        match self {
            Q::Or(mut parts) => {
                parts.push(rhs);
                Q::Or(parts)
            }
            lhs => Q::Or(vec![lhs, rhs]),
        }
    }
}

impl Not for Q {
    type Output = Q;

    fn not(self) -> Q {
        match self {
            Q::Not(inner) => *inner,
            q => Q::Not(Box::new(q)),
        }
    }
}

/// How rows of a descriptor are meant to be consumed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IterMode {
    #[default]
    Model,
    Values,
    ValuesList,
    FlatValuesList,
    /// A consumer-defined mode the adapter has no materializer for.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    model: Arc<ModelMeta>,
    database: String,
    predicates: Vec<Q>,
    ordering: Option<Vec<String>>,
    distinct: bool,
    select_related: Vec<String>,
    prefetch_related: Vec<String>,
    fields: Vec<String>,
    iter_mode: IterMode,
    empty: bool,
}

impl From<ModelMeta> for QueryDescriptor {
    fn from(model: ModelMeta) -> Self {
        QueryDescriptor::new(Arc::new(model))
    }
}

fn collect_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

impl QueryDescriptor {
    /// Base descriptor: every row of the model, on the model's database.
    pub fn new(model: Arc<ModelMeta>) -> Self {
        Self {
            database: model.database.clone(),
            model,
            predicates: Vec::new(),
            ordering: None,
            distinct: false,
            select_related: Vec::new(),
            prefetch_related: Vec::new(),
            fields: Vec::new(),
            iter_mode: IterMode::Model,
            empty: false,
        }
    }

    pub fn model(&self) -> &Arc<ModelMeta> {
        &self.model
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn iter_mode(&self) -> &IterMode {
        &self.iter_mode
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_none(&self) -> bool {
        self.empty
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Explicit ordering, or the model's default ordering.
    pub fn ordering(&self) -> &[String] {
        self.ordering.as_deref().unwrap_or(&self.model.ordering)
    }

    pub fn is_ordered(&self) -> bool {
        !self.ordering().is_empty()
    }

    pub fn related_hints(&self) -> (&[String], &[String]) {
        (&self.select_related, &self.prefetch_related)
    }

    pub fn all(&self) -> Self {
        self.clone()
    }

    pub fn filter(&self, q: Q) -> Self {
        let mut next = self.clone();
        next.predicates.push(q);
        next
    }

    pub fn exclude(&self, q: Q) -> Self {
        let mut next = self.clone();
        next.predicates.push(!q);
        next
    }

    pub fn distinct(&self) -> Self {
        let mut next = self.clone();
        next.distinct = true;
        next
    }

    /// Replace the ordering. `-field` sorts descending, `?` randomly; an
    /// empty list clears the model's default ordering too.
    pub fn order_by<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.ordering = Some(collect_names(fields));
        next
    }

    pub fn select_related<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.select_related.extend(collect_names(fields));
        next
    }

    pub fn prefetch_related<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.prefetch_related.extend(collect_names(fields));
        next
    }

    pub fn values<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.fields = collect_names(fields);
        next.iter_mode = IterMode::Values;
        next
    }

    pub fn values_list<I, S>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.fields = collect_names(fields);
        next.iter_mode = IterMode::ValuesList;
        next
    }

    pub fn iterable(&self, mode: IterMode) -> Self {
        let mut next = self.clone();
        next.iter_mode = mode;
        next
    }

    /// The canonical empty descriptor for this model.
    pub fn none(&self) -> Self {
        let mut next = self.clone();
        next.empty = true;
        next
    }

    pub fn using(&self, alias: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.database = alias.into();
        next
    }

    pub fn compiler(&self) -> SqlCompiler<'_> {
        SqlCompiler { descriptor: self }
    }
}

/// A selected column, in SELECT order.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub name: String,
    pub column: String,
    pub relation: Option<RelationKind>,
}

/// Which model the selected columns hydrate and which indices belong to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectInfo {
    pub model: Arc<ModelMeta>,
    pub select_fields: Vec<usize>,
}

/// Lowers one descriptor. Cheap; holds only a borrow.
pub struct SqlCompiler<'a> {
    descriptor: &'a QueryDescriptor,
}

enum Cond {
    Always,
    Never,
    Expr(Expression),
}

impl SqlCompiler<'_> {
    fn model(&self) -> &ModelMeta {
        &self.descriptor.model
    }

    fn selected_fields(&self) -> Result<Vec<&FieldMeta>> {
        let d = self.descriptor;
        match d.iter_mode {
            IterMode::Values | IterMode::ValuesList | IterMode::FlatValuesList
                if !d.fields.is_empty() =>
            {
                d.fields
                    .iter()
                    .map(|name| self.model().require_field(name))
                    .collect()
            }
            _ => Ok(self.model().fields.iter().collect()),
        }
    }

    pub fn get_select(&self) -> Result<(Vec<SelectColumn>, SelectInfo)> {
        let columns: Vec<SelectColumn> = self
            .selected_fields()?
            .into_iter()
            .map(|f| SelectColumn {
                name: f.name.clone(),
                column: f.column.clone(),
                relation: f.relation,
            })
            .collect();
        let info = SelectInfo {
            model: Arc::clone(&self.descriptor.model),
            select_fields: (0..columns.len()).collect(),
        };
        Ok((columns, info))
    }

    /// Output keys for projected (`values`-style) descriptors; empty for
    /// model iteration.
    pub fn field_names(&self) -> Result<Vec<String>> {
        let d = self.descriptor;
        match d.iter_mode {
            IterMode::Values | IterMode::ValuesList | IterMode::FlatValuesList => {
                if d.fields.is_empty() {
                    Ok(self.model().fields.iter().map(FieldMeta::attname).collect())
                } else {
                    Ok(d.fields.clone())
                }
            }
            IterMode::Model | IterMode::Custom(_) => Ok(Vec::new()),
        }
    }

    pub fn as_sql(&self) -> Result<(String, Vec<Value>)> {
        let d = self.descriptor;
        if d.empty {
            return Err(CompileError::EmptyResultSet);
        }
        for name in d.select_related.iter().chain(&d.prefetch_related) {
            let field = self.model().require_field(name)?;
            if !field.is_relation() {
                return Err(CompileError::NotARelation {
                    model: self.model().name.clone(),
                    field: name.clone(),
                });
            }
        }

        let mut params = Vec::new();
        let filter = match self.lower_all(&d.predicates, &mut params)? {
            Cond::Never => return Err(CompileError::EmptyResultSet),
            Cond::Always => None,
            Cond::Expr(expr) => Some(expr),
        };

        let (columns, _) = self.get_select()?;
        let table = &self.model().table;
        let select = SelectQuery {
            distinct: d.distinct,
            projections: columns
                .iter()
                .map(|c| SelectItem::Expression {
                    expr: Expression::column(table, &c.column),
                    alias: None,
                })
                .collect(),
            from: vec![TableRef::new(self.model().schema.clone(), table.clone())],
            filter,
            order_by: self.lower_ordering()?,
        };

        Ok((compile(&select), params))
    }

    /// Lower `predicates` joined with AND. Parameters bound by a subtree
    /// that folds to a constant are dropped again, so placeholders always
    /// run `$1..$n` with no gaps.
    fn lower_all(&self, predicates: &[Q], params: &mut Vec<Value>) -> Result<Cond> {
        let mark = params.len();
        let mut parts = Vec::new();
        let mut cond = None;
        for q in predicates {
            match self.lower(q, params)? {
                Cond::Never => {
                    cond = Some(Cond::Never);
                    break;
                }
                Cond::Always => {}
                Cond::Expr(expr) => parts.push(expr),
            }
        }
        let cond = cond.unwrap_or_else(|| {
            join(parts, BinaryOperator::And).map_or(Cond::Always, Cond::Expr)
        });
        Ok(release_if_constant(cond, params, mark))
    }

    fn lower(&self, q: &Q, params: &mut Vec<Value>) -> Result<Cond> {
        let mark = params.len();
        let cond = self.lower_node(q, params)?;
        Ok(release_if_constant(cond, params, mark))
    }

    fn lower_node(&self, q: &Q, params: &mut Vec<Value>) -> Result<Cond> {
        match q {
            Q::Lookup {
                field,
                lookup,
                value,
            } => self.lower_lookup(field, *lookup, value, params),
            Q::Raw(sql) => Ok(Cond::Expr(Expression::Nested(Box::new(parse_expr(sql)?)))),
            Q::And(parts) => self.lower_all(parts, params),
            Q::Or(parts) => {
                let mut exprs = Vec::new();
                for part in parts {
                    match self.lower(part, params)? {
                        Cond::Always => return Ok(Cond::Always),
                        Cond::Never => {}
                        Cond::Expr(expr) => exprs.push(expr),
                    }
                }
                Ok(join(exprs, BinaryOperator::Or).map_or(Cond::Never, Cond::Expr))
            }
            Q::Not(inner) => Ok(match self.lower(inner, params)? {
                Cond::Always => Cond::Never,
                Cond::Never => Cond::Always,
                Cond::Expr(expr) => Cond::Expr(expr.negate()),
            }),
        }
    }

    fn lower_lookup(
        &self,
        name: &str,
        lookup: Lookup,
        value: &Value,
        params: &mut Vec<Value>,
    ) -> Result<Cond> {
        let Some(field) = self.model().get_field(name) else {
            if let Some((prefix, suffix)) = name.rsplit_once("__") {
                if self.model().get_field(prefix).is_some() {
                    return Err(CompileError::UnknownLookup {
                        field: prefix.to_string(),
                        lookup: suffix.to_string(),
                    });
                }
            }
            return Err(CompileError::UnknownField {
                model: self.model().name.clone(),
                field: name.to_string(),
            });
        };
        let column = Expression::column(&self.model().table, &field.column);
        let invalid = |reason: &str| CompileError::InvalidValue {
            field: name.to_string(),
            lookup: lookup.as_str().to_string(),
            reason: reason.to_string(),
        };
        let mut bind = |v: Value| {
            params.push(v);
            Expression::Parameter(params.len())
        };

        let expr = match lookup {
            Lookup::Exact if value.is_null() => Expression::IsNull {
                expr: Box::new(column),
                negated: false,
            },
            Lookup::Exact => Expression::binary(column, BinaryOperator::Eq, bind(value.clone())),
            Lookup::IExact => Expression::binary(
                Expression::function("UPPER", vec![column]),
                BinaryOperator::Eq,
                Expression::function("UPPER", vec![bind(value.clone())]),
            ),
            Lookup::Contains
            | Lookup::IContains
            | Lookup::StartsWith
            | Lookup::IStartsWith
            | Lookup::EndsWith
            | Lookup::IEndsWith => {
                if value.is_null() {
                    return Err(invalid("pattern lookups need a non-null value"));
                }
                let escaped = escape_like(&value.display());
                let pattern = match lookup {
                    Lookup::Contains | Lookup::IContains => format!("%{}%", escaped),
                    Lookup::StartsWith | Lookup::IStartsWith => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                let op = match lookup {
                    Lookup::Contains | Lookup::StartsWith | Lookup::EndsWith => {
                        BinaryOperator::Like
                    }
                    _ => BinaryOperator::ILike,
                };
                Expression::binary(column, op, bind(Value::Text(pattern)))
            }
            Lookup::Gt | Lookup::Gte | Lookup::Lt | Lookup::Lte => {
                if value.is_null() {
                    return Err(invalid("comparison with NULL"));
                }
                let op = match lookup {
                    Lookup::Gt => BinaryOperator::Gt,
                    Lookup::Gte => BinaryOperator::GtEq,
                    Lookup::Lt => BinaryOperator::Lt,
                    _ => BinaryOperator::LtEq,
                };
                Expression::binary(column, op, bind(value.clone()))
            }
            Lookup::In => {
                let Value::Array(items) = value else {
                    return Err(invalid("expected a list"));
                };
                if items.is_empty() {
                    return Ok(Cond::Never);
                }
                Expression::InList {
                    expr: Box::new(column),
                    list: items.iter().cloned().map(&mut bind).collect(),
                    negated: false,
                }
            }
            Lookup::IsNull => {
                let is_null = value.as_bool().ok_or_else(|| invalid("expected a boolean"))?;
                Expression::IsNull {
                    expr: Box::new(column),
                    negated: !is_null,
                }
            }
            Lookup::Range => match value {
                Value::Array(bounds) if bounds.len() == 2 => Expression::Between {
                    expr: Box::new(column),
                    low: Box::new(bind(bounds[0].clone())),
                    high: Box::new(bind(bounds[1].clone())),
                    negated: false,
                },
                _ => return Err(invalid("expected a two-element list")),
            },
        };
        Ok(Cond::Expr(expr))
    }

    fn lower_ordering(&self) -> Result<Vec<OrderByExpr>> {
        self.descriptor
            .ordering()
            .iter()
            .map(|spec| {
                if spec == "?" {
                    return Ok(OrderByExpr {
                        expr: Expression::function("RANDOM", vec![]),
                        asc: None,
                        nulls_first: None,
                    });
                }
                let (name, asc) = match spec.strip_prefix('-') {
                    Some(name) => (name, false),
                    None => (spec.as_str(), true),
                };
                let field = self.model().require_field(name)?;
                Ok(OrderByExpr {
                    expr: Expression::column(&self.model().table, &field.column),
                    asc: Some(asc),
                    nulls_first: None,
                })
            })
            .collect()
    }
}

/// Parenthesize boolean compounds before they become an operand.
fn group(expr: Expression) -> Expression {
    match expr {
        Expression::BinaryOp {
            op: BinaryOperator::And | BinaryOperator::Or,
            ..
        } => Expression::Nested(Box::new(expr)),
        other => other,
    }
}

/// Forget the parameters bound since `mark` when `cond` no longer
/// references them.
fn release_if_constant(cond: Cond, params: &mut Vec<Value>, mark: usize) -> Cond {
    if !matches!(cond, Cond::Expr(_)) {
        params.truncate(mark);
    }
    cond
}

fn join(parts: Vec<Expression>, op: BinaryOperator) -> Option<Expression> {
    let single = parts.len() == 1;
    parts
        .into_iter()
        .map(|p| if single { p } else { group(p) })
        .reduce(|acc, next| Expression::binary(acc, op.clone(), next))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees() -> QueryDescriptor {
        ModelMeta::new("Employee", "employees")
            .primary_key("id")
            .field("name")
            .foreign_key("dept")
            .into()
    }

    #[test]
    fn test_compile_base_descriptor() {
        let (sql, params) = employees().compiler().as_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"employees\".\"id\", \"employees\".\"name\", \"employees\".\"dept_id\" FROM \"employees\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_get_select_marks_relations() {
        let (columns, info) = employees().compiler().get_select().unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[2].name, "dept");
        assert_eq!(columns[2].column, "dept_id");
        assert_eq!(columns[2].relation, Some(RelationKind::ForeignKey));
        assert_eq!(info.select_fields, vec![0, 1, 2]);
        assert_eq!(info.model.name, "Employee");
    }

    #[test]
    fn test_filter_binds_positional_parameters() {
        let d = employees()
            .filter(Q::new("name__icontains", "al"))
            .filter(Q::new("dept", 7));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with(
            "WHERE \"employees\".\"name\" ILIKE $1 AND \"employees\".\"dept_id\" = $2"
        ));
        assert_eq!(params, vec![Value::Text("%al%".into()), Value::Int32(7)]);
    }

    #[test]
    fn test_exclude_negates_whole_predicate() {
        let d = employees().exclude(Q::new("id__gt", 10) | Q::new("name", "Bob"));
        let (sql, _) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with(
            "WHERE NOT (\"employees\".\"id\" > $1 OR \"employees\".\"name\" = $2)"
        ));
    }

    #[test]
    fn test_or_inside_and_is_parenthesized() {
        let d = employees()
            .filter(Q::new("id", 1) | Q::new("id", 2))
            .filter(Q::new("name__startswith", "A_"));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(sql.contains(
            "WHERE (\"employees\".\"id\" = $1 OR \"employees\".\"id\" = $2) AND \"employees\".\"name\" LIKE $3"
        ));
        assert_eq!(params[2], Value::Text("A\\_%".into()));
    }

    #[test]
    fn test_exact_null_becomes_is_null() {
        let d = employees().filter(Q::new("dept", Value::Null));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with("\"employees\".\"dept_id\" IS NULL"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_empty_in_list_is_structurally_empty() {
        let d = employees().filter(Q::new("id__in", Vec::<i64>::new()));
        assert_eq!(d.compiler().as_sql(), Err(CompileError::EmptyResultSet));
        // The select list is still available.
        assert!(d.compiler().get_select().is_ok());
    }

    #[test]
    fn test_negated_empty_in_list_matches_everything() {
        let d = employees().exclude(Q::new("id__in", Vec::<i64>::new()));
        let (sql, _) = d.compiler().as_sql().unwrap();
        assert!(!sql.contains("WHERE"));
    }

    fn placeholders(sql: &str) -> Vec<usize> {
        sql.split('$')
            .skip(1)
            .filter_map(|rest| {
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .collect()
    }

    fn assert_contiguous(sql: &str, params: &[Value]) {
        let mut seen = placeholders(sql);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (1..=params.len()).collect::<Vec<_>>(), "{}", sql);
    }

    #[test]
    fn test_always_branch_drops_its_parameters() {
        let d = employees()
            .filter(Q::new("name", "x") | !Q::new("id__in", Vec::<i64>::new()));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(!sql.contains("WHERE"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_never_branch_drops_its_parameters() {
        let d = employees().filter(
            (Q::new("name", "x") & Q::new("id__in", Vec::<i64>::new())) | Q::new("id", 5),
        );
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with("WHERE \"employees\".\"id\" = $1"));
        assert_eq!(params, vec![Value::Int32(5)]);
        assert_contiguous(&sql, &params);
    }

    #[test]
    fn test_parameters_stay_contiguous_around_folded_predicates() {
        let d = employees()
            .filter(Q::new("name__startswith", "a"))
            .exclude(Q::new("dept", 3) & Q::new("id__in", Vec::<i64>::new()))
            .filter(Q::new("id__gt", 1) | (Q::new("dept", 9) & !Q::new("id__in", Vec::<i64>::new())))
            .filter(Q::new("id__in", vec![4i64, 5]));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert_eq!(
            params,
            vec![
                Value::Text("a%".into()),
                Value::Int32(1),
                Value::Int32(9),
                Value::Int64(4),
                Value::Int64(5),
            ]
        );
        assert_contiguous(&sql, &params);
    }

    #[test]
    fn test_never_after_bound_parameters_is_empty() {
        let d = employees()
            .filter(Q::new("name", "x"))
            .filter(!(Q::new("id", 1) | !Q::new("id__in", Vec::<i64>::new())));
        assert_eq!(d.compiler().as_sql(), Err(CompileError::EmptyResultSet));
    }

    #[test]
    fn test_none_is_structurally_empty() {
        let d = employees().none();
        assert!(d.is_none());
        assert_eq!(d.compiler().as_sql(), Err(CompileError::EmptyResultSet));
    }

    #[test]
    fn test_order_by_and_default_ordering() {
        let model = ModelMeta::new("Employee", "employees")
            .primary_key("id")
            .field("name")
            .ordering(["name"]);
        let d = QueryDescriptor::from(model);
        assert!(d.is_ordered());
        let (sql, _) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with("ORDER BY \"employees\".\"name\" ASC"));

        let (sql, _) = d.order_by(["-pk"]).compiler().as_sql().unwrap();
        assert!(sql.ends_with("ORDER BY \"employees\".\"id\" DESC"));

        let cleared = d.order_by(Vec::<String>::new());
        assert!(!cleared.is_ordered());
    }

    #[test]
    fn test_values_projection_names() {
        let d = employees().values(Vec::<String>::new());
        assert_eq!(
            d.compiler().field_names().unwrap(),
            vec!["id", "name", "dept_id"]
        );

        let d = employees().values_list(["name", "dept"]);
        assert_eq!(d.compiler().field_names().unwrap(), vec!["name", "dept"]);
        let (columns, _) = d.compiler().get_select().unwrap();
        assert_eq!(columns[1].column, "dept_id");
        assert!(employees().compiler().field_names().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_field_is_reported() {
        let d = employees().filter(Q::new("salary__gt", 10));
        assert_eq!(
            d.compiler().as_sql(),
            Err(CompileError::UnknownField {
                model: "Employee".into(),
                field: "salary".into(),
            })
        );
    }

    #[test]
    fn test_unknown_lookup_is_reported() {
        let d = employees().filter(Q::new("name__regex", "^A"));
        assert_eq!(
            d.compiler().as_sql(),
            Err(CompileError::UnknownLookup {
                field: "name".into(),
                lookup: "regex".into(),
            })
        );
    }

    #[test]
    fn test_select_related_requires_relation() {
        assert!(employees().select_related(["dept"]).compiler().as_sql().is_ok());
        assert!(matches!(
            employees().prefetch_related(["name"]).compiler().as_sql(),
            Err(CompileError::NotARelation { .. })
        ));
    }

    #[test]
    fn test_raw_predicate() {
        let d = employees().filter(Q::raw("id % 2 = 0"));
        let (sql, _) = d.compiler().as_sql().unwrap();
        assert!(sql.ends_with("WHERE (id % 2 = 0)"));
    }

    #[test]
    fn test_range_and_isnull() {
        let d = employees()
            .filter(Q::new("id__range", vec![1i64, 5]))
            .filter(Q::new("dept__isnull", false));
        let (sql, params) = d.compiler().as_sql().unwrap();
        assert!(sql.contains("\"employees\".\"id\" BETWEEN $1 AND $2"));
        assert!(sql.ends_with("\"employees\".\"dept_id\" IS NOT NULL"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_descriptor_methods_do_not_mutate() {
        let base = employees();
        let narrowed = base.filter(Q::new("id", 1)).distinct().values(["name"]);
        assert_ne!(base, narrowed);
        assert_eq!(base, employees());
        assert_eq!(base.iter_mode(), &IterMode::Model);
    }

    #[test]
    fn test_q_suffix_parsing() {
        assert_eq!(
            Q::new("name__in", vec!["a"]),
            Q::Lookup {
                field: "name".into(),
                lookup: Lookup::In,
                value: Value::Array(vec![Value::Text("a".into())]),
            }
        );
        match Q::new("dept__name", "x") {
            Q::Lookup { field, lookup, .. } => {
                assert_eq!(field, "dept__name");
                assert_eq!(lookup, Lookup::Exact);
            }
            other => panic!("Expected lookup, got {:?}", other),
        }
        assert_eq!(!!Q::raw("1 = 1"), Q::raw("1 = 1"));
    }
}
