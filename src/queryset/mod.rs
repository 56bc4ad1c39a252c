//! Lazy, cursor-bound result sets.
//!
//! A [`QuerySet`] wraps one immutable [`QueryDescriptor`], compiles it once,
//! and runs it on first consumption. Iterating `&mut QuerySet` reads through
//! its own cursor and cache; [`QuerySet::iter`] starts over on a clone.
//! Chain methods never touch `self`: each derives a new descriptor and binds
//! a new `QuerySet` to it.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use legacyset::{ast::{ModelMeta, Q}, db::Connections, queryset::QuerySet};
//! # fn demo(connections: Arc<Connections>) -> legacyset::error::Result<()> {
//! let model = ModelMeta::new("Employee", "employees")
//!     .primary_key("id")
//!     .field("name")
//!     .foreign_key("dept");
//! let staff = QuerySet::for_model(Arc::new(model), connections)?
//!     .filter(Q::new("name__istartswith", "a"))?
//!     .order_by(["-id"])?;
//! for employee in staff.iter() {
//!     println!("{}", employee?.to_json());
//! }
//! # Ok(())
//! # }
//! ```

mod cursor;
mod materialize;
mod statement;

pub use cursor::ResultCursor;
pub use materialize::{shape, Entity, Record, Shaped};
pub use statement::{compile, ColumnRef, CompiledStatement, OutputShape};

use serde::{Deserialize, Serialize};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};
use std::sync::Arc;

use crate::ast::{ModelMeta, QueryDescriptor, Q};
use crate::db::{self, Connections, Row, Value};
use crate::error::{QuerySetError, Result};

/// Key accepted by [`QuerySet::get_item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    Index(i64),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl IndexKey {
    /// Parse `"3"`, `"2:5"`, `":5"`, `"2:"` or `"2:5:1"`.
    pub fn parse(key: &str) -> Result<Self> {
        let unsupported = || QuerySetError::UnsupportedKeyType(key.to_string());
        let bound = |part: &str| -> Result<Option<i64>> {
            let part = part.trim();
            if part.is_empty() {
                Ok(None)
            } else {
                part.parse().map(Some).map_err(|_| unsupported())
            }
        };

        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            [index] => bound(index)?.map(IndexKey::Index).ok_or_else(unsupported),
            [start, stop] => Ok(IndexKey::Slice {
                start: bound(start)?,
                stop: bound(stop)?,
                step: None,
            }),
            [start, stop, step] => Ok(IndexKey::Slice {
                start: bound(start)?,
                stop: bound(stop)?,
                step: bound(step)?,
            }),
            _ => Err(unsupported()),
        }
    }
}

impl From<i64> for IndexKey {
    fn from(index: i64) -> Self {
        IndexKey::Index(index)
    }
}

impl From<usize> for IndexKey {
    fn from(index: usize) -> Self {
        IndexKey::Index(index as i64)
    }
}

impl From<Range<usize>> for IndexKey {
    fn from(range: Range<usize>) -> Self {
        IndexKey::Slice {
            start: Some(range.start as i64),
            stop: Some(range.end as i64),
            step: None,
        }
    }
}

impl From<RangeFrom<usize>> for IndexKey {
    fn from(range: RangeFrom<usize>) -> Self {
        IndexKey::Slice {
            start: Some(range.start as i64),
            stop: None,
            step: None,
        }
    }
}

impl From<RangeTo<usize>> for IndexKey {
    fn from(range: RangeTo<usize>) -> Self {
        IndexKey::Slice {
            start: None,
            stop: Some(range.end as i64),
            step: None,
        }
    }
}

impl From<RangeFull> for IndexKey {
    fn from(_: RangeFull) -> Self {
        IndexKey::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }
}

fn non_negative(value: Option<i64>, key: &IndexKey) -> Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) if v >= 0 => Ok(Some(v as usize)),
        Some(_) => Err(QuerySetError::UnsupportedKeyType(format!("{:?}", key))),
    }
}

/// Result of [`QuerySet::get_item`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    One(Shaped),
    Many(Vec<Shaped>),
}

impl Fetched {
    pub fn into_vec(self) -> Vec<Shaped> {
        match self {
            Fetched::One(row) => vec![row],
            Fetched::Many(rows) => rows,
        }
    }
}

/// Result of [`QuerySet::values_list`]: lazy tuples, or one eagerly
/// flattened column.
#[derive(Debug)]
pub enum ValuesList {
    Lazy(QuerySet),
    Flat(Vec<Value>),
}

/// Persisted form of a [`QuerySet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySetState {
    pub model: ModelMeta,
    pub database: String,
    /// Present when the result set was fully materialized.
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
}

#[derive(Debug)]
pub struct QuerySet {
    descriptor: QueryDescriptor,
    cursor: ResultCursor,
}

impl Clone for QuerySet {
    /// The clone never shares the driver cursor; it opens its own on first
    /// use. A fully materialized cache is carried over as a snapshot.
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            cursor: self.cursor.fork(),
        }
    }
}

/// Iteration over a query set's own cursor: rows read here are cached on it.
pub struct Rows<'a> {
    set: &'a mut QuerySet,
}

impl Iterator for Rows<'_> {
    type Item = Result<Shaped>;

    fn next(&mut self) -> Option<Self::Item> {
        self.set.fetch_next().transpose()
    }
}

impl<'a> IntoIterator for &'a mut QuerySet {
    type Item = Result<Shaped>;
    type IntoIter = Rows<'a>;

    fn into_iter(self) -> Rows<'a> {
        Rows { set: self }
    }
}

/// Owning iteration, as returned by [`QuerySet::iter`].
pub struct IntoRows {
    set: QuerySet,
}

impl Iterator for IntoRows {
    type Item = Result<Shaped>;

    fn next(&mut self) -> Option<Self::Item> {
        self.set.fetch_next().transpose()
    }
}

impl IntoIterator for QuerySet {
    type Item = Result<Shaped>;
    type IntoIter = IntoRows;

    fn into_iter(self) -> IntoRows {
        IntoRows { set: self }
    }
}

impl QuerySet {
    /// Compile `descriptor` and bind a cursor to it.
    pub fn new(descriptor: QueryDescriptor, connections: Arc<Connections>) -> Result<Self> {
        let statement = Arc::new(compile(&descriptor)?);
        let cursor = ResultCursor::open(statement, connections)?;
        Ok(Self { descriptor, cursor })
    }

    /// Every row of `model`.
    pub fn for_model(model: Arc<ModelMeta>, connections: Arc<Connections>) -> Result<Self> {
        Self::new(QueryDescriptor::new(model), connections)
    }

    /// Bind against the process-wide connection table.
    pub fn with_global(descriptor: QueryDescriptor) -> Result<Self> {
        let connections = db::global()
            .ok_or_else(|| QuerySetError::Config("connection table not installed".into()))?;
        Self::new(descriptor, connections)
    }

    fn chain(&self, descriptor: QueryDescriptor) -> Result<Self> {
        Self::new(descriptor, Arc::clone(self.cursor.connections()))
    }

    fn shape(&self, row: &[Value]) -> Result<Shaped> {
        shape(row, self.cursor.statement(), self.cursor.connections().debug())
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn statement(&self) -> &CompiledStatement {
        self.cursor.statement()
    }

    /// Current statement text. Empty for a structurally empty query.
    pub fn sql(&self) -> &str {
        self.cursor.sql()
    }

    pub fn params(&self) -> &[Value] {
        &self.cursor.statement().params
    }

    pub fn ordered(&self) -> bool {
        self.descriptor.is_ordered()
    }

    pub fn is_materialized(&self) -> bool {
        self.cursor.is_materialized()
    }

    pub fn is_executed(&self) -> bool {
        self.cursor.is_executed()
    }

    /// A fresh iteration over the same statement.
    pub fn iter(&self) -> IntoRows {
        self.clone().into_iter()
    }

    /// Advance this query set's cursor by one shaped row.
    pub fn fetch_next(&mut self) -> Result<Option<Shaped>> {
        match self.cursor.next_row()? {
            Some(row) => self.shape(&row).map(Some),
            None => Ok(None),
        }
    }

    pub fn execute(&mut self) -> Result<()> {
        self.cursor.execute()
    }

    /// Materialize every remaining row into the cache.
    pub fn fetch_all(&mut self) -> Result<()> {
        self.cursor.fetch_all()
    }

    /// Materialize and shape every row.
    pub fn to_vec(&mut self) -> Result<Vec<Shaped>> {
        self.cursor.fetch_all()?;
        self.cursor.rows().iter().map(|row| self.shape(row)).collect()
    }

    pub fn close(&mut self) {
        self.cursor.close()
    }

    pub fn count(&self) -> Result<usize> {
        self.cursor.count()
    }

    pub fn len(&self) -> Result<usize> {
        self.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    /// A single row for an index, a list of rows for a slice. Negative
    /// bounds and steps other than 1 are rejected.
    pub fn get_item(&mut self, key: impl Into<IndexKey>) -> Result<Fetched> {
        let key = key.into();
        match key {
            IndexKey::Index(index) => {
                let index = non_negative(Some(index), &key)?.unwrap_or(0);
                let row = self.cursor.row_at(index)?;
                Ok(Fetched::One(self.shape(&row)?))
            }
            IndexKey::Slice { start, stop, step } => {
                if !matches!(step, None | Some(1)) {
                    return Err(QuerySetError::UnsupportedKeyType(format!("{:?}", key)));
                }
                let start = non_negative(start, &key)?;
                let stop = non_negative(stop, &key)?;
                let rows = self.cursor.rows_in(start, stop)?;
                rows.iter()
                    .map(|row| self.shape(row))
                    .collect::<Result<Vec<_>>>()
                    .map(Fetched::Many)
            }
        }
    }

    pub fn first(&self) -> Result<Option<Shaped>> {
        let mut clone = self.clone();
        let first = clone.fetch_next();
        clone.close();
        first
    }

    pub fn last(&self) -> Result<Option<Shaped>> {
        let mut clone = self.clone();
        clone.fetch_all()?;
        clone.cursor.rows().last().map(|row| self.shape(row)).transpose()
    }

    /// `filter(q)` then `first()`.
    pub fn get(&self, q: Q) -> Result<Option<Shaped>> {
        self.filter(q)?.first()
    }

    pub fn all(&self) -> Result<Self> {
        self.chain(self.descriptor.all())
    }

    pub fn filter(&self, q: Q) -> Result<Self> {
        self.chain(self.descriptor.filter(q))
    }

    pub fn exclude(&self, q: Q) -> Result<Self> {
        self.chain(self.descriptor.exclude(q))
    }

    pub fn distinct(&self) -> Result<Self> {
        self.chain(self.descriptor.distinct())
    }

    pub fn order_by<I, S>(&self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain(self.descriptor.order_by(fields))
    }

    pub fn select_related<I, S>(&self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain(self.descriptor.select_related(fields))
    }

    pub fn prefetch_related<I, S>(&self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain(self.descriptor.prefetch_related(fields))
    }

    pub fn values<I, S>(&self, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain(self.descriptor.values(fields))
    }

    /// Tuples of `fields`. With `flat` and exactly one field, evaluates
    /// eagerly and returns that column's values.
    pub fn values_list<I, S>(&self, fields: I, flat: bool) -> Result<ValuesList>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if flat && fields.len() == 1 {
            let name = fields[0].clone();
            let mut values = self.values(fields)?;
            let flattened = values
                .to_vec()?
                .into_iter()
                .map(|row| {
                    row.as_mapping()
                        .and_then(|record| record.get(&name))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            values.close();
            return Ok(ValuesList::Flat(flattened));
        }
        Ok(ValuesList::Lazy(self.chain(self.descriptor.values_list(fields))?))
    }

    /// Rebind to a descriptor with a different iteration mode.
    pub fn iterable(&self, mode: crate::ast::IterMode) -> Result<Self> {
        self.chain(self.descriptor.iterable(mode))
    }

    /// Bound to the canonical empty descriptor: no SQL, no cursor.
    pub fn none(&self) -> Result<Self> {
        self.chain(self.descriptor.none())
    }

    /// Accepted and ignored.
    pub fn add_hints(&mut self, _hints: &[(&str, &str)]) {}

    /// Identity. Route with [`QueryDescriptor::using`] before binding.
    pub fn using(self, _alias: &str) -> Self {
        self
    }

    pub fn next_is_sticky(self) -> Self {
        self
    }

    pub fn snapshot(&self) -> QuerySetState {
        QuerySetState {
            model: ModelMeta::clone(self.descriptor.model()),
            database: self.descriptor.database().to_string(),
            rows: self
                .cursor
                .is_materialized()
                .then(|| self.cursor.rows().to_vec()),
        }
    }

    /// Rebuild from a snapshot: the model's base query on the recorded
    /// database, with the cached rows restored if there were any.
    pub fn restore(state: QuerySetState, connections: Arc<Connections>) -> Result<Self> {
        let descriptor = QueryDescriptor::new(Arc::new(state.model)).using(state.database);
        let mut restored = Self::new(descriptor, connections)?;
        if let Some(rows) = state.rows {
            restored.cursor.restore_rows(rows);
        }
        Ok(restored)
    }
}
