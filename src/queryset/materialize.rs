//! Raw row → shaped result.

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::sync::Arc;

use super::statement::{CompiledStatement, OutputShape};
use crate::ast::ModelMeta;
use crate::db::Value;
use crate::error::{QuerySetError, Result};

/// Insertion-ordered name → value map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record(Vec<(String, Value)>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. An overwritten key keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0.into_iter().map(|(_, v)| v).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(k, v)| (k, v.to_json())))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// A model instance hydrated from one row. Relations are never traversed:
/// each one carries only its raw `<relation>_id` scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    model: Arc<ModelMeta>,
    attributes: Record,
    relations: Vec<String>,
}

impl Entity {
    pub fn model(&self) -> &ModelMeta {
        &self.model
    }

    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    /// Relation names whose raw scalar was set.
    pub fn relations(&self) -> &[String] {
        &self.relations
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn pk(&self) -> Option<&Value> {
        self.model.pk().and_then(|f| self.attributes.get(&f.attname()))
    }

    pub fn foreign_key(&self, relation: &str) -> Option<&Value> {
        self.attributes.get(&format!("{}_id", relation))
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.attributes.to_json()
    }

    /// Decode into a caller-defined struct with matching field names.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }
}

impl Serialize for Entity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.attributes.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shaped {
    Entity(Entity),
    Mapping(Record),
    Tuple(Vec<Value>),
}

impl Shaped {
    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Shaped::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Record> {
        match self {
            Shaped::Mapping(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Shaped::Tuple(values) => Some(values),
            _ => None,
        }
    }

    /// Output names and values in selection order.
    pub fn cells(&self) -> Vec<(Option<&str>, &Value)> {
        match self {
            Shaped::Entity(entity) => entity.attributes.iter().map(|(k, v)| (Some(k), v)).collect(),
            Shaped::Mapping(record) => record.iter().map(|(k, v)| (Some(k), v)).collect(),
            Shaped::Tuple(values) => values.iter().map(|v| (None, v)).collect(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Shaped::Entity(entity) => entity.to_json(),
            Shaped::Mapping(record) => record.to_json(),
            Shaped::Tuple(values) => {
                serde_json::Value::Array(values.iter().map(Value::to_json).collect())
            }
        }
    }
}

impl Serialize for Shaped {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Shaped::Entity(entity) => entity.serialize(serializer),
            Shaped::Mapping(record) => record.serialize(serializer),
            Shaped::Tuple(values) => serializer.collect_seq(values.iter().map(Value::to_json)),
        }
    }
}

/// Shape one raw row. Each selected index contributes its projected name
/// when the statement carries a projection, otherwise its column name for
/// non-relation columns.
pub fn shape(row: &[Value], statement: &CompiledStatement, debug: bool) -> Result<Shaped> {
    let mut record = Record::new();
    for &index in &statement.selected {
        let Some(value) = row.get(index) else {
            break;
        };
        match (statement.projection.get(index), statement.columns.get(index)) {
            (Some(name), _) => record.insert(name.as_str(), value.clone()),
            (None, Some(column)) if !column.is_relation => {
                record.insert(column.name.as_str(), value.clone())
            }
            _ => {}
        }
    }

    match &statement.shape {
        OutputShape::Entity => {
            let Some(model) = statement.entity.clone() else {
                return Err(QuerySetError::UnknownOutputShape(String::from("entity")));
            };
            let mut relations = Vec::new();
            for &index in &statement.selected {
                let (Some(column), Some(value)) = (statement.columns.get(index), row.get(index))
                else {
                    break;
                };
                if column.is_relation {
                    record.insert(format!("{}_id", column.name), value.clone());
                    relations.push(column.name.clone());
                }
            }
            Ok(Shaped::Entity(Entity {
                model,
                attributes: record,
                relations,
            }))
        }
        OutputShape::Mapping => Ok(Shaped::Mapping(record)),
        OutputShape::Tuple => Ok(Shaped::Tuple(record.into_values())),
        OutputShape::Unrecognized(mode) => {
            if debug {
                tracing::error!(mode = %mode, sql = %statement.sql, "no materializer for iteration mode");
            }
            Err(QuerySetError::UnknownOutputShape(mode.clone()))
        }
    }
}
