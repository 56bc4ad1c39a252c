//! Build [`ModelMeta`] from the live catalog.

use super::driver::{DriverError, ErrorCategory};
use super::registry::Connections;
use super::value::{Row, Value};
use crate::ast::{ModelMeta, RelationKind};
use crate::error::Result;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.column_name::text AS name,
        c.data_type::text AS data_type,
        EXISTS (
            SELECT 1
            FROM pg_catalog.pg_constraint k
            JOIN pg_catalog.pg_attribute a
                ON a.attrelid = k.conrelid AND a.attnum = ANY(k.conkey)
            WHERE k.conrelid = format('%I.%I', $1::text, $2::text)::regclass
              AND k.contype = 'p'
              AND a.attname = c.column_name
        ) AS is_primary_key,
        EXISTS (
            SELECT 1
            FROM pg_catalog.pg_constraint k
            JOIN pg_catalog.pg_attribute a
                ON a.attrelid = k.conrelid AND a.attnum = ANY(k.conkey)
            WHERE k.conrelid = format('%I.%I', $1::text, $2::text)::regclass
              AND k.contype = 'u'
              AND array_length(k.conkey, 1) = 1
              AND a.attname = c.column_name
        ) AS is_unique,
        (
            SELECT k.confrelid::regclass::text
            FROM pg_catalog.pg_constraint k
            JOIN pg_catalog.pg_attribute a
                ON a.attrelid = k.conrelid AND a.attnum = ANY(k.conkey)
            WHERE k.conrelid = format('%I.%I', $1::text, $2::text)::regclass
              AND k.contype = 'f'
              AND array_length(k.conkey, 1) = 1
              AND a.attname = c.column_name
            LIMIT 1
        ) AS references_table
    FROM information_schema.columns c
    WHERE c.table_schema = $1::text AND c.table_name = $2::text
    ORDER BY c.ordinal_position
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDetails {
    pub name: String,
    pub data_type: String,
    pub is_primary_key: bool,
    pub is_unique: bool,
    /// Referenced table for single-column foreign keys.
    pub references: Option<String>,
}

impl ColumnDetails {
    fn from_row(row: &Row) -> std::result::Result<Self, DriverError> {
        let malformed = || DriverError::new(ErrorCategory::Unknown, "unexpected catalog row shape");
        let text = |i: usize| -> std::result::Result<String, DriverError> {
            row.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(malformed)
        };
        let flag = |i: usize| row.get(i).and_then(Value::as_bool).unwrap_or(false);

        Ok(Self {
            name: text(0)?,
            data_type: text(1)?,
            is_primary_key: flag(2),
            is_unique: flag(3),
            references: row.get(4).and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Introspect `schema.table` on `alias` and describe it as a model.
pub fn introspect_model(
    connections: &Connections,
    alias: &str,
    schema: &str,
    table: &str,
) -> Result<ModelMeta> {
    let mut cursor = connections.cursor(alias)?;
    let params = [Value::from(schema), Value::from(table)];
    let fetched = cursor
        .execute(COLUMNS_SQL, &params)
        .and_then(|_| cursor.fetch_all());
    cursor.close();

    let columns = fetched?
        .iter()
        .map(ColumnDetails::from_row)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    tracing::debug!(alias = %alias, schema = %schema, table = %table, columns = columns.len(), "introspected table");

    Ok(model_from_columns(table, &columns)
        .schema(schema)
        .database(alias))
}

/// Map catalog columns onto model fields. Foreign-key columns become
/// relations named without their `_id` suffix; unique ones are one-to-one.
pub fn model_from_columns(table: &str, columns: &[ColumnDetails]) -> ModelMeta {
    let mut model = ModelMeta::new(model_name(table), table);
    for column in columns {
        model = if column.is_primary_key {
            model.primary_key(&column.name)
        } else if column.references.is_some() {
            let name = column
                .name
                .strip_suffix("_id")
                .unwrap_or(&column.name)
                .to_string();
            let kind = if column.is_unique {
                RelationKind::OneToOne
            } else {
                RelationKind::ForeignKey
            };
            model.relation(name, &column.name, kind)
        } else {
            model.field(&column.name)
        };
    }
    model
}

/// `order_items` → `OrderItems`.
fn model_name(table: &str) -> String {
    table
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, pk: bool, unique: bool, references: Option<&str>) -> ColumnDetails {
        ColumnDetails {
            name: name.into(),
            data_type: "integer".into(),
            is_primary_key: pk,
            is_unique: unique,
            references: references.map(String::from),
        }
    }

    #[test]
    fn test_model_name() {
        assert_eq!(model_name("employees"), "Employees");
        assert_eq!(model_name("order_items"), "OrderItems");
        assert_eq!(model_name("_odd__name"), "OddName");
    }

    #[test]
    fn test_model_from_columns() {
        let model = model_from_columns(
            "employees",
            &[
                column("id", true, true, None),
                column("name", false, false, None),
                column("dept_id", false, false, Some("departments")),
                column("badge_id", false, true, Some("badges")),
            ],
        );
        assert_eq!(model.name, "Employees");
        assert_eq!(model.pk().map(|f| f.name.as_str()), Some("id"));
        let dept = model.get_field("dept").unwrap();
        assert_eq!(dept.column, "dept_id");
        assert_eq!(dept.relation, Some(RelationKind::ForeignKey));
        assert_eq!(
            model.get_field("badge").unwrap().relation,
            Some(RelationKind::OneToOne)
        );
        assert!(model.get_field("name").unwrap().relation.is_none());
    }

    #[test]
    fn test_column_details_from_row() {
        let row = vec![
            Value::from("dept_id"),
            Value::from("integer"),
            Value::Bool(false),
            Value::Bool(false),
            Value::from("departments"),
        ];
        let details = ColumnDetails::from_row(&row).unwrap();
        assert_eq!(details.references.as_deref(), Some("departments"));
        assert!(!details.is_primary_key);

        let short = vec![Value::Int32(1)];
        assert!(ColumnDetails::from_row(&short).is_err());
    }

    #[test]
    fn test_introspect_through_driver() {
        use crate::config::Settings;
        use crate::db::stub::StubDriver;
        use std::sync::Arc;

        let stub = StubDriver::new(vec![
            vec![
                Value::from("id"),
                Value::from("integer"),
                Value::Bool(true),
                Value::Bool(true),
                Value::Null,
            ],
            vec![
                Value::from("name"),
                Value::from("text"),
                Value::Bool(false),
                Value::Bool(false),
                Value::Null,
            ],
        ]);
        let connections =
            Connections::connect_all(Arc::new(stub.clone()), &Settings::for_aliases(&["legacy"]))
                .unwrap();
        let model = introspect_model(&connections, "legacy", "hr", "staff").unwrap();
        assert_eq!(model.database, "legacy");
        assert_eq!(model.schema.as_deref(), Some("hr"));
        assert_eq!(model.fields.len(), 2);
        assert_eq!(
            stub.executed_params(),
            vec![vec![Value::from("hr"), Value::from("staff")]]
        );
        assert_eq!(stub.cursors_closed(), 1);
    }
}
