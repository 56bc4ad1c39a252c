use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls};

use super::driver::{Driver, DriverConnection, DriverCursor, DriverError, ErrorCategory};
use super::value::{Row, Value};

/// Connection parameters for one logical database alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name on the server
    pub name: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Only honoured for
    /// `Prefer`/`Require`.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

fn default_port() -> u16 {
    5432
}

/// SSL/TLS connection modes, matching libpq's `sslmode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.name),
            quote_conn_value(&self.user),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.name)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: default_port(),
            name: String::from("postgres"),
            user: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

/// Connect one alias. Runs on the connection's own runtime, which also
/// drives the spawned connection task for the client's lifetime.
pub async fn create_client(config: &DatabaseConfig) -> Result<Client> {
    let conn_string = config.connection_string();
    let timeout = Duration::from_secs(15);

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "connection closed");
                }
            });
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let strict = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "connection closed");
                }
            });
            client
        }
    };

    Ok(client)
}

/// TLS for `Prefer`/`Require`/`Verify*`. Under `strict_verify` the
/// `accept_invalid_certs` escape hatch is ignored.
fn build_tls_connector(config: &DatabaseConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        let cert = native_tls::Certificate::from_pem(&ca_data)
            .with_context(|| format!("Failed to parse CA certificate: {}", ca_path))?;
        builder.add_root_certificate(cert);
    }

    let connector = builder.build().context("Failed to build TLS connector")?;

    Ok(MakeTlsConnector::new(connector))
}

/// Quote a value for use in a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Blocking PostgreSQL driver built on `tokio-postgres`.
///
/// Each connection owns a current-thread runtime; every driver call blocks
/// the caller on it, so the adapter stays synchronous end to end.
#[derive(Debug, Default)]
pub struct PostgresDriver;

impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn connect(&self, config: &DatabaseConfig) -> Result<Box<dyn DriverConnection>, DriverError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DriverError::connection(format!("failed to start runtime: {}", e)))?;
        let client = runtime
            .block_on(create_client(config))
            .map_err(|e| DriverError::connection(format!("{:#}", e)))?;
        Ok(Box::new(PgConnection {
            runtime: Arc::new(runtime),
            client: Arc::new(client),
        }))
    }
}

struct PgConnection {
    runtime: Arc<Runtime>,
    client: Arc<Client>,
}

impl DriverConnection for PgConnection {
    fn cursor(&mut self) -> Result<Box<dyn DriverCursor>, DriverError> {
        if self.client.is_closed() {
            return Err(DriverError::connection("connection is closed"));
        }
        Ok(Box::new(PgCursor {
            runtime: Arc::clone(&self.runtime),
            client: Some(Arc::clone(&self.client)),
            buffered: VecDeque::new(),
            row_count: None,
            executed: false,
        }))
    }
}

/// Client-side buffered cursor: `execute` pulls the whole result set.
struct PgCursor {
    runtime: Arc<Runtime>,
    client: Option<Arc<Client>>,
    buffered: VecDeque<Row>,
    row_count: Option<u64>,
    executed: bool,
}

impl DriverCursor for PgCursor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DriverError::connection("cursor is closed"))?;
        let statement = self
            .runtime
            .block_on(client.prepare(sql))
            .map_err(|e| DriverError::from_pg_error(&e, sql))?;
        let owned = to_sql_params(params, statement.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> = owned
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = self
            .runtime
            .block_on(client.query(&statement, &refs))
            .map_err(|e| DriverError::from_pg_error(&e, sql))?;

        self.buffered = rows.iter().map(convert_row).collect::<Result<_, _>>()?;
        self.row_count = Some(self.buffered.len() as u64);
        self.executed = true;
        Ok(())
    }

    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError> {
        Ok(self.buffered.pop_front())
    }

    fn fetch_all(&mut self) -> Result<Vec<Row>, DriverError> {
        Ok(self.buffered.drain(..).collect())
    }

    fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    fn is_executed(&self) -> bool {
        self.executed
    }

    fn close(&mut self) {
        self.client = None;
        self.buffered.clear();
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Coerce bind values to the parameter types the server inferred.
fn to_sql_params(params: &[Value], types: &[Type]) -> Result<Vec<BoxedParam>, DriverError> {
    params
        .iter()
        .enumerate()
        .map(|(i, value)| match types.get(i) {
            Some(ty) => to_sql_param(value, ty),
            None => Ok(untyped_param(value)),
        })
        .collect()
}

fn to_sql_param(value: &Value, ty: &Type) -> Result<BoxedParam, DriverError> {
    let mismatch = || {
        DriverError::new(
            ErrorCategory::Execution,
            format!("cannot bind {} as {}", value.display(), ty.name()),
        )
    };
    let float = || match value {
        Value::Float32(f) => Some(f64::from(*f)),
        Value::Float64(f) => Some(*f),
        other => other.as_i64().map(|i| i as f64),
    };

    let param: BoxedParam = match (value, ty) {
        (Value::Null, _) => typed_null(ty),
        (_, &Type::INT2) => {
            let i = value.as_i64().ok_or_else(mismatch)?;
            Box::new(i16::try_from(i).map_err(|_| mismatch())?)
        }
        (_, &Type::INT4) => {
            let i = value.as_i64().ok_or_else(mismatch)?;
            Box::new(i32::try_from(i).map_err(|_| mismatch())?)
        }
        (_, &Type::INT8) => Box::new(value.as_i64().ok_or_else(mismatch)?),
        (_, &Type::FLOAT4) => Box::new(float().ok_or_else(mismatch)? as f32),
        (_, &Type::FLOAT8) => Box::new(float().ok_or_else(mismatch)?),
        (_, &Type::NUMERIC) => Box::new(match value {
            Value::Numeric(d) => *d,
            Value::Text(s) => s.trim().parse::<Decimal>().map_err(|_| mismatch())?,
            Value::Float32(_) | Value::Float64(_) => {
                Decimal::try_from(float().ok_or_else(mismatch)?).map_err(|_| mismatch())?
            }
            other => Decimal::from(other.as_i64().ok_or_else(mismatch)?),
        }),
        (Value::Array(items), &Type::INT4_ARRAY) => Box::new(
            items
                .iter()
                .map(|item| item.as_i64().and_then(|i| i32::try_from(i).ok()).ok_or_else(mismatch))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (Value::Array(items), &Type::INT8_ARRAY) => Box::new(
            items
                .iter()
                .map(|item| item.as_i64().ok_or_else(mismatch))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        (Value::Text(s), &Type::DATE) => Box::new(
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        (Value::Text(s), &Type::TIMESTAMP) => Box::new(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map_err(|_| mismatch())?,
        ),
        (Value::Text(s), &Type::TIMESTAMPTZ) => Box::new(
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| mismatch())?,
        ),
        (Value::Text(s), &Type::BOOL) => Box::new(s.parse::<bool>().map_err(|_| mismatch())?),
        (
            Value::Int16(_) | Value::Int32(_) | Value::Int64(_) | Value::Float32(_) | Value::Float64(_),
            &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME,
        ) => Box::new(value.display()),
        _ => untyped_param(value),
    };
    Ok(param)
}

/// NULL of the native type matching `ty`, so the type check still passes.
fn typed_null(ty: &Type) -> BoxedParam {
    match *ty {
        Type::BOOL => Box::new(None::<bool>),
        Type::INT2 => Box::new(None::<i16>),
        Type::INT4 => Box::new(None::<i32>),
        Type::INT8 => Box::new(None::<i64>),
        Type::FLOAT4 => Box::new(None::<f32>),
        Type::FLOAT8 => Box::new(None::<f64>),
        Type::NUMERIC => Box::new(None::<Decimal>),
        Type::BYTEA => Box::new(None::<Vec<u8>>),
        Type::DATE => Box::new(None::<NaiveDate>),
        Type::TIME => Box::new(None::<NaiveTime>),
        Type::TIMESTAMP => Box::new(None::<NaiveDateTime>),
        Type::TIMESTAMPTZ => Box::new(None::<DateTime<Utc>>),
        Type::JSON | Type::JSONB => Box::new(None::<serde_json::Value>),
        _ => Box::new(None::<String>),
    }
}

fn untyped_param(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(i) => Box::new(*i),
        Value::Int32(i) => Box::new(*i),
        Value::Int64(i) => Box::new(*i),
        Value::Float32(f) => Box::new(*f),
        Value::Float64(f) => Box::new(*f),
        Value::Numeric(d) => Box::new(*d),
        Value::Text(s) | Value::Unknown(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::TimestampTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(items) => Box::new(items.iter().map(Value::display).collect::<Vec<_>>()),
    }
}

fn convert_row(row: &tokio_postgres::Row) -> Result<Row, DriverError> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| extract_value(row, i, col.type_()))
        .collect()
}

/// Decode one cell. A cell the driver cannot decode is an error, never a NULL.
fn extract_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value, DriverError> {
    fn cell<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>, DriverError> {
        row.try_get::<_, Option<T>>(idx).map_err(|e| {
            let column = &row.columns()[idx];
            DriverError::new(
                ErrorCategory::Execution,
                format!(
                    "cannot decode column {:?} of type {}: {}",
                    column.name(),
                    column.type_(),
                    e
                ),
            )
        })
    }
    fn list<'a, T: FromSql<'a> + Into<Value>>(
        row: &'a tokio_postgres::Row,
        idx: usize,
    ) -> Result<Option<Value>, DriverError> {
        Ok(cell::<Vec<Option<T>>>(row, idx)?.map(Value::from))
    }

    let value = match *pg_type {
        Type::BOOL => cell(row, idx)?.map(Value::Bool),
        Type::INT2 => cell(row, idx)?.map(Value::Int16),
        Type::INT4 => cell(row, idx)?.map(Value::Int32),
        Type::INT8 => cell(row, idx)?.map(Value::Int64),
        Type::FLOAT4 => cell(row, idx)?.map(Value::Float32),
        Type::FLOAT8 => cell(row, idx)?.map(Value::Float64),
        Type::NUMERIC => cell(row, idx)?.map(Value::Numeric),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            cell(row, idx)?.map(Value::Text)
        }
        Type::BYTEA => cell(row, idx)?.map(Value::Bytes),
        Type::DATE => cell(row, idx)?.map(Value::Date),
        Type::TIME => cell(row, idx)?.map(Value::Time),
        Type::TIMESTAMP => cell(row, idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => cell(row, idx)?.map(Value::TimestampTz),
        Type::JSON | Type::JSONB => cell(row, idx)?.map(Value::Json),
        Type::BOOL_ARRAY => list::<bool>(row, idx)?,
        Type::INT2_ARRAY => list::<i16>(row, idx)?,
        Type::INT4_ARRAY => list::<i32>(row, idx)?,
        Type::INT8_ARRAY => list::<i64>(row, idx)?,
        Type::FLOAT8_ARRAY => list::<f64>(row, idx)?,
        Type::NUMERIC_ARRAY => list::<Decimal>(row, idx)?,
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY => list::<String>(row, idx)?,
        _ => cell::<TextCell>(row, idx)?.map(|text| Value::Unknown(text.0)),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Fallback decoder for types without a dedicated variant. UUIDs render in
/// hyphenated form; enums, `xml` and extension types such as `citext` send
/// text on the wire. Other built-in types (`inet`, `interval`, ...) are
/// binary and must be cast to text in the query.
struct TextCell(String);

impl<'a> FromSql<'a> for TextCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if *ty == Type::UUID {
            if raw.len() != 16 {
                return Err(format!("uuid of {} bytes", raw.len()).into());
            }
            let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
            return Ok(TextCell(format!(
                "{}-{}-{}-{}-{}",
                &hex[0..8],
                &hex[8..12],
                &hex[12..16],
                &hex[16..20],
                &hex[20..32]
            )));
        }
        let text_on_wire = matches!(ty.kind(), Kind::Enum(_))
            || *ty == Type::XML
            || *ty == Type::UNKNOWN
            || ty.schema() != "pg_catalog";
        if !text_on_wire {
            return Err(format!("no decoder for type {}; cast the column to text", ty).into());
        }
        Ok(TextCell(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_quotes_values() {
        let config = DatabaseConfig {
            password: "p'ss\\word".into(),
            ..Default::default()
        };
        let conn = config.connection_string();
        assert!(conn.contains("host='localhost'"));
        assert!(conn.contains("port=5432"));
        assert!(conn.contains("password='p\\'ss\\\\word'"));
        assert!(conn.contains("sslmode=prefer"));
    }

    #[test]
    fn test_display_string() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            name: "legacy".into(),
            user: "app".into(),
            ..Default::default()
        };
        assert_eq!(config.display_string(), "app@db.internal:5432/legacy");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: DatabaseConfig = toml::from_str(
            r#"
            host = "localhost"
            name = "legacy"
            user = "app"
            ssl_mode = "verify-full"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.ssl_mode, SslMode::VerifyFull);
        assert!(config.password.is_empty());
    }

    #[test]
    fn test_password_is_never_serialized() {
        let config = DatabaseConfig {
            password: "secret".into(),
            ..Default::default()
        };
        let encoded = toml::to_string(&config).unwrap();
        assert!(!encoded.contains("secret"));
    }

    #[test]
    fn test_param_conversion_keeps_arity() {
        let params = vec![Value::Int64(1), Value::Null, Value::Text("a".into())];
        let types = [Type::INT4, Type::TEXT, Type::TEXT];
        assert_eq!(to_sql_params(&params, &types).unwrap().len(), 3);
        assert_eq!(to_sql_params(&params, &[]).unwrap().len(), 3);
    }

    #[test]
    fn test_param_coercion() {
        assert!(to_sql_param(&Value::Int64(7), &Type::INT4).is_ok());
        assert!(to_sql_param(&Value::Int64(i64::MAX), &Type::INT4).is_err());
        assert!(to_sql_param(&Value::Int32(7), &Type::FLOAT8).is_ok());
        assert!(to_sql_param(&Value::from("2024-02-29"), &Type::DATE).is_ok());
        assert!(to_sql_param(&Value::from("yesterday"), &Type::DATE).is_err());
        assert!(to_sql_param(&Value::from("abc"), &Type::INT8).is_err());
        assert!(to_sql_param(&Value::Null, &Type::INT8).is_ok());
    }

    #[test]
    fn test_numeric_params_bind_as_decimal() {
        let mut buf = Default::default();
        let param = to_sql_param(&Value::from("19.99"), &Type::NUMERIC).unwrap();
        assert!(param.to_sql_checked(&Type::NUMERIC, &mut buf).is_ok());
        let decoded = Decimal::from_sql(&Type::NUMERIC, &buf[..]).unwrap();
        assert_eq!(decoded.to_string(), "19.99");

        assert!(to_sql_param(&Value::Int32(3), &Type::NUMERIC).is_ok());
        assert!(to_sql_param(&Value::Float64(2.5), &Type::NUMERIC).is_ok());
        assert!(to_sql_param(&Value::from("lots"), &Type::NUMERIC).is_err());
    }

    #[test]
    fn test_int_array_params_follow_element_type() {
        let ids = Value::from(vec![1i64, 2, 3]);
        let param = to_sql_param(&ids, &Type::INT4_ARRAY).unwrap();
        assert!(param.to_sql_checked(&Type::INT4_ARRAY, &mut Default::default()).is_ok());
        assert!(to_sql_param(&Value::from(vec![i64::MAX]), &Type::INT4_ARRAY).is_err());
    }

    #[test]
    fn test_text_cell_renders_uuid() {
        let raw: Vec<u8> = (0u8..16).collect();
        let cell = TextCell::from_sql(&Type::UUID, &raw).unwrap();
        assert_eq!(cell.0, "00010203-0405-0607-0809-0a0b0c0d0e0f");
        assert!(TextCell::from_sql(&Type::UUID, &raw[..4]).is_err());
    }

    #[test]
    fn test_text_cell_rejects_binary_builtins() {
        // inet 10.0.0.1/32 in binary form happens to be valid UTF-8
        let inet = [2u8, 32, 0, 4, 10, 0, 0, 1];
        assert!(TextCell::from_sql(&Type::INET, &inet).is_err());
        assert!(TextCell::from_sql(&Type::INTERVAL, &[0u8; 16]).is_err());
        assert_eq!(TextCell::from_sql(&Type::XML, b"<a/>").unwrap().0, "<a/>");

        let mood = Type::new(
            "mood".into(),
            90_001,
            Kind::Enum(vec!["happy".into(), "sad".into()]),
            "public".into(),
        );
        assert_eq!(TextCell::from_sql(&mood, b"happy").unwrap().0, "happy");
        assert!(TextCell::from_sql(&mood, &[0xff]).is_err());
    }

    #[test]
    fn test_typed_null_matches_parameter_type() {
        assert!(typed_null(&Type::INT4).to_sql_checked(&Type::INT4, &mut Default::default()).is_ok());
        assert!(typed_null(&Type::JSONB).to_sql_checked(&Type::JSONB, &mut Default::default()).is_ok());
    }
}
