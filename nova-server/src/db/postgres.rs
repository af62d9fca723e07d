//! PostgreSQL connector on sqlx

use std::str::FromStr;

use async_trait::async_trait;
use nova_core::DatabaseSection;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::types::{JsonValue, Uuid};
use sqlx::{Column, ConnectOptions, Connection, Row as _, TypeInfo};

use super::{Connector, DbConnection, DriverError, Row};

/// Opens single `PgConnection`s; pooling is done by [`ConnectionPool`](super::ConnectionPool)
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    /// Build options from the `[database]` section: UTF-8 client encoding
    /// and the configured `sslmode`.
    pub fn from_section(db: &DatabaseSection) -> Result<Self, DriverError> {
        let ssl_mode = PgSslMode::from_str(&db.ssl_mode)
            .map_err(|e| DriverError::Connection(format!("invalid ssl_mode: {}", e)))?;

        let options = PgConnectOptions::new()
            .host(&db.address)
            .port(db.port)
            .username(&db.username)
            .password(&db.password)
            .database(&db.db_name)
            .ssl_mode(ssl_mode)
            .options([("client_encoding", "UTF8")]);

        Ok(Self { options })
    }

    /// Build options from a `postgres://` URL
    pub fn from_url(url: &str) -> Result<Self, DriverError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| DriverError::Connection(format!("invalid database URL: {}", e)))?
            .options([("client_encoding", "UTF8")]);
        Ok(Self { options })
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        // any failure to establish the session counts as a connection error
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Box::new(PgDbConnection { conn, broken: false }))
    }

    fn describe(&self) -> String {
        format!(
            "postgres://{}:{}/{}",
            self.options.get_host(),
            self.options.get_port(),
            self.options.get_database().unwrap_or_default()
        )
    }
}

struct PgDbConnection {
    conn: PgConnection,
    broken: bool,
}

impl PgDbConnection {
    fn note(&mut self, err: sqlx::Error) -> DriverError {
        let err = DriverError::from(err);
        if err.is_connection() {
            self.broken = true;
        }
        err
    }
}

#[async_trait]
impl DbConnection for PgDbConnection {
    fn is_open(&self) -> bool {
        !self.broken
    }

    async fn ping(&mut self) -> bool {
        if self.broken {
            return false;
        }
        match self.conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Database ping failed: {}", e);
                self.broken = true;
                false
            }
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<Vec<Row>, DriverError> {
        let result = async {
            let mut tx = self.conn.begin().await?;
            let rows = sqlx::query(sql).fetch_all(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        }
        .await;

        match result {
            Ok(rows) => Ok(rows.iter().map(decode_row).collect()),
            Err(e) => Err(self.note(e)),
        }
    }
}

fn decode_row(row: &PgRow) -> Row {
    let columns = row.columns();
    let names = columns.iter().map(|c| c.name().to_string()).collect();
    let values = columns
        .iter()
        .map(|c| decode_value(row, c.ordinal(), c.type_info().name()))
        .collect();
    Row::new(names, values)
}

/// Decode by Postgres type name; unsupported types come back as `null`
fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    let value = match type_name {
        "BOOL" => get::<bool>(row, index).map(Value::from),
        "INT2" => get::<i16>(row, index).map(Value::from),
        "INT4" => get::<i32>(row, index).map(Value::from),
        "INT8" => get::<i64>(row, index).map(Value::from),
        "FLOAT4" => get::<f32>(row, index).map(|v| Value::from(f64::from(v))),
        "FLOAT8" => get::<f64>(row, index).map(Value::from),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => get::<String>(row, index).map(Value::from),
        "UUID" => get::<Uuid>(row, index).map(|v| Value::from(v.to_string())),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index).map(|v| Value::from(v.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index).map(|v| Value::from(v.to_string())),
        "DATE" => get::<NaiveDate>(row, index).map(|v| Value::from(v.to_string())),
        "JSON" | "JSONB" => get::<JsonValue>(row, index),
        other => {
            tracing::debug!(column = index, type_name = other, "Unsupported column type");
            None
        }
    };
    value.unwrap_or(Value::Null)
}
