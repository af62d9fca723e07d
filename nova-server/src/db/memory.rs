//! In-process connector for tests and `--in-memory-db` development runs.
//!
//! Understands a handful of Postgres statements:
//!
//! - `SELECT <integer>`
//! - `SELECT '<literal>'`
//! - `SELECT pg_backend_pid()` (a per-connection id)
//! - `SELECT pg_sleep(<seconds>)`
//! - `SELECT pg_terminate_backend(pg_backend_pid())` (kills the connection)
//!
//! Anything else is a statement error, like a syntax error from the server.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Connector, DbConnection, DriverError, Row};

#[derive(Debug, Default)]
struct Backend {
    opened: AtomicUsize,
    next_pid: AtomicU64,
    refuse: AtomicBool,
}

/// Cloneable handle; clones share counters and knobs
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    backend: Arc<Backend>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened so far
    pub fn opened(&self) -> usize {
        self.backend.opened.load(Ordering::SeqCst)
    }

    /// Make subsequent `connect` calls fail, as if the server were down
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.backend.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        if self.backend.refuse.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("connection refused".into()));
        }
        self.backend.opened.fetch_add(1, Ordering::SeqCst);
        let pid = self.backend.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MemoryConnection { pid, open: true }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    pid: u64,
    open: bool,
}

#[async_trait]
impl DbConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn ping(&mut self) -> bool {
        self.open
    }

    async fn execute(&mut self, sql: &str) -> Result<Vec<Row>, DriverError> {
        if !self.open {
            return Err(DriverError::Connection("connection is closed".into()));
        }

        let statement = sql.trim().trim_end_matches(';').trim();
        let Some(expr) = strip_keyword(statement, "SELECT") else {
            return Err(syntax_error(statement));
        };

        if let Ok(n) = expr.parse::<i64>() {
            return Ok(vec![Row::single("?column?", n)]);
        }

        if let Some(literal) = parse_literal(expr) {
            return Ok(vec![Row::single("?column?", literal)]);
        }

        match normalize_call(expr).as_str() {
            "pg_backend_pid()" => return Ok(vec![Row::single("pg_backend_pid", self.pid)]),
            "pg_terminate_backend(pg_backend_pid())" => {
                self.open = false;
                return Err(DriverError::Connection(
                    "terminating connection due to administrator command".into(),
                ));
            }
            _ => {}
        }

        if let Some(seconds) = parse_sleep(expr) {
            tokio::time::sleep(seconds).await;
            return Ok(vec![Row::single("pg_sleep", Value::Null)]);
        }

        Err(syntax_error(expr))
    }
}

fn strip_keyword<'a>(statement: &'a str, keyword: &str) -> Option<&'a str> {
    let head = statement.get(..keyword.len())?;
    let rest = &statement[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// `'it''s'` → `it's`
fn parse_literal(expr: &str) -> Option<String> {
    let inner = expr.strip_prefix('\'')?.strip_suffix('\'')?;
    if inner.replace("''", "").contains('\'') {
        return None;
    }
    Some(inner.replace("''", "'"))
}

fn normalize_call(expr: &str) -> String {
    expr.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn parse_sleep(expr: &str) -> Option<Duration> {
    let call = normalize_call(expr);
    let seconds: f64 = call
        .strip_prefix("pg_sleep(")?
        .strip_suffix(')')?
        .parse()
        .ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

fn syntax_error(near: &str) -> DriverError {
    let token = near.split_whitespace().next().unwrap_or_default();
    DriverError::Statement(format!("syntax error at or near \"{}\"", token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connection() -> Box<dyn DbConnection> {
        MemoryConnector::new().connect().await.unwrap()
    }

    #[tokio::test]
    async fn answers_supported_selects() {
        let mut conn = connection().await;

        let rows = conn.execute("SELECT 1").await.unwrap();
        assert_eq!(rows[0].get(0), Some(&json!(1)));

        let rows = conn.execute("select 'it''s me';").await.unwrap();
        assert_eq!(rows[0].get(0), Some(&json!("it's me")));

        let rows = conn.execute("SELECT pg_backend_pid()").await.unwrap();
        assert_eq!(rows[0].get_by_name("pg_backend_pid"), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn pg_sleep_waits() {
        let mut conn = connection().await;
        let started = tokio::time::Instant::now();

        conn.execute("SELECT pg_sleep(1.5)").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn unknown_sql_is_statement_error() {
        let mut conn = connection().await;

        let err = conn.execute("INVALID SQL").await.unwrap_err();
        assert_eq!(
            err,
            DriverError::Statement("syntax error at or near \"INVALID\"".into())
        );
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn terminate_backend_closes_connection() {
        let mut conn = connection().await;

        let err = conn
            .execute("SELECT pg_terminate_backend(pg_backend_pid())")
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert!(!conn.is_open());
        assert!(!conn.ping().await);
        assert!(conn.execute("SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn refusing_connector() {
        let connector = MemoryConnector::new();
        connector.set_refuse_connections(true);
        assert!(connector.connect().await.is_err());

        connector.set_refuse_connections(false);
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.opened(), 1);
    }
}
