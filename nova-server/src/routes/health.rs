//! Health check route

use std::time::Instant;

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde_json::json;

use crate::db::ConnectionPool;
use crate::http::{error_response, success_response, Request, Response};
use crate::router::Handler;

pub const HEALTH_PATH: &str = "/api/v1/health";

/// GET /api/v1/health - version, uptime and pool status
pub struct HealthHandler {
    pool: ConnectionPool,
    started: Instant,
}

impl HealthHandler {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Handler for HealthHandler {
    async fn handle_request(&self, request: &Request) -> anyhow::Result<Response> {
        if request.method() != Method::GET {
            return Ok(error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "METHOD_NOT_ALLOWED",
                "Method not allowed",
            ));
        }

        if !self.pool.health_check().await {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                "Database is unavailable",
            ));
        }

        let data = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": self.started.elapsed().as_secs(),
            "database": self.pool.status(),
        });
        Ok(success_response(Some(data), StatusCode::OK, Some("Service is healthy")))
    }

    fn supported_methods(&self) -> Vec<Method> {
        vec![Method::GET]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryConnector, PoolConfig};
    use std::sync::Arc;

    async fn handler() -> (HealthHandler, MemoryConnector) {
        let connector = MemoryConnector::new();
        let pool = ConnectionPool::new(
            Arc::new(connector.clone()),
            PoolConfig {
                max_connections: 1,
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();
        (HealthHandler::new(pool), connector)
    }

    fn request(method: Method) -> Request {
        http::Request::builder()
            .method(method)
            .uri(HEALTH_PATH)
            .body(String::new())
            .unwrap()
    }

    fn body(response: &Response) -> serde_json::Value {
        serde_json::from_str(response.body()).unwrap()
    }

    #[tokio::test]
    async fn reports_healthy() {
        let (handler, _) = handler().await;
        let response = handler.handle_request(&request(Method::GET)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body(&response);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["data"]["database"]["max_connections"], 1);
    }

    #[tokio::test]
    async fn database_failure_is_503() {
        let (handler, connector) = handler().await;
        connector.set_refuse_connections(true);
        handler
            .pool
            .execute_query("SELECT pg_terminate_backend(pg_backend_pid())")
            .await
            .unwrap_err();

        let response = handler.handle_request(&request(Method::GET)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(&response)["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn other_methods_are_405() {
        let (handler, _) = handler().await;
        let response = handler.handle_request(&request(Method::POST)).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(handler.supported_methods(), vec![Method::GET]);
    }
}
