//! Path → handler table consulted by every session

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use http::{Method, StatusCode};
use tracing::{debug, info, warn};

use crate::http::{error_response, request_keep_alive, set_keep_alive, Request, Response};

/// A request handler bound to a path.
///
/// Returning `Err` (or panicking) yields the generic 500 envelope; handlers
/// that want a specific status build the response themselves.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_request(&self, request: &Request) -> anyhow::Result<Response>;

    /// Methods this handler answers; informational only
    fn supported_methods(&self) -> Vec<Method> {
        Vec::new()
    }
}

/// Thread-safe routing table.
///
/// Lookup order: exact path, then the two-segment base path (`/api/v1`),
/// then the longest registered prefix that ends on a segment boundary.
#[derive(Default)]
pub struct Router {
    handlers: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, path: &str, handler: Arc<dyn Handler>) {
        let path = normalize_path(path);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.insert(path.clone(), handler).is_some() {
            warn!("Overwriting existing handler for path: {}", path);
        }
        info!("Registered handler for path: {}", path);
    }

    /// Returns whether a handler was removed
    pub fn remove_handler(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.remove(&path).is_some() {
            info!("Removed handler for path: {}", path);
            true
        } else {
            warn!("Attempt to remove non-existent handler for path: {}", path);
            false
        }
    }

    /// Registered paths in sorted order
    pub fn registered_paths(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.keys().cloned().collect()
    }

    pub fn find_handler(&self, request: &Request) -> Option<Arc<dyn Handler>> {
        self.find_handler_for_path(request.uri().path())
    }

    pub fn find_handler_for_path(&self, path: &str) -> Option<Arc<dyn Handler>> {
        let path = path.split('?').next().unwrap_or_default();
        let normalized = normalize_path(path);
        let base = extract_base_path(&normalized);

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = handlers.get(&normalized) {
            debug!("Found exact handler match for path: {}", normalized);
            return Some(Arc::clone(handler));
        }

        if let Some(handler) = handlers.get(&base) {
            if is_path_match(&normalized, &base) {
                debug!("Found base path handler for: {} -> {}", normalized, base);
                return Some(Arc::clone(handler));
            }
        }

        let prefix = handlers
            .iter()
            .filter(|(registered, _)| is_path_match(&normalized, registered))
            .max_by_key(|(registered, _)| registered.len());
        if let Some((registered, handler)) = prefix {
            debug!("Found prefix handler for: {} -> {}", normalized, registered);
            return Some(Arc::clone(handler));
        }

        debug!("No handler found for path: {}", normalized);
        None
    }

    /// The 404 envelope for a request no handler claimed
    pub fn handle_not_found(&self, request: &Request) -> Response {
        let target = request.uri().to_string();
        warn!("Endpoint not found: {}", target);

        let mut response = error_response(
            StatusCode::NOT_FOUND,
            "ENDPOINT_NOT_FOUND",
            &format!("Endpoint not found: {}", target),
        );
        *response.version_mut() = request.version();
        set_keep_alive(&mut response, request_keep_alive(request));
        response
    }
}

/// Leading `/`, no trailing `/` (except the root)
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// First two non-empty segments: `/api/v1/users/42` → `/api/v1`
pub fn extract_base_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).take(2).collect();
    match parts.as_slice() {
        [] => "/".to_string(),
        parts => format!("/{}", parts.join("/")),
    }
}

/// `registered` is `request` itself or a prefix ending at a `/` boundary
pub fn is_path_match(request: &str, registered: &str) -> bool {
    match request.strip_prefix(registered) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::success_response;
    use http::header::CONNECTION;
    use serde_json::json;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn handle_request(&self, _request: &Request) -> anyhow::Result<Response> {
            Ok(success_response(Some(json!(self.0)), StatusCode::OK, None))
        }
    }

    fn router() -> Router {
        let router = Router::new();
        router.register_handler("/api/v1/users", Arc::new(Named("users")));
        router.register_handler("api/v1/messages/", Arc::new(Named("messages")));
        router.register_handler("/api/v1", Arc::new(Named("v1")));
        router.register_handler("/static", Arc::new(Named("static")));
        router
    }

    async fn routed(router: &Router, path: &str) -> Option<String> {
        let handler = router.find_handler_for_path(path)?;
        let response = handler
            .handle_request(&http::Request::new(String::new()))
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        Some(body["data"].as_str().unwrap().to_string())
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("api/v1/"), "/api/v1");
        assert_eq!(normalize_path("/api/v1/users"), "/api/v1/users");
    }

    #[test]
    fn base_path_is_first_two_segments() {
        assert_eq!(extract_base_path("/"), "/");
        assert_eq!(extract_base_path("/api"), "/api");
        assert_eq!(extract_base_path("/api/v1/users/42"), "/api/v1");
    }

    #[test]
    fn path_match_respects_segment_boundary() {
        assert!(is_path_match("/api/v1/users", "/api/v1/users"));
        assert!(is_path_match("/api/v1/users/42", "/api/v1/users"));
        assert!(!is_path_match("/api/v1/usersettings", "/api/v1/users"));
        assert!(!is_path_match("/other", "/api"));
    }

    #[tokio::test]
    async fn resolves_exact_then_longest_prefix() {
        let router = router();

        assert_eq!(routed(&router, "/api/v1/users").await.as_deref(), Some("users"));
        assert_eq!(routed(&router, "/api/v1/users/").await.as_deref(), Some("users"));
        assert_eq!(routed(&router, "/api/v1/messages?limit=5").await.as_deref(), Some("messages"));
        assert_eq!(routed(&router, "/static/css/site.css").await.as_deref(), Some("static"));
        // base path wins over the longer nested prefix
        assert_eq!(routed(&router, "/api/v1/users/42").await.as_deref(), Some("v1"));
        assert_eq!(routed(&router, "/nothing/here").await, None);
    }

    #[tokio::test]
    async fn longest_prefix_wins_without_base_handler() {
        let router = router();
        router.remove_handler("/api/v1");

        assert_eq!(routed(&router, "/api/v1/users/42").await.as_deref(), Some("users"));
        assert_eq!(routed(&router, "/api/v1/messages/send").await.as_deref(), Some("messages"));
        assert_eq!(routed(&router, "/api/v1/unknown").await, None);
    }

    #[test]
    fn registration_bookkeeping() {
        let router = router();
        assert_eq!(
            router.registered_paths(),
            vec!["/api/v1", "/api/v1/messages", "/api/v1/users", "/static"]
        );

        router.register_handler("/static/", Arc::new(Named("replacement")));
        assert_eq!(router.registered_paths().len(), 4);

        assert!(router.remove_handler("/static"));
        assert!(!router.remove_handler("/static"));
        assert_eq!(router.registered_paths().len(), 3);
    }

    #[test]
    fn not_found_mirrors_keep_alive() {
        let router = Router::new();
        let request = http::Request::builder()
            .uri("/api/v2/missing?x=1")
            .version(http::Version::HTTP_10)
            .body(String::new())
            .unwrap();

        let response = router.handle_not_found(&request);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.version(), http::Version::HTTP_10);
        assert_eq!(response.headers()[CONNECTION], "close");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["code"], "ENDPOINT_NOT_FOUND");
        assert_eq!(body["message"], "Endpoint not found: /api/v2/missing?x=1");
    }
}
