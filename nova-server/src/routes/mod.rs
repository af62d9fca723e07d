//! Built-in routes

pub mod health;

use std::sync::Arc;

pub use health::{HealthHandler, HEALTH_PATH};

use crate::db::ConnectionPool;
use crate::router::Router;

/// Register the routes every deployment carries
pub fn register_builtin_routes(router: &Router, pool: &ConnectionPool) {
    router.register_handler(HEALTH_PATH, Arc::new(HealthHandler::new(pool.clone())));
}
