//! JSON response envelopes
//!
//! Every response the engine builds itself (404, 500, health) goes through
//! these helpers so clients always see the same envelope and CORS headers.

use http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, SERVER,
};
use http::StatusCode;
use serde_json::{json, Map, Value};

use super::Response;

pub const SERVER_NAME: &str = "Nova Chat Server";

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

/// `{"status":"success","message"?:..,"data"?:..}`
pub fn success_response(data: Option<Value>, status: StatusCode, message: Option<&str>) -> Response {
    let mut body = Map::new();
    body.insert("status".into(), Value::from("success"));
    if let Some(message) = message {
        body.insert("message".into(), Value::from(message));
    }
    if let Some(data) = data {
        body.insert("data".into(), data);
    }
    json_response(status, &Value::Object(body))
}

/// `{"status":"error","code":..,"message":..}`
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    json_response(
        status,
        &json!({
            "status": "error",
            "code": code,
            "message": message,
        }),
    )
}

/// Generic 500 for failures that escaped a handler
pub fn internal_error() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

/// Serialize `body` with the JSON and CORS headers attached
pub fn json_response(status: StatusCode, body: &Value) -> Response {
    let mut response = http::Response::new(body.to_string());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    add_cors_headers(&mut response);
    response
}

pub fn add_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
}
