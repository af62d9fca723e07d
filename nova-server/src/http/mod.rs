//! HTTP/1.1 wire handling and response helpers

pub mod codec;
pub mod response;

pub use codec::{
    read_request, request_keep_alive, response_needs_eof, set_keep_alive, write_response,
    CodecError, ParseError, ParseLimits,
};
pub use response::{error_response, internal_error, success_response};

/// A fully buffered request; bodies are UTF-8 JSON
pub type Request = http::Request<String>;

/// A fully buffered response
pub type Response = http::Response<String>;
