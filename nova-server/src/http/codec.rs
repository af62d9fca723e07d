//! HTTP/1.1 message framing over any async byte stream.
//!
//! The session reads exactly one request per call and writes one response.
//! Bytes that arrive after a complete request stay in the caller's buffer,
//! so pipelined requests are not lost between keep-alive iterations.

use std::io;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Request, Response};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Size limits applied while reading a request
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Request line plus headers, including the blank line
    pub max_head_size: usize,
    pub max_header_count: usize,
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_head_size: 8 * 1024,
            max_header_count: 100,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Malformed or unacceptable request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid header")]
    InvalidHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("headers too large")]
    HeadersTooLarge,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("request body is not valid UTF-8")]
    InvalidBody,
}

/// Failure while reading a request from the wire
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("connection closed in the middle of a request")]
    UnexpectedEof,
}

/// Read one request.
///
/// Returns `Ok(None)` when the peer closes the stream cleanly before sending
/// any byte of a new request (end of a keep-alive connection).
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    limits: &ParseLimits,
) -> Result<Option<Request>, CodecError>
where
    S: AsyncRead + Unpin,
{
    let mut scanned = 0;
    let head_len = loop {
        if let Some(end) = find_head_end(buf, scanned) {
            break end;
        }
        // a terminator may straddle the next read
        scanned = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        if buf.len() > limits.max_head_size {
            return Err(ParseError::HeadersTooLarge.into());
        }
        if stream.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(CodecError::UnexpectedEof);
        }
    };

    if head_len > limits.max_head_size {
        return Err(ParseError::HeadersTooLarge.into());
    }

    let head = buf.split_to(head_len);
    let (head, body_len) = parse_head(&head[..head_len - HEAD_TERMINATOR.len()], limits)?;

    while buf.len() < body_len {
        if stream.read_buf(buf).await? == 0 {
            return Err(CodecError::UnexpectedEof);
        }
    }

    let body = buf.split_to(body_len);
    let body = String::from_utf8(body.to_vec()).map_err(|_| ParseError::InvalidBody)?;

    Ok(Some(head.map(|()| body)))
}

/// Offset just past `\r\n\r\n`, searching from `from`
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| from + pos + HEAD_TERMINATOR.len())
}

/// Parse the request line and headers; returns the head and the body length
fn parse_head(
    head: &[u8],
    limits: &ParseLimits,
) -> Result<(http::Request<()>, usize), ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::InvalidHeader)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None)
            if !method.is_empty() && !target.is_empty() =>
        {
            (method, target, version)
        }
        _ => return Err(ParseError::InvalidRequestLine),
    };

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
    let uri: Uri = target.parse().map_err(|_| ParseError::InvalidRequestLine)?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(ParseError::UnsupportedVersion),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        if headers.len() >= limits.max_header_count {
            return Err(ParseError::TooManyHeaders);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        // RFC 9112: no whitespace between field name and colon
        if name.is_empty() || name.ends_with([' ', '\t']) {
            return Err(ParseError::InvalidHeader);
        }
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ParseError::InvalidHeader)?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| ParseError::InvalidHeader)?;
        headers.append(name, value);
    }

    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    let mut body_len: Option<usize> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let len = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match body_len {
            Some(existing) if existing != len => return Err(ParseError::InvalidContentLength),
            _ => body_len = Some(len),
        }
    }
    let body_len = body_len.unwrap_or(0);
    if body_len > limits.max_body_size {
        return Err(ParseError::BodyTooLarge);
    }

    let mut request = http::Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;

    Ok((request, body_len))
}

/// Serialize a response into its wire form
pub fn encode_response(response: &Response) -> Vec<u8> {
    let body = response.body().as_bytes();
    let mut out = Vec::with_capacity(256 + body.len());

    let version = if response.version() == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };
    let status = response.status();
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version,
            status.as_str(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );

    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !response.headers().contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Write one response and flush it; returns the number of bytes written
pub async fn write_response<S>(stream: &mut S, response: &Response) -> io::Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let bytes = encode_response(response);
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(bytes.len())
}

/// Connection persistence for a message with the given version and headers.
///
/// - `Connection: close` always closes
/// - `Connection: keep-alive` always persists
/// - otherwise HTTP/1.1 persists and HTTP/1.0 closes
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;

    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "close" => close = true,
                "keep-alive" => keep_alive = true,
                _ => {}
            }
        }
    }

    if close {
        return false;
    }
    keep_alive || version == Version::HTTP_11
}

/// Whether the client asked to keep the connection open
pub fn request_keep_alive(request: &Request) -> bool {
    is_keep_alive(request.version(), request.headers())
}

/// Whether the connection must be closed once `response` is written
pub fn response_needs_eof(response: &Response) -> bool {
    !is_keep_alive(response.version(), response.headers())
}

/// Set the `Connection` header to reflect the keep-alive decision
pub fn set_keep_alive(response: &mut Response, keep_alive: bool) {
    let value = if keep_alive { "keep-alive" } else { "close" };
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static(value));
}
