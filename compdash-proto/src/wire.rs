//! Minimal HTTP/1.1 framing spoken between the agent and the collector.
//!
//! Deliberately a subset: one request per connection, `Connection: close`,
//! no chunked transfer, no keep-alive, ASCII headers terminated by CRLF CRLF.
//! The peer is always the other half of this same codec, so nothing beyond
//! the subset is ever parsed. Request and response bodies may be binary and
//! are never decoded as text.

/// Largest body a peer may declare via `Content-Length`. Anything above this
/// is treated as if no length was sent at all.
pub const MAX_DECLARED_BODY: u64 = 100 * 1024 * 1024;

/// `Content-Length` is only searched within this prefix of the raw bytes.
/// Headers on this protocol fit comfortably; a binary body that happens to
/// contain header-like byte runs must never be scanned.
const HEADER_SCAN_WINDOW: usize = 4096;

const CONTENT_LENGTH: &[u8] = b"content-length:";

/// The method and path of a parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
}

/// Serialize a request. `Content-Length` is always included so the agent can
/// distinguish an empty update trigger from a truncated upload.
pub fn build_request(
    method: &str,
    path: &str,
    body: &[u8],
    content_type: Option<&str>,
) -> Vec<u8> {
    let mut head = format!("{method} {path} HTTP/1.1\r\nConnection: close\r\n");
    if let Some(ct) = content_type {
        head.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Serialize a response with the fixed header set the agents have always
/// emitted.
pub fn build_response(status: u16, body: &[u8], content_type: &str) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        content_type,
        body.len(),
    );

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

/// Parse the numeric status out of a response line like `"HTTP/1.1 200 OK"`.
pub fn parse_status_code(raw: &[u8]) -> Option<u16> {
    let line_end = find(raw, b"\r\n").unwrap_or(raw.len());
    let line = std::str::from_utf8(&raw[..line_end]).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Parse `"GET /status HTTP/1.1"` out of the first line. Reads only up to the
/// first CRLF; everything after it is untouched.
pub fn parse_request_line(raw: &[u8]) -> Option<RequestLine> {
    let line_end = find(raw, b"\r\n").unwrap_or(raw.len());
    let line = std::str::from_utf8(&raw[..line_end]).ok()?;

    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;

    Some(RequestLine {
        method: method.to_string(),
        path: path.to_string(),
    })
}

/// Find a declared `Content-Length` in the header block.
///
/// Only the first 4 KiB are scanned, and never past the end of the headers.
/// Returns `None` for missing, negative, unparseable, or oversized
/// (> [`MAX_DECLARED_BODY`]) values.
pub fn parse_content_length(raw: &[u8]) -> Option<u64> {
    parse_declared_length(raw).filter(|&length| length <= MAX_DECLARED_BODY)
}

/// [`parse_content_length`] without the framing cap, for handlers that
/// answer an oversized declaration with a protocol error instead of
/// ignoring it.
pub fn parse_declared_length(raw: &[u8]) -> Option<u64> {
    let window = &raw[..raw.len().min(HEADER_SCAN_WINDOW)];
    let header_end = find(window, b"\r\n\r\n").unwrap_or(window.len());
    let headers = &window[..header_end];

    for line in headers.split(|&b| b == b'\n') {
        let line = strip_cr(line);
        if line.len() < CONTENT_LENGTH.len() {
            continue;
        }
        let (name, value) = line.split_at(CONTENT_LENGTH.len());
        if !name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }

        let value = std::str::from_utf8(value).ok()?.trim();
        // u64 parsing rejects a leading minus sign outright.
        return value.parse().ok();
    }

    None
}

/// The bytes after the first CRLF CRLF, or `None` if the header block never
/// terminated.
pub fn extract_body(raw: &[u8]) -> Option<&[u8]> {
    let idx = find(raw, b"\r\n\r\n")?;
    Some(&raw[idx + 4..])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}
