//! Request parsing and response heads for the peer server.
//!
//! Only what peers send is understood: a request line of the form
//! `GET /request/<url> HTTP/1.x` followed by headers that are read and
//! ignored. `<url>` may be percent-encoded; a query string on the request
//! path itself is dropped.

use crate::cache::HeaderMap;
use std::fmt;

/// Path prefix under which cached responses are served.
pub const REQUEST_PREFIX: &str = "/request/";

/// Response status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// A parsed peer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub method: Method,
    /// Decoded URL of the cached response.
    pub url: String,
}

/// Parse a request line (without its line terminator).
pub fn parse_request_line(line: &str) -> Result<PeerRequest, Status> {
    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Status::BadRequest);
    };
    if !version.starts_with("HTTP/1.") {
        return Err(Status::BadRequest);
    }

    let method = match method {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        _ => return Err(Status::MethodNotAllowed),
    };

    let path = target.split_once('?').map_or(target, |(path, _)| path);
    let encoded = path.strip_prefix(REQUEST_PREFIX).ok_or(Status::NotFound)?;
    let url = percent_decode(encoded).ok_or(Status::BadRequest)?;
    if url.is_empty() {
        return Err(Status::BadRequest);
    }

    Ok(PeerRequest { method, url })
}

/// Decode `%XX` escapes. `None` on a malformed escape or non-UTF-8 result.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Headers of the cached response that are not replayed to peers.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Status line and headers for a response. The connection is always closed
/// after the response, so a body without a known length is delimited by EOF.
pub fn response_head(status: Status, headers: &HeaderMap, content_length: Option<u64>) -> String {
    let mut head = format!("HTTP/1.1 {}\r\n", status);
    for (name, values) in headers {
        if name.is_empty() || HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        for value in values {
            if has_line_break(name) || has_line_break(value) {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {}\r\n", len));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

fn has_line_break(s: &str) -> bool {
    s.contains(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url() {
        let req = parse_request_line("GET /request/http://example.com/page HTTP/1.1").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "http://example.com/page");
    }

    #[test]
    fn test_parse_encoded_url() {
        let req =
            parse_request_line("HEAD /request/http%3A%2F%2Fexample.com%2Fa%20b HTTP/1.0").unwrap();
        assert_eq!(req.method, Method::Head);
        assert_eq!(req.url, "http://example.com/a b");
    }

    #[test]
    fn test_parse_drops_query_of_request_path() {
        let req = parse_request_line("GET /request/http%3A%2F%2Fx%2F%3Fq%3D1?nocache=1 HTTP/1.1")
            .unwrap();
        assert_eq!(req.url, "http://x/?q=1");
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(parse_request_line(""), Err(Status::BadRequest));
        assert_eq!(parse_request_line("GET /request/x"), Err(Status::BadRequest));
        assert_eq!(parse_request_line("GET /request/x SPDY/3"), Err(Status::BadRequest));
        assert_eq!(
            parse_request_line("POST /request/x HTTP/1.1"),
            Err(Status::MethodNotAllowed)
        );
        assert_eq!(parse_request_line("GET /proxy/x HTTP/1.1"), Err(Status::NotFound));
        assert_eq!(parse_request_line("GET /request/ HTTP/1.1"), Err(Status::BadRequest));
        assert_eq!(parse_request_line("GET /request/%zz HTTP/1.1"), Err(Status::BadRequest));
        assert_eq!(parse_request_line("GET /request/%e2 HTTP/1.1"), Err(Status::BadRequest));
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%2Fb").as_deref(), Some("a/b"));
        assert_eq!(percent_decode("%E2%9C%93").as_deref(), Some("✓"));
        assert_eq!(percent_decode("100%"), None);
        assert_eq!(percent_decode("%4"), None);
    }

    #[test]
    fn test_response_head_filters_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type".into(), vec!["text/html".into()]);
        headers.insert("Content-Length".into(), vec!["999".into()]);
        headers.insert("Transfer-Encoding".into(), vec!["chunked".into()]);
        headers.insert("X-Evil".into(), vec!["a\r\nSet-Cookie: x".into()]);

        let head = response_head(Status::Ok, &headers, Some(5));

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(!head.contains("999"));
        assert!(!head.contains("chunked"));
        assert!(!head.contains("Set-Cookie"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }
}
