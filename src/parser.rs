// src/parser.rs
use crate::http::{Method, Request};

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes for a complete request; read more and retry.
    Incomplete,
    /// Request line does not have the METHOD TARGET VERSION shape.
    BadRequestLine,
    /// A header line without a colon, or a non-UTF-8 header section.
    BadHeader,
    /// Content-Length present but not a non-negative decimal integer.
    BadContentLength,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete request"),
            ParseError::BadRequestLine => write!(f, "malformed request line"),
            ParseError::BadHeader => write!(f, "malformed header line"),
            ParseError::BadContentLength => write!(f, "malformed Content-Length"),
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Frame one HTTP/1.1 request out of `buf`.
///
/// A request is complete once the header section is terminated by a blank
/// line and the buffer holds `Content-Length` further body bytes (zero when
/// the header is absent). Returns the parsed request and the total number of
/// bytes it occupies, so the caller can advance its cursor and try again for
/// pipelined requests.
pub fn parse_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let header_end = find_header_end(buf).ok_or(ParseError::Incomplete)?;
    let head = std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::BadHeader)?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;

    let mut parts = request_line.splitn(3, ' ');
    let method_str = parts.next().ok_or(ParseError::BadRequestLine)?;
    let target = parts.next().ok_or(ParseError::BadRequestLine)?;
    let version = parts.next().ok_or(ParseError::BadRequestLine)?;
    if method_str.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::BadRequestLine);
    }

    let method = Method::from_bytes(method_str.as_bytes());
    let (path, query) = match target.find('?') {
        Some(idx) => (
            target[..idx].to_string(),
            Some(target[idx + 1..].to_string()),
        ),
        None => (target.to_string(), None),
    };

    let mut headers = Vec::new();
    let mut content_length: usize = 0;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line.find(':').ok_or(ParseError::BadHeader)?;
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().map_err(|_| ParseError::BadContentLength)?;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let body_start = header_end + 4;
    let total = body_start + content_length;
    if buf.len() < total {
        return Err(ParseError::Incomplete);
    }

    Ok((
        Request {
            method,
            path,
            query,
            headers,
            body: buf[body_start..total].to_vec(),
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_request() {
        let raw = b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/health");
        assert_eq!(req.query, None);
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.body.is_empty());
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_body_by_content_length() {
        let raw = b"POST /process HTTP/1.1\r\nContent-Length: 11\r\n\r\n{\"id\":42}..extra";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body, b"{\"id\":42}..");
        // The trailing "extra" belongs to the next request
        assert_eq!(consumed, raw.len() - 5);
    }

    #[test]
    fn test_parse_query_split() {
        let raw = b"GET /numbers/sum?verbose=1 HTTP/1.1\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap();
        assert_eq!(req.path, "/numbers/sum");
        assert_eq!(req.query.as_deref(), Some("verbose=1"));
    }

    #[test]
    fn test_incomplete_headers() {
        assert_eq!(
            parse_request(b"GET /health HTTP/1.1\r\nHost: local").unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[test]
    fn test_incomplete_body() {
        let raw = b"POST /process HTTP/1.1\r\nContent-Length: 50\r\n\r\nshort";
        assert_eq!(parse_request(raw).unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_bad_request_line() {
        assert_eq!(
            parse_request(b"GARBAGE\r\n\r\n").unwrap_err(),
            ParseError::BadRequestLine
        );
        assert_eq!(
            parse_request(b"GET /health\r\n\r\n").unwrap_err(),
            ParseError::BadRequestLine
        );
    }

    #[test]
    fn test_header_without_colon() {
        let raw = b"GET / HTTP/1.1\r\nNotAHeader\r\n\r\n";
        assert_eq!(parse_request(raw).unwrap_err(), ParseError::BadHeader);
    }

    #[test]
    fn test_bad_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n";
        assert_eq!(parse_request(raw).unwrap_err(), ParseError::BadContentLength);
        let raw = b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n";
        assert_eq!(parse_request(raw).unwrap_err(), ParseError::BadContentLength);
    }

    #[test]
    fn test_content_length_case_insensitive() {
        let raw = b"POST / HTTP/1.1\r\ncontent-length: 4\r\n\r\nbody";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(req.body, b"body");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_pipelined_requests_frame_in_order() {
        let raw = b"POST /process HTTP/1.1\r\nContent-Length: 3\r\n\r\none\
                    GET /health HTTP/1.1\r\n\r\n";
        let (first, consumed) = parse_request(raw).unwrap();
        assert_eq!(first.body, b"one");
        let (second, rest) = parse_request(&raw[consumed..]).unwrap();
        assert_eq!(second.path, "/health");
        assert_eq!(consumed + rest, raw.len());
    }
}
