//! HTTP/1.x framing helpers

use crate::DecodeError;
use flowtap_core::{BodyLength, HeaderMap, StartLine};

/// Classify one start line (without its line terminator)
pub fn parse_start_line(line: &[u8]) -> Result<StartLine, DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| malformed(line))?;

    if text.starts_with("HTTP/") {
        parse_status_line(text).ok_or_else(|| malformed(line))
    } else {
        parse_request_line(text).ok_or_else(|| malformed(line))
    }
}

fn malformed(line: &[u8]) -> DecodeError {
    let shown = &line[..line.len().min(64)];
    DecodeError::MalformedStartLine(String::from_utf8_lossy(shown).into_owned())
}

fn parse_request_line(text: &str) -> Option<StartLine> {
    let mut parts = text.split(' ');
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if method.is_empty() || !method.bytes().all(is_token_byte) {
        return None;
    }
    if target.is_empty() || !is_http_version(version) {
        return None;
    }

    Some(StartLine::Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

fn parse_status_line(text: &str) -> Option<StartLine> {
    let (version, rest) = text.split_once(' ')?;
    if !is_http_version(version) {
        return None;
    }

    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(StartLine::Response {
        version: version.to_string(),
        status: code.parse().ok()?,
        reason: reason.to_string(),
    })
}

fn is_http_version(version: &str) -> bool {
    match version.strip_prefix("HTTP/").map(str::as_bytes) {
        Some([major, b'.', minor]) => major.is_ascii_digit() && minor.is_ascii_digit(),
        _ => false,
    }
}

/// RFC 9110 `tchar`
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Parse a complete header block, terminating blank line included
pub fn parse_header_block(block: &[u8], max_headers: usize) -> Result<HeaderMap, DecodeError> {
    let mut slots = vec![httparse::EMPTY_HEADER; max_headers];
    match httparse::parse_headers(block, &mut slots)? {
        httparse::Status::Complete((_, headers)) => Ok(headers
            .iter()
            .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
            .collect()),
        httparse::Status::Partial => Err(DecodeError::IncompleteHeaders),
    }
}

/// Decide how the body following these headers is delimited
pub fn body_policy(start: &StartLine, headers: &HeaderMap) -> Result<BodyLength, DecodeError> {
    if let StartLine::Response { status, .. } = start {
        if (100..200).contains(status) || *status == 204 || *status == 304 {
            return Ok(BodyLength::Empty);
        }
    }

    if is_chunked(headers) {
        return Ok(BodyLength::Chunked);
    }

    if let Some(len) = content_length(headers)? {
        return Ok(BodyLength::ContentLength(len));
    }

    Ok(match start {
        StartLine::Request { .. } => BodyLength::Empty,
        StartLine::Response { .. } => BodyLength::UntilClose,
    })
}

/// `chunked` is the final transfer coding
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// Content-Length, allowing repeated identical values
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, DecodeError> {
    let mut length = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        let parsed: u64 = value
            .parse()
            .map_err(|_| DecodeError::InvalidContentLength(value.to_string()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(DecodeError::InvalidContentLength(value.to_string()));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Parse a chunk-size line, ignoring chunk extensions
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    let bad = || DecodeError::MalformedChunk(String::from_utf8_lossy(line).into_owned());

    let text = std::str::from_utf8(line).map_err(|_| bad())?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() || size.len() > 16 {
        return Err(bad());
    }
    u64::from_str_radix(size, 16).map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line() {
        let start = parse_start_line(b"GET /x?y=1 HTTP/1.1").unwrap();
        assert_eq!(
            start,
            StartLine::Request {
                method: "GET".into(),
                target: "/x?y=1".into(),
                version: "HTTP/1.1".into(),
            }
        );
    }

    #[test]
    fn test_status_line() {
        let start = parse_start_line(b"HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(
            start,
            StartLine::Response {
                version: "HTTP/1.1".into(),
                status: 404,
                reason: "Not Found".into(),
            }
        );

        let bare = parse_start_line(b"HTTP/1.0 200").unwrap();
        assert_eq!(bare.version(), "HTTP/1.0");
    }

    #[test]
    fn test_malformed_start_lines() {
        for line in [
            &b"hello world"[..],
            b"GET /x",
            b"GET /x HTTP/2",
            b"GET  /x HTTP/1.1",
            b"G@T /x HTTP/1.1",
            b"HTTP/1.1 20 OK",
            b"HTTP/1.1 abc OK",
            b"\x16\x03\x01\x02\x00",
        ] {
            assert!(
                matches!(parse_start_line(line), Err(DecodeError::MalformedStartLine(_))),
                "{:?} should be rejected",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn test_header_block() {
        let headers =
            parse_header_block(b"Host: a\r\nX-Dup: 1\r\nx-dup: 2\r\n\r\n", 16).unwrap();
        assert_eq!(headers.get("host"), Some("a"));
        assert_eq!(headers.get_all("X-DUP").collect::<Vec<_>>(), vec!["1", "2"]);

        let empty = parse_header_block(b"\r\n", 16).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_header_block_limits() {
        assert!(matches!(
            parse_header_block(b"A: 1\r\nB: 2\r\n\r\n", 1),
            Err(DecodeError::MalformedHeaders(httparse::Error::TooManyHeaders))
        ));
        assert!(parse_header_block(b"Bad Header\r\n\r\n", 16).is_err());
    }

    fn policy(start: &[u8], headers: &[(&str, &str)]) -> Result<BodyLength, DecodeError> {
        let start = parse_start_line(start).unwrap();
        let headers: HeaderMap = headers.iter().copied().collect();
        body_policy(&start, &headers)
    }

    #[test]
    fn test_body_policy() {
        assert_eq!(policy(b"GET / HTTP/1.1", &[]).unwrap(), BodyLength::Empty);
        assert_eq!(
            policy(b"HTTP/1.1 200 OK", &[]).unwrap(),
            BodyLength::UntilClose
        );
        assert_eq!(
            policy(b"POST / HTTP/1.1", &[("Content-Length", "12")]).unwrap(),
            BodyLength::ContentLength(12)
        );
        assert_eq!(
            policy(
                b"HTTP/1.1 200 OK",
                &[("Content-Length", "12"), ("Transfer-Encoding", "gzip, chunked")]
            )
            .unwrap(),
            BodyLength::Chunked
        );
        assert_eq!(
            policy(b"HTTP/1.1 304 Not Modified", &[("Content-Length", "99")]).unwrap(),
            BodyLength::Empty
        );
        assert_eq!(
            policy(b"HTTP/1.1 101 Switching Protocols", &[]).unwrap(),
            BodyLength::Empty
        );
    }

    #[test]
    fn test_conflicting_content_length() {
        assert_eq!(
            policy(b"POST / HTTP/1.1", &[("Content-Length", "5, 5")]).unwrap(),
            BodyLength::ContentLength(5)
        );
        assert!(policy(b"POST / HTTP/1.1", &[("Content-Length", "5"), ("Content-Length", "6")]).is_err());
        assert!(policy(b"POST / HTTP/1.1", &[("Content-Length", "-1")]).is_err());
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(parse_chunk_size(b"1a").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"FF;name=value").unwrap(), 255);
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"zz").is_err());
        assert!(parse_chunk_size(b"11111111111111111").is_err());
    }
}
