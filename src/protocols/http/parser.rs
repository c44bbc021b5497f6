//! HTTP/1.1 request head parser.
//!
//! Validates a complete request head (request line, field lines and the
//! terminating empty line). The parser never touches the bytes it is given;
//! the framer keeps them verbatim for the echo.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Errors found while parsing or framing a request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("bad request method")]
    BadRequestMethod,
    #[error("bad request target")]
    BadRequestTarget,
    #[error("wrong protocol")]
    WrongProtocol,
    #[error("bad protocol version")]
    BadProtocolVersion,
    #[error("expected linefeed")]
    ExpectedLinefeed,
    #[error("bad field name")]
    BadFieldName,
    #[error("bad field value")]
    BadFieldValue,
    #[error("bad content length")]
    BadContentLength,
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("request body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge { length: u64, limit: u64 },
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: Version,
}

/// One field line. Names keep their original casing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    /// Value with surrounding whitespace removed and obs-folds joined by a
    /// single space.
    pub value: Bytes,
}

/// A validated request head. Fields are kept in arrival order, duplicates
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHead {
    pub request_line: RequestLine,
    pub fields: Vec<HeaderField>,
}

impl ParsedHead {
    /// All fields whose name matches `name`, ignoring ASCII case.
    pub fn fields_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderField> + 'a {
        self.fields
            .iter()
            .filter(move |field| field.name.eq_ignore_ascii_case(name))
    }

    /// Body length announced by `Content-Length`, 0 when absent.
    ///
    /// Repeated fields must carry the same value.
    pub fn content_length(&self) -> Result<u64, ParseError> {
        let mut length = None;
        for field in self.fields_named("Content-Length") {
            let value = parse_decimal::<u64>(&field.value).ok_or(ParseError::BadContentLength)?;
            match length {
                Some(previous) if previous != value => return Err(ParseError::BadContentLength),
                _ => length = Some(value),
            }
        }
        Ok(length.unwrap_or(0))
    }
}

/// Parse a request head.
///
/// `head` runs from the first byte of the request line through the empty
/// line that ends the field block.
pub fn parse_head(head: &[u8]) -> Result<ParsedHead, ParseError> {
    let mut lines = Lines { rest: head };

    let request_line = match lines.next_line()? {
        Some(line) => parse_request_line(line)?,
        None => return Err(ParseError::BadRequestMethod),
    };

    let mut fields = Vec::new();
    let mut current: Option<(String, Vec<u8>)> = None;

    while let Some(line) = lines.next_line()? {
        if matches!(line[0], b' ' | b'\t') {
            // obs-fold: continuation of the previous field value
            let (_, value) = current.as_mut().ok_or(ParseError::BadFieldName)?;
            let folded = trim_ows(line);
            if !folded.iter().copied().all(is_field_char) {
                return Err(ParseError::BadFieldValue);
            }
            if !folded.is_empty() {
                if !value.is_empty() {
                    value.push(b' ');
                }
                value.extend_from_slice(folded);
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            fields.push(HeaderField {
                name,
                value: Bytes::from(value),
            });
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::BadFieldName)?;
        let name = &line[..colon];
        if !is_token(name) {
            return Err(ParseError::BadFieldName);
        }
        let value = trim_ows(&line[colon + 1..]);
        if !value.iter().copied().all(is_field_char) {
            return Err(ParseError::BadFieldValue);
        }
        current = Some((ascii_string(name), value.to_vec()));
    }

    if let Some((name, value)) = current {
        fields.push(HeaderField {
            name,
            value: Bytes::from(value),
        });
    }

    Ok(ParsedHead {
        request_line,
        fields,
    })
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let method = parts
        .next()
        .filter(|method| is_token(method))
        .ok_or(ParseError::BadRequestMethod)?;

    let target = parts
        .next()
        .filter(|target| !target.is_empty() && target.iter().all(|b| b.is_ascii_graphic()))
        .ok_or(ParseError::BadRequestTarget)?;

    let version = parts
        .next()
        .and_then(|protocol| protocol.strip_prefix(b"HTTP/"))
        .ok_or(ParseError::WrongProtocol)?;
    let dot = version
        .iter()
        .position(|&b| b == b'.')
        .ok_or(ParseError::BadProtocolVersion)?;
    let major = parse_decimal::<u32>(&version[..dot]).ok_or(ParseError::BadProtocolVersion)?;
    let minor = parse_decimal::<u32>(&version[dot + 1..]).ok_or(ParseError::BadProtocolVersion)?;

    Ok(RequestLine {
        method: ascii_string(method),
        target: ascii_string(target),
        version: Version { major, minor },
    })
}

/// CRLF-delimited lines of a head, stopping at the first empty line.
struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Lines<'a> {
    /// Next non-empty line, or `None` once the empty line is reached.
    fn next_line(&mut self) -> Result<Option<&'a [u8]>, ParseError> {
        let cr = find_cr(self.rest).ok_or(ParseError::ExpectedLinefeed)?;
        if self.rest.get(cr + 1) != Some(&b'\n') {
            return Err(ParseError::ExpectedLinefeed);
        }
        let line = &self.rest[..cr];
        self.rest = &self.rest[cr + 2..];
        Ok((!line.is_empty()).then_some(line))
    }
}

fn find_cr(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\r')
}

/// Parse a non-empty run of ASCII digits.
pub(crate) fn parse_decimal<T: std::str::FromStr>(digits: &[u8]) -> Option<T> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn is_token(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.iter().copied().all(is_tchar)
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

fn is_field_char(b: u8) -> bool {
    b == b' ' || b == b'\t' || b.is_ascii_graphic() || b >= 0x80
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn ascii_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_head() {
        let head = parse_head(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(head.request_line.method, "POST");
        assert_eq!(head.request_line.target, "/x");
        assert_eq!(head.request_line.version, Version { major: 1, minor: 1 });
        assert_eq!(head.fields.len(), 1);
        assert_eq!(head.fields[0].name, "Content-Length");
        assert_eq!(&head.fields[0].value[..], b"5");
        assert_eq!(head.content_length(), Ok(5));
    }

    #[test]
    fn test_fields_keep_order_and_duplicates() {
        let head = parse_head(b"GET / HTTP/1.1\r\nX-B: 1\r\nx-a: 2\r\nX-B: 3\r\n\r\n").unwrap();
        let names: Vec<&str> = head.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["X-B", "x-a", "X-B"]);

        let values: Vec<&[u8]> = head.fields_named("x-b").map(|f| &f.value[..]).collect();
        assert_eq!(values, [&b"1"[..], &b"3"[..]]);
    }

    #[test]
    fn test_content_length_absent_is_zero() {
        let head = parse_head(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Ok(0));
    }

    #[test]
    fn test_content_length_case_insensitive() {
        let head = parse_head(b"PUT / HTTP/1.1\r\ncOnTeNt-LeNgTh: 12\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Ok(12));
    }

    #[test]
    fn test_content_length_conflicts() {
        let head =
            parse_head(b"PUT / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Err(ParseError::BadContentLength));

        let head =
            parse_head(b"PUT / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\n").unwrap();
        assert_eq!(head.content_length(), Ok(2));
    }

    #[test]
    fn test_content_length_not_numeric() {
        for value in ["abc", "-1", "+5", "1 2", ""] {
            let raw = format!("PUT / HTTP/1.1\r\nContent-Length: {value}\r\n\r\n");
            let head = parse_head(raw.as_bytes()).unwrap();
            assert_eq!(head.content_length(), Err(ParseError::BadContentLength), "{value:?}");
        }
    }

    #[test]
    fn test_value_whitespace_trimmed() {
        let head = parse_head(b"GET / HTTP/1.1\r\nHost: \t example \t\r\nEmpty:\r\n\r\n").unwrap();
        assert_eq!(&head.fields[0].value[..], b"example");
        assert_eq!(&head.fields[1].value[..], b"");
    }

    #[test]
    fn test_obs_fold_joined() {
        let head = parse_head(b"GET / HTTP/1.1\r\nX-Long: first\r\n  second\r\n\tthird\r\n\r\n").unwrap();
        assert_eq!(head.fields.len(), 1);
        assert_eq!(&head.fields[0].value[..], b"first second third");
    }

    #[test]
    fn test_obs_fold_without_field() {
        let err = parse_head(b"GET / HTTP/1.1\r\n continued\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::BadFieldName);
    }

    #[test]
    fn test_bad_method() {
        assert_eq!(parse_head(b"G(T / HTTP/1.1\r\n\r\n"), Err(ParseError::BadRequestMethod));
        assert_eq!(parse_head(b" / HTTP/1.1\r\n\r\n"), Err(ParseError::BadRequestMethod));
        assert_eq!(parse_head(b"\r\n\r\n"), Err(ParseError::BadRequestMethod));
    }

    #[test]
    fn test_bad_target() {
        assert_eq!(parse_head(b"GET  HTTP/1.1\r\n\r\n"), Err(ParseError::BadRequestTarget));
        assert_eq!(parse_head(b"GET\r\n\r\n"), Err(ParseError::BadRequestTarget));
    }

    #[test]
    fn test_wrong_protocol() {
        assert_eq!(parse_head(b"GET / HTTQ/1.1\r\n\r\n"), Err(ParseError::WrongProtocol));
        assert_eq!(parse_head(b"GET /\r\n\r\n"), Err(ParseError::WrongProtocol));
    }

    #[test]
    fn test_bad_version() {
        for line in ["GET / HTTP/1\r\n\r\n", "GET / HTTP/x.1\r\n\r\n", "GET / HTTP/1.\r\n\r\n"] {
            assert_eq!(parse_head(line.as_bytes()), Err(ParseError::BadProtocolVersion), "{line:?}");
        }
        let head = parse_head(b"GET / HTTP/2.0\r\n\r\n").unwrap();
        assert_eq!(head.request_line.version.to_string(), "HTTP/2.0");
    }

    #[test]
    fn test_expected_linefeed() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\rX\n\r\n"), Err(ParseError::ExpectedLinefeed));
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nHost: a"), Err(ParseError::ExpectedLinefeed));
    }

    #[test]
    fn test_bad_field_name() {
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nNo colon\r\n\r\n"), Err(ParseError::BadFieldName));
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\n: empty\r\n\r\n"), Err(ParseError::BadFieldName));
        assert_eq!(parse_head(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n"), Err(ParseError::BadFieldName));
    }

    #[test]
    fn test_bad_field_value() {
        assert_eq!(
            parse_head(b"GET / HTTP/1.1\r\nX: a\x00b\r\n\r\n"),
            Err(ParseError::BadFieldValue)
        );
        let head = parse_head("GET / HTTP/1.1\r\nX: caf\u{e9}\r\n\r\n".as_bytes()).unwrap();
        assert_eq!(&head.fields[0].value[..], "caf\u{e9}".as_bytes());
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal::<u64>(b"604"), Some(604));
        assert_eq!(parse_decimal::<u32>(b"99999999999"), None);
        assert_eq!(parse_decimal::<u64>(b""), None);
    }
}
