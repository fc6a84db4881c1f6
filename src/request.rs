//! Receiving and parsing HTTP requests.

use std::fmt;

use crate::range::{ByteRange, RangeError};
use crate::url::url_decode;

// To prevent a malformed request from eating up too much memory, die once the request exceeds this
// many bytes:
pub const MAX_REQUEST_LENGTH: usize = 4000;

/// Bytes received on a connection but not yet turned into a request.
pub struct RecvBuffer {
    data: Box<[u8]>,
    filled: usize,
    // Where the next search for the end of the header block starts.
    scanned: usize,
}

/// What the bytes received so far amount to.
#[derive(Debug)]
pub enum Parsed {
    /// The header block has not ended yet.
    Incomplete,
    /// The header block did not fit into the buffer.
    TooLarge,
    Malformed(ParseError),
    Complete(Request),
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0; MAX_REQUEST_LENGTH].into_boxed_slice(),
            filled: 0,
            scanned: 0,
        }
    }

    /// Free space to receive into.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Account for `count` bytes written into `spare()`.
    pub fn commit(&mut self, count: usize) {
        assert!(self.filled + count <= self.data.len());
        self.filled += count;
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Forget everything received. Bytes past the previous request are dropped too.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.scanned = 0;
    }

    /// Try to parse the request received so far.
    pub fn parse(&mut self) -> Parsed {
        match self.header_end() {
            Some(end) => match Request::parse(&self.data[..end]) {
                Ok(request) => Parsed::Complete(request),
                Err(e) => Parsed::Malformed(e),
            },
            None if self.is_full() => Parsed::TooLarge,
            None => Parsed::Incomplete,
        }
    }

    /// Index one past the blank line that ends the header block, if it arrived.
    fn header_end(&mut self) -> Option<usize> {
        let data = &self.data[..self.filled];
        let mut i = self.scanned;
        while i < data.len() {
            if data[i] == b'\n' {
                match (data.get(i + 1), data.get(i + 2)) {
                    (Some(b'\n'), _) => return Some(i + 2),
                    (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                    // the terminator may be split across reads
                    (None, _) | (Some(b'\r'), None) => break,
                    _ => {}
                }
            }
            i += 1;
        }
        self.scanned = i;
        None
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a request could not be understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    MissingMethod,
    MissingUrl,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingMethod => f.write_str("request line has no method"),
            Self::MissingUrl => f.write_str("request line has no URL"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    /// Anything else, as sent (upper-cased).
    Unsupported(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        if token.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if token.eq_ignore_ascii_case("HEAD") {
            Self::Head
        } else {
            Self::Unsupported(token.to_ascii_uppercase())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Unsupported(method) => method,
        }
    }
}

/// What the `Connection:` header asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    Close,
    KeepAlive,
}

/// Parameters of a `Keep-Alive:` request header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveParams {
    pub timeout: Option<u64>,
    pub max: Option<u32>,
}

impl KeepAliveParams {
    fn parse(value: &str) -> Self {
        let mut params = Self::default();
        for param in value.split(',') {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => continue,
            };
            if name.eq_ignore_ascii_case("timeout") {
                params.timeout = value.parse().ok();
            } else if name.eq_ignore_ascii_case("max") {
                params.max = value.parse().ok();
            }
        }
        params
    }
}

/// Request headers the server acts on. Everything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    Host,
    Referer,
    UserAgent,
    Authorization,
    IfModifiedSince,
    Range,
    Connection,
    KeepAlive,
    XForwardedProto,
}

const HEADER_TABLE: &[(&str, Header)] = &[
    ("Host", Header::Host),
    ("Referer", Header::Referer),
    ("User-Agent", Header::UserAgent),
    ("Authorization", Header::Authorization),
    ("If-Modified-Since", Header::IfModifiedSince),
    ("Range", Header::Range),
    ("Connection", Header::Connection),
    ("Keep-Alive", Header::KeepAlive),
    ("X-Forwarded-Proto", Header::XForwardedProto),
];

impl Header {
    fn lookup(name: &str) -> Option<Self> {
        HEADER_TABLE
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|&(_, header)| header)
    }
}

/// A parsed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as sent, for logging.
    pub url: String,
    /// Target path before the `?`, still percent-encoded.
    pub raw_path: Vec<u8>,
    /// Percent-decoded target path, not yet made safe.
    pub path: Vec<u8>,
    pub query: Option<Vec<u8>>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub authorization: Option<String>,
    pub if_modified_since: Option<String>,
    /// Outcome of the last `Range:` header seen; a later header replaces an earlier one.
    pub range: Option<Result<ByteRange, RangeError>>,
    pub connection: Option<ConnectionOption>,
    pub keep_alive: KeepAliveParams,
    pub forwarded_proto: Option<String>,
}

impl Request {
    /// Parse a complete header block like "GET / HTTP/1.1\r\nHost: x\r\n\r\n".
    pub fn parse(head: &[u8]) -> Result<Self, ParseError> {
        let mut lines = head
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));
        let request_line = lines.next().unwrap_or_default();
        let mut tokens = request_line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|token| !token.is_empty());

        let method = tokens.next().ok_or(ParseError::MissingMethod)?;
        let method = Method::parse(&String::from_utf8_lossy(method));

        let target = tokens.next().ok_or(ParseError::MissingUrl)?;
        let (path, query) = match target.iter().position(|&b| b == b'?') {
            Some(mark) => (&target[..mark], Some(target[mark + 1..].to_vec())),
            None => (target, None),
        };

        let mut request = Self {
            method,
            url: String::from_utf8_lossy(target).into_owned(),
            raw_path: path.to_vec(),
            path: url_decode(path),
            query,
            protocol: tokens
                .next()
                .map(|protocol| String::from_utf8_lossy(protocol).into_owned()),
            host: None,
            referer: None,
            user_agent: None,
            authorization: None,
            if_modified_since: None,
            range: None,
            connection: None,
            keep_alive: KeepAliveParams::default(),
            forwarded_proto: None,
        };

        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = match line.iter().position(|&b| b == b':') {
                Some(colon) => colon,
                None => continue, // not a header
            };
            let name = String::from_utf8_lossy(&line[..colon]);
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            if let Some(header) = Header::lookup(name.trim()) {
                request.apply_header(header, value.trim());
            }
        }
        Ok(request)
    }

    fn apply_header(&mut self, header: Header, value: &str) {
        match header {
            Header::Host => self.host = Some(value.to_string()),
            Header::Referer => self.referer = Some(value.to_string()),
            Header::UserAgent => self.user_agent = Some(value.to_string()),
            Header::Authorization => self.authorization = Some(value.to_string()),
            Header::IfModifiedSince => self.if_modified_since = Some(value.to_string()),
            Header::Range => self.range = Some(ByteRange::parse(value)),
            Header::Connection => {
                for option in value.split(',').map(str::trim) {
                    if option.eq_ignore_ascii_case("close") {
                        self.connection = Some(ConnectionOption::Close);
                    } else if option.eq_ignore_ascii_case("keep-alive") {
                        self.connection = Some(ConnectionOption::KeepAlive);
                    }
                }
            }
            Header::KeepAlive => self.keep_alive = KeepAliveParams::parse(value),
            Header::XForwardedProto => self.forwarded_proto = Some(value.to_string()),
        }
    }

    /// Does the client want to keep the connection open after this request?
    pub fn wants_keep_alive(&self) -> bool {
        match self.connection {
            Some(ConnectionOption::Close) => false,
            Some(ConnectionOption::KeepAlive) => true,
            None => matches!(&self.protocol, Some(protocol) if protocol.eq_ignore_ascii_case("HTTP/1.1")),
        }
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn receive(buf: &mut RecvBuffer, bytes: &[u8]) {
        buf.spare()[..bytes.len()].copy_from_slice(bytes);
        buf.commit(bytes.len());
    }

    #[test]
    fn parses_full_request() {
        let request = Request::parse(
            b"get /a%20b/c?x=1?y HTTP/1.1\r\n\
            host: example.com\r\n\
            Referer: http://ref/\r\n\
            User-Agent: test agent\r\n\
            Authorization: Basic abc=\r\n\
            If-Modified-Since: Wed, 26 May 2021 14:51:23 GMT\r\n\
            Range: bytes=2-4\r\n\
            X-Unknown: whatever\r\n\
            Keep-Alive: timeout=5, max=10\r\n\
            X-Forwarded-Proto: https\r\n\
            \r\n",
        )
        .unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.url, "/a%20b/c?x=1?y");
        assert_eq!(request.raw_path, b"/a%20b/c");
        assert_eq!(request.path, b"/a b/c");
        assert_eq!(request.query.as_deref(), Some(&b"x=1?y"[..]));
        assert_eq!(request.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(request.host.as_deref(), Some("example.com"));
        assert_eq!(request.referer.as_deref(), Some("http://ref/"));
        assert_eq!(request.user_agent.as_deref(), Some("test agent"));
        assert_eq!(request.authorization.as_deref(), Some("Basic abc="));
        assert_eq!(
            request.if_modified_since.as_deref(),
            Some("Wed, 26 May 2021 14:51:23 GMT")
        );
        assert_eq!(
            request.range,
            Some(Ok(ByteRange {
                begin: Some(2),
                end: Some(4)
            }))
        );
        assert_eq!(
            request.keep_alive,
            KeepAliveParams {
                timeout: Some(5),
                max: Some(10)
            }
        );
        assert_eq!(request.forwarded_proto.as_deref(), Some("https"));
        assert!(request.wants_keep_alive());
    }

    #[test_case("GET", Method::Get ; "get")]
    #[test_case("hEaD", Method::Head ; "head")]
    #[test_case("post", Method::Unsupported("POST".to_string()) ; "post")]
    fn methods(token: &str, method: Method) {
        let request = Request::parse(format!("{} / HTTP/1.1\r\n\r\n", token).as_bytes()).unwrap();
        assert_eq!(request.method, method);
    }

    #[test_case(b"\r\n\r\n", ParseError::MissingMethod ; "empty request line")]
    #[test_case(b"GET\r\n\r\n", ParseError::MissingUrl ; "no url")]
    fn malformed(head: &[u8], error: ParseError) {
        assert_eq!(Request::parse(head).unwrap_err(), error);
    }

    #[test_case("GET / HTTP/1.1\r\n\r\n", true ; "http 1.1")]
    #[test_case("GET / HTTP/1.0\r\n\r\n", false ; "http 1.0")]
    #[test_case("GET /\r\n\r\n", false ; "no protocol")]
    #[test_case("GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false ; "close")]
    #[test_case("GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true ; "keep alive header")]
    fn keep_alive(head: &str, expected: bool) {
        assert_eq!(Request::parse(head.as_bytes()).unwrap().wants_keep_alive(), expected);
    }

    #[test]
    fn bad_range_is_kept_as_error() {
        let request = Request::parse(b"GET / HTTP/1.1\r\nRange: lines=1-2\r\n\r\n").unwrap();
        assert_eq!(request.range, Some(Err(RangeError::UnsupportedUnit)));
    }

    // Known quirk: only the last Range header counts, even when it replaces a usable one.
    #[test]
    fn second_range_header_replaces_first() {
        let request = Request::parse(
            b"GET / HTTP/1.1\r\nRange: bytes=0-1\r\nRange: bytes=5-\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            request.range,
            Some(Ok(ByteRange {
                begin: Some(5),
                end: None
            }))
        );

        let request = Request::parse(
            b"GET / HTTP/1.1\r\nRange: bytes=0-1\r\nRange: bytes=9-1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(request.range, Some(Err(RangeError::Backward)));
    }

    #[test]
    fn incremental_receive() {
        let mut buf = RecvBuffer::new();
        assert!(matches!(buf.parse(), Parsed::Incomplete));
        receive(&mut buf, b"GET /index.html HTTP/1.1\r\nHo");
        assert!(matches!(buf.parse(), Parsed::Incomplete));
        receive(&mut buf, b"st: x\r\n\r");
        assert!(matches!(buf.parse(), Parsed::Incomplete));
        receive(&mut buf, b"\n");
        match buf.parse() {
            Parsed::Complete(request) => {
                assert_eq!(request.path, b"/index.html");
                assert_eq!(request.host.as_deref(), Some("x"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bare_newlines_end_the_header() {
        let mut buf = RecvBuffer::new();
        receive(&mut buf, b"GET /\nHost: x\n\n");
        assert!(matches!(buf.parse(), Parsed::Complete(_)));
    }

    #[test]
    fn trailing_bytes_do_not_hide_the_end() {
        let mut buf = RecvBuffer::new();
        receive(&mut buf, b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n");
        match buf.parse() {
            Parsed::Complete(request) => assert_eq!(request.path, b"/"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_request_line() {
        let mut buf = RecvBuffer::new();
        receive(&mut buf, b"\r\n\r\n");
        assert!(matches!(buf.parse(), Parsed::Malformed(ParseError::MissingMethod)));
    }

    #[test]
    fn too_large() {
        let mut buf = RecvBuffer::new();
        let filler = vec![b'a'; MAX_REQUEST_LENGTH];
        receive(&mut buf, &filler);
        assert!(buf.is_full());
        assert!(matches!(buf.parse(), Parsed::TooLarge));
        buf.clear();
        assert!(!buf.is_full());
        assert_eq!(buf.spare().len(), MAX_REQUEST_LENGTH);
    }
}
