//! Deciding what to answer, and rendering the answer into sendable blocks.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fmt;
use std::fs::{metadata, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::config::Config;
use crate::listing;
use crate::range::{RangeError, SendRange};
use crate::request::{Method, Request};
use crate::url::{make_safe_url, HtmlEscaped};

/// Value of the `Server:` header.
pub const SERVER_ID: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    PartialContent,
    MovedPermanently,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestEntityTooLarge,
    RangeNotSatisfiable,
    InternalServerError,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::PartialContent => 206,
            Self::MovedPermanently => 301,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RequestEntityTooLarge => 413,
            Self::RangeNotSatisfiable => 416,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::PartialContent => "Partial Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::RequestEntityTooLarge => "Request Entity Too Large",
            Self::RangeNotSatisfiable => "Requested Range Not Satisfiable",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
        }
    }
}

/// Where the bytes of a block come from.
#[derive(Debug)]
pub enum Source {
    Generated(Vec<u8>),
    File(File),
}

/// Bytes to send, and how far sending got.
#[derive(Debug)]
pub struct Block {
    pub source: Source,
    /// Offsets into `source` still to be sent.
    pub pending: SendRange,
}

impl Block {
    pub fn generated(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            source: Source::Generated(bytes),
            pending: SendRange::new(0, len),
        }
    }

    pub fn empty() -> Self {
        Self::generated(Vec::new())
    }

    pub fn file(file: File, range: SendRange) -> Self {
        Self {
            source: Source::File(file),
            pending: range,
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_done()
    }
}

/// A reply ready to go out: the header block, then the content block.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    pub header: Block,
    pub content: Block,
    /// Send the header block only (HEAD, 304).
    pub header_only: bool,
}

impl Response {
    #[cfg(test)]
    pub fn header_text(&self) -> String {
        match &self.header.source {
            Source::Generated(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Source::File(_) => panic!("header block backed by a file"),
        }
    }
}

/// How the response should describe the fate of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAlive {
    pub close: bool,
    pub timeout: Option<Duration>,
    /// Requests still allowed on the connection after this one.
    pub remaining: Option<u32>,
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.close {
            return f.write_str("Connection: close\r\n");
        }
        match (self.timeout, self.remaining) {
            (None, None) => f.write_str("Connection: keep-alive\r\n"),
            (Some(timeout), None) => write!(f, "Keep-Alive: timeout={}\r\n", timeout.as_secs()),
            (None, Some(max)) => write!(f, "Keep-Alive: max={}\r\n", max),
            (Some(timeout), Some(max)) => write!(
                f,
                "Keep-Alive: timeout={},max={}\r\n",
                timeout.as_secs(),
                max
            ),
        }
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format(HTTP_DATE_FORMAT))
    }
}

/// Parse an RFC1123 date into seconds since the epoch.
pub fn parse_http_date(date: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(date.trim(), HTTP_DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive).timestamp())
}

fn unix_secs(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp()
}

/// "Generated by" footer line, empty without server id.
struct GeneratedOn<'a>(&'a Config, SystemTime);

impl<'a> fmt::Display for GeneratedOn<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.server_id {
            writeln!(f, "Generated by {} on {}", SERVER_ID, HttpDate(self.1))?;
        }
        Ok(())
    }
}

/// Header block under construction.
struct Head(String);

impl Head {
    fn field(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.0.push_str(&format!("{}: {}\r\n", name, value));
        self
    }

    fn finish(mut self) -> Block {
        self.0.push_str("\r\n");
        Block::generated(self.0.into_bytes())
    }
}

/// Return true if file exists.
fn file_exists(path: &Path) -> bool {
    !matches!(metadata(path), Err(e) if e.kind() == io::ErrorKind::NotFound)
}

fn bytes_to_path(bytes: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(bytes))
}

/// Percent-encode control characters so a value can't end its header line early.
fn header_safe(value: &str) -> Cow<'_, str> {
    if !value.bytes().any(|b| b.is_ascii_control()) {
        return Cow::Borrowed(value);
    }
    let mut safe = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        if c.is_ascii_control() {
            safe.push_str(&format!("%{:02X}", c as u8));
        } else {
            safe.push(c);
        }
    }
    Cow::Owned(safe)
}

/// Builds responses for one request.
pub struct Responder<'a> {
    config: &'a Config,
    now: SystemTime,
    keep_alive: KeepAlive,
}

impl<'a> Responder<'a> {
    pub fn new(config: &'a Config, now: SystemTime, keep_alive: KeepAlive) -> Self {
        Self {
            config,
            now,
            keep_alive,
        }
    }

    /// Work out the response to a parsed request.
    pub fn respond(&self, request: &Request) -> Response {
        let mut response = self.dispatch(request);
        if request.is_head() {
            response.header_only = true;
        }
        response
    }

    fn dispatch(&self, request: &Request) -> Response {
        if self.config.forward.https
            && !matches!(&request.forwarded_proto, Some(proto) if proto.eq_ignore_ascii_case("https"))
        {
            return match &request.host {
                Some(host) => self.redirect(&format!("https://{}{}", host, request.url)),
                None => self.error(
                    Status::BadRequest,
                    "You must provide a Host header when using --forward-https.",
                ),
            };
        }
        if !self.config.auth.check(request.authorization.as_deref()) {
            return self.error(Status::Unauthorized, "Access denied due to invalid credentials.");
        }
        match &request.method {
            Method::Get | Method::Head => self.get(request),
            Method::Unsupported(method) => self.error(
                Status::NotImplemented,
                &format!("The method you specified ({}) is not implemented.", method),
            ),
        }
    }

    fn get(&self, request: &Request) -> Response {
        let url = match make_safe_url(&request.path) {
            Some(url) => url,
            None => return self.error(Status::BadRequest, "You requested an invalid URL."),
        };

        if let Some(forward_to) = self.config.forward.url_for(request.host.as_deref()) {
            return self.redirect(&format!("{}{}", forward_to, request.url));
        }

        let mut target = self.config.wwwroot.clone();
        target.extend_from_slice(&url);

        if url.ends_with(b"/") {
            let mut index = target.clone();
            index.extend_from_slice(self.config.index_name.as_bytes());
            if file_exists(bytes_to_path(&index)) {
                let mimetype = self.config.mime_map.content_type(self.config.index_name.as_bytes());
                return self.file(request, bytes_to_path(&index), mimetype);
            }
            if self.config.no_listing {
                // Return 404 instead of 403 to make --no-listing indistinguishable from the
                // directory not existing.
                return self.error(Status::NotFound, "The URL you requested was not found.");
            }
            return self.listing(bytes_to_path(&target), &url);
        }

        let mimetype = self.config.mime_map.content_type(&url);
        self.file(request, bytes_to_path(&target), mimetype)
    }

    fn file(&self, request: &Request, path: &Path, mimetype: &str) -> Response {
        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => file,
            Err(e) => {
                return match e.kind() {
                    io::ErrorKind::PermissionDenied => self.error(
                        Status::Forbidden,
                        "You don't have permission to access this URL.",
                    ),
                    io::ErrorKind::NotFound => {
                        self.error(Status::NotFound, "The URL you requested was not found.")
                    }
                    _ => self.error(
                        Status::InternalServerError,
                        &format!("The URL you requested cannot be returned: {}.", e),
                    ),
                }
            }
        };
        let metadata = match file.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                return self.error(Status::InternalServerError, &format!("fstat() failed: {}.", e))
            }
        };
        if metadata.is_dir() {
            return self.directory_redirect(request, path);
        }
        if !metadata.is_file() {
            return self.error(Status::Forbidden, "Not a regular file.");
        }

        let size = metadata.len() as i64;
        let modified = metadata.modified().ok();

        if let (Some(modified), Some(since)) = (
            modified,
            request.if_modified_since.as_deref().and_then(parse_http_date),
        ) {
            if unix_secs(modified) <= since {
                return self.not_modified();
            }
        }

        let range = match &request.range {
            None => None,
            Some(Err(e)) => return self.range_not_satisfiable(*e, size),
            Some(Ok(range)) => match range.satisfiable(size) {
                Ok(range) => range,
                Err(e) => return self.range_not_satisfiable(e, size),
            },
        };

        let mut head = match range {
            Some((from, to)) => self
                .head(Status::PartialContent)
                .field("Content-Length", to - from + 1)
                .field("Content-Range", format!("bytes {}-{}/{}", from, to, size)),
            None => self.head(Status::Ok).field("Content-Length", size),
        }
        .field("Content-Type", mimetype);
        if let Some(modified) = modified {
            head = head.field("Last-Modified", HttpDate(modified));
        }

        let (status, pending) = match range {
            Some((from, to)) => (Status::PartialContent, SendRange::inclusive(from, to)),
            None => (Status::Ok, SendRange::new(0, size as u64)),
        };
        Response {
            status,
            header: head.finish(),
            content: Block::file(file, pending),
            header_only: false,
        }
    }

    /// A directory was requested without its trailing slash.
    fn directory_redirect(&self, request: &Request, path: &Path) -> Response {
        let servable = !self.config.no_listing || file_exists(&path.join(&self.config.index_name));
        if !servable {
            return self.error(Status::NotFound, "The URL you requested was not found.");
        }
        let mut location = String::from_utf8_lossy(&request.raw_path).into_owned();
        location.push('/');
        if let Some(query) = &request.query {
            location.push('?');
            location.push_str(&String::from_utf8_lossy(query));
        }
        self.redirect(&location)
    }

    fn listing(&self, path: &Path, decoded_url: &[u8]) -> Response {
        let footer = GeneratedOn(self.config, self.now).to_string();
        match listing::generate(path, decoded_url, &footer) {
            Ok(html) => self.html(Status::Ok, html, &[]),
            Err(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => self.error(
                    Status::Forbidden,
                    "You don't have permission to access this URL.",
                ),
                io::ErrorKind::NotFound => {
                    self.error(Status::NotFound, "The URL you requested was not found.")
                }
                _ => self.error(
                    Status::InternalServerError,
                    &format!("Couldn't list directory: {}", e),
                ),
            },
        }
    }

    /// A default reply for any (erroneous) occasion.
    pub fn error(&self, status: Status, reason: &str) -> Response {
        if status == Status::Unauthorized && self.config.auth.is_enabled() {
            let challenge = [(
                "WWW-Authenticate",
                "Basic realm=\"User Visible Realm\"".to_string(),
            )];
            return self.error_page(status, reason, &challenge);
        }
        self.error_page(status, reason, &[])
    }

    fn error_page(&self, status: Status, reason: &str, extra: &[(&str, String)]) -> Response {
        let reply = format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status.code(),
            status.reason(),
            status.reason(),
            HtmlEscaped(reason),
            GeneratedOn(self.config, self.now),
        );
        self.html(status, reply, extra)
    }

    fn range_not_satisfiable(&self, error: RangeError, size: i64) -> Response {
        self.error_page(
            Status::RangeNotSatisfiable,
            error.reason(),
            &[("Content-Range", format!("bytes */{}", size))],
        )
    }

    /// A redirect reply.
    pub fn redirect(&self, location: &str) -> Response {
        let location = &header_safe(location);
        let reply = format!(
            "<html><head><title>301 Moved Permanently</title></head><body>\n\
            <h1>Moved Permanently</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            HtmlEscaped(location),
            HtmlEscaped(location),
            GeneratedOn(self.config, self.now),
        );
        self.html(
            Status::MovedPermanently,
            reply,
            &[("Location", location.to_string())],
        )
    }

    /// A not modified reply.
    fn not_modified(&self) -> Response {
        Response {
            status: Status::NotModified,
            header: self.head(Status::NotModified).finish(),
            content: Block::empty(),
            header_only: true,
        }
    }

    fn html(&self, status: Status, body: String, extra: &[(&str, String)]) -> Response {
        let mut head = self.head(status);
        for (name, value) in extra {
            head = head.field(name, value);
        }
        let head = head
            .field("Content-Length", body.len())
            .field("Content-Type", "text/html; charset=UTF-8");
        Response {
            status,
            header: head.finish(),
            content: Block::generated(body.into_bytes()),
            header_only: false,
        }
    }

    /// Status line and the fields every response carries.
    fn head(&self, status: Status) -> Head {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nDate: {}\r\n",
            status.code(),
            status.reason(),
            HttpDate(self.now)
        );
        if self.config.server_id {
            head.push_str(&format!("Server: {}\r\n", SERVER_ID));
        }
        head.push_str("Accept-Ranges: bytes\r\n");
        head.push_str(&self.keep_alive.to_string());
        for header in &self.config.custom_headers {
            head.push_str(header);
            head.push_str("\r\n");
        }
        Head(head)
    }
}
