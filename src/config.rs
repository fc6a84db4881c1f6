//! Command line flags and the immutable server configuration built from them.

use std::net::{AddrParseError, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nix::unistd::getuid;

use crate::auth::Authorizer;
use crate::mime::{MimeMap, DEFAULT_MIME_TYPE};
use crate::poller::PollerKind;

pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A simple, single-threaded, static content webserver.
#[derive(Parser, Debug)]
#[command(name = "darkerhttpd", version)]
pub struct Cli {
    /// Directory to serve.
    pub wwwroot: PathBuf,

    /// Port to listen on. 0 lets the system choose. [default: 8080, or 80 as root]
    #[arg(long)]
    pub port: Option<u16>,

    /// Interface address to bind to. [default: all]
    #[arg(long, value_name = "IP")]
    pub addr: Option<String>,

    /// Listen on an IPv6 address.
    #[arg(long)]
    pub ipv6: bool,

    /// How many concurrent connections to accept. [default: system maximum]
    #[arg(long, value_name = "NUMBER")]
    pub maxconn: Option<usize>,

    /// Append the access log to this file. [default: stdout]
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Use syslog for the access log.
    #[arg(long, conflicts_with = "log")]
    pub syslog: bool,

    /// Lock the server into the wwwroot directory.
    #[arg(long)]
    pub chroot: bool,

    /// Detach from the controlling terminal and run in the background.
    #[arg(long)]
    pub daemon: bool,

    /// Write the pid to this file. With --chroot it must be inside the wwwroot.
    #[arg(long, value_name = "FILE")]
    pub pidfile: Option<PathBuf>,

    /// File to serve when a directory is requested.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_INDEX_NAME)]
    pub index: String,

    /// Do not serve a listing when a directory is requested.
    #[arg(long)]
    pub no_listing: bool,

    /// Parse this file for extension to MIME type associations.
    #[arg(long, value_name = "FILE")]
    pub mimetypes: Option<PathBuf>,

    /// Serve files with unknown extensions as this type.
    #[arg(long, value_name = "TYPE", default_value = DEFAULT_MIME_TYPE)]
    pub default_mimetype: String,

    /// Drop privileges to this user after initialization.
    #[arg(long, value_name = "UID")]
    pub uid: Option<String>,

    /// Drop privileges to this group after initialization.
    #[arg(long, value_name = "GID")]
    pub gid: Option<String>,

    /// Disable HTTP keep-alive.
    #[arg(long)]
    pub no_keepalive: bool,

    /// Close a keep-alive connection after this many requests.
    #[arg(long, value_name = "NUMBER", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_requests: Option<u32>,

    /// Redirect requests for HOST to URL. Hosts are matched in order of appearance.
    #[arg(long, num_args = 2, value_names = ["HOST", "URL"])]
    pub forward: Vec<String>,

    /// Redirect all requests to URL.
    #[arg(long, value_name = "URL")]
    pub forward_all: Option<String>,

    /// Redirect to https unless X-Forwarded-Proto says the request came over https.
    #[arg(long)]
    pub forward_https: bool,

    /// Don't identify the server in headers or generated pages.
    #[arg(long)]
    pub no_server_id: bool,

    /// Close connections idle for this many seconds. 0 disables the timeout.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Enable basic authentication.
    #[arg(long, value_name = "USER:PASS", value_parser = parse_user_pass)]
    pub auth: Option<String>,

    /// Add a "Name: value" header to every response.
    #[arg(long = "header", value_name = "HEADER", value_parser = parse_custom_header)]
    pub headers: Vec<String>,

    /// Readiness mechanism.
    #[arg(long, value_enum, default_value_t = PollerKind::default())]
    pub poller: PollerKind,

    /// Log diagnostics at debug level.
    #[arg(long)]
    pub debug: bool,
}

fn parse_user_pass(value: &str) -> Result<String, String> {
    if value.contains(':') {
        Ok(value.to_string())
    } else {
        Err("expected user:pass".to_string())
    }
}

fn parse_custom_header(value: &str) -> Result<String, String> {
    if value.contains('\n') || value.contains('\r') {
        Err("newlines are not allowed in headers".to_string())
    } else if !value.contains(": ") {
        Err("expected \"Name: value\"".to_string())
    } else {
        Ok(value.to_string())
    }
}

/// Where requests get redirected to instead of being served.
#[derive(Debug, Clone, Default)]
pub struct Forward {
    hosts: Vec<(String, String)>,
    all: Option<String>,
    pub https: bool,
}

impl Forward {
    pub fn add_host(&mut self, host: &str, url: &str) {
        self.hosts.push((host.to_string(), url.to_string()));
    }

    pub fn set_all(&mut self, url: &str) {
        self.all = Some(url.to_string());
    }

    /// URL to forward to based on the host header, if any.
    pub fn url_for(&self, host: Option<&str>) -> Option<&str> {
        host.and_then(|host| {
            self.hosts
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(host))
                .map(|(_, url)| url.as_str())
        })
        .or(self.all.as_deref())
    }
}

/// Everything the serving side needs to know. Fixed once the server starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Served directory without trailing slash. Empty after chroot.
    pub wwwroot: Vec<u8>,
    pub bind_addr: SocketAddr,
    pub max_connections: Option<usize>,
    pub index_name: String,
    pub no_listing: bool,
    pub mime_map: MimeMap,
    pub timeout: Option<Duration>,
    pub keep_alive: bool,
    pub max_requests: Option<u32>,
    pub server_id: bool,
    pub custom_headers: Vec<String>,
    pub auth: Authorizer,
    pub forward: Forward,
    pub poller: PollerKind,
}

impl Config {
    /// Defaults for serving `wwwroot`: all interfaces, port 8080 (80 as root).
    pub fn new(wwwroot: &Path) -> Self {
        let port = if getuid().is_root() { 80 } else { 8080 };
        Self {
            wwwroot: strip_trailing_slashes(wwwroot.as_os_str().to_owned().into_vec()),
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            max_connections: None,
            index_name: DEFAULT_INDEX_NAME.to_string(),
            no_listing: false,
            mime_map: MimeMap::default(),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            keep_alive: true,
            max_requests: None,
            server_id: true,
            custom_headers: Vec::new(),
            auth: Authorizer::disabled(),
            forward: Forward::default(),
            poller: PollerKind::default(),
        }
    }

    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.wwwroot.as_os_str().is_empty() {
            return Err(anyhow!("wwwroot must not be empty"));
        }
        let mut config = Self::new(&cli.wwwroot);

        let port = cli.port.unwrap_or_else(|| config.bind_addr.port());
        config.bind_addr = socket_addr(cli.addr.as_deref(), port, cli.ipv6)
            .context("malformed --addr argument")?;
        config.max_connections = cli.maxconn;
        config.index_name = cli.index.clone();
        config.no_listing = cli.no_listing;
        if let Some(filename) = &cli.mimetypes {
            config.mime_map.parse_extension_map_file(filename)?;
        }
        config.mime_map.set_default_mimetype(&cli.default_mimetype);
        config.timeout = match cli.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        config.keep_alive = !cli.no_keepalive;
        config.max_requests = cli.max_requests;
        config.server_id = !cli.no_server_id;
        config.custom_headers = cli.headers.clone();
        if let Some(user_pass) = &cli.auth {
            config.auth = Authorizer::from_user_pass(user_pass);
        }
        for pair in cli.forward.chunks(2) {
            if let [host, url] = pair {
                config.forward.add_host(host, url);
            }
        }
        if let Some(url) = &cli.forward_all {
            config.forward.set_all(url);
        }
        config.forward.https = cli.forward_https;
        config.poller = cli.poller;
        Ok(config)
    }
}

fn strip_trailing_slashes(mut path: Vec<u8>) -> Vec<u8> {
    while path.last() == Some(&b'/') {
        path.pop();
    }
    path
}

fn socket_addr(addr: Option<&str>, port: u16, inet6: bool) -> Result<SocketAddr, AddrParseError> {
    Ok(if inet6 {
        let addr = Ipv6Addr::from_str(addr.unwrap_or("::"))?;
        SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))
    } else {
        let addr = Ipv4Addr::from_str(addr.unwrap_or("0.0.0.0"))?;
        SocketAddr::V4(SocketAddrV4::new(addr, port))
    })
}
