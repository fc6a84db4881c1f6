//! Access log in Common Log Format, and diagnostic logging setup.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::connection::Connection;

/// Send diagnostics to stderr, at `warn` unless `RUST_LOG` or `--debug` say otherwise.
pub fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Where access log lines go.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Append to `path`, creating it if needed.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self::File(BufWriter::new(file)))
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout();
                writeln!(stdout, "{}", line)?;
                stdout.flush()?;
            }
            Self::Syslog => {
                // LogEncoded leaves no NUL bytes in a line
                let message = CString::new(line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                writeln!(file, "{}", line)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Percent-encode quotes, control and non-ASCII characters so a log line stays one line.
struct LogEncoded<'a>(&'a str);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(SystemTime);

impl fmt::Display for ClfDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// One log line per answered request.
#[derive(Debug, Default)]
pub struct AccessLog {
    sink: LogSink,
}

impl AccessLog {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }

    /// Add a finished request's details to the log.
    pub fn record(&mut self, conn: &Connection, now: SystemTime) {
        if let Some(line) = format_record(conn, now) {
            if let Err(e) = self.sink.write_line(&line) {
                warn!("failed to write access log: {}", e);
            }
        }
    }
}

/// The log line for a connection, or None if no response was produced.
fn format_record(conn: &Connection, now: SystemTime) -> Option<String> {
    let status = conn.status()?;
    let request_line = match conn.request() {
        Some(request) => format!(
            "{} {} {}",
            LogEncoded(request.method.as_str()),
            LogEncoded(&request.url),
            LogEncoded(request.protocol.as_deref().unwrap_or("-")),
        ),
        // didn't parse - maybe too long
        None => "-".to_string(),
    };
    let (referer, user_agent) = conn.request().map_or(("", ""), |request| {
        (
            request.referer.as_deref().unwrap_or(""),
            request.user_agent.as_deref().unwrap_or(""),
        )
    });
    Some(format!(
        "{} - - {} \"{}\" {} {} \"{}\" \"{}\"",
        conn.client(),
        ClfDate(now),
        request_line,
        status.code(),
        conn.total_sent(),
        LogEncoded(referer),
        LogEncoded(user_agent),
    ))
}
