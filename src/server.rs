//! The listening socket, the connection set, and the event loop tying them together.

use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::log::AccessLog;
use crate::poller::{Interest, Poller};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    pub fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!("Requests: {}", self.num_requests);
        println!("Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

/// Initialize the TcpListener. This is the socket that we accept connections from.
pub fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    // Sets `SO_REUSEADDR` implicitly.
    let listener = TcpListener::bind(addr)
        .with_context(|| format!("failed to create listening socket for {}", addr))?;
    listener
        .set_nonblocking(true)
        .context("failed to make listening socket non-blocking")?;
    Ok(listener)
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    poller: Box<dyn Poller>,
    connections: Vec<Connection>,
    /// Ran out of descriptors; stop accepting until a connection closes.
    files_exhausted: bool,
    stats: ServerStats,
    access_log: AccessLog,
}

impl Server {
    pub fn new(config: Config, listener: TcpListener, access_log: AccessLog) -> Result<Self> {
        let poller = config
            .poller
            .create()
            .with_context(|| format!("failed to set up {:?} poller", config.poller))?;
        Ok(Self {
            config,
            listener,
            poller,
            connections: Vec::new(),
            files_exhausted: false,
            stats: ServerStats::default(),
            access_log,
        })
    }

    /// Serve the root of the file tree under a different path, eg. after chroot.
    pub fn set_wwwroot(&mut self, wwwroot: Vec<u8>) {
        self.config.wwwroot = wwwroot;
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Serve until `running` goes false, then close every connection.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            self.poll()?;
        }
        self.shutdown();
        Ok(())
    }

    /// Close all connections, logging any that finished a request.
    pub fn shutdown(&mut self) {
        let now = SystemTime::now();
        for conn in std::mem::take(&mut self.connections) {
            if conn.state() == ConnectionState::Done {
                self.access_log.record(&conn, now);
            }
            self.poller.deregister(conn.fd());
        }
    }

    /// One iteration of the event loop: wait for readiness, then accept connections and move
    /// ready connections along.
    pub fn poll(&mut self) -> Result<()> {
        let listen_fd = self.listener.as_raw_fd();
        let reached_max_connections =
            matches!(self.config.max_connections, Some(max) if self.connections.len() >= max);
        if self.files_exhausted || reached_max_connections {
            self.poller.deregister(listen_fd);
        } else {
            self.poller
                .set_interest(listen_fd, Interest::Read)
                .context("failed to watch listening socket")?;
        }

        let mut wait = None;
        let now = SystemTime::now();
        for conn in &mut self.connections {
            let fd = conn.fd();
            match conn.interest() {
                Some(interest) => {
                    if let Err(e) = self.poller.set_interest(fd, interest) {
                        warn!(fd, "cannot watch connection: {}", e);
                        conn.abort();
                    }
                }
                None => self.poller.deregister(fd),
            }
            if let Some(deadline) = conn.deadline() {
                let left = deadline.duration_since(now).unwrap_or_default();
                wait = Some(wait.map_or(left, |wait: Duration| wait.min(left)));
            }
        }
        // aborted connections are cleaned up without waiting
        if self.connections.iter().any(|conn| conn.state() == ConnectionState::Done) {
            wait = Some(Duration::from_secs(0));
        }

        let events = match self.poller.wait(wait) {
            Ok(events) => events,
            // interrupted by signal
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("waiting for readiness failed"),
        };

        if events.is_empty() {
            trace!(?wait, "nothing ready");
        }

        // update time
        let now = SystemTime::now();

        if events.is_ready(listen_fd) {
            self.accept_connection(now);
        }

        let mut index = 0;
        while index < self.connections.len() {
            let conn = &mut self.connections[index];

            if conn.state() != ConnectionState::Done && !conn.poll_check_timeout(now) {
                if events.is_ready(conn.fd()) {
                    conn.poll(&self.config, now, &mut self.stats);
                }
            }

            // Handling the last step could have set the state to done.
            if conn.state() == ConnectionState::Done {
                // clean out finished connection
                self.access_log.record(conn, now);
                if conn.must_close() {
                    self.poller.deregister(conn.fd());
                    let conn = self.connections.remove(index);
                    debug!(client = %conn.client(), "connection closed");
                    // Try to resume accepting if we ran out of sockets.
                    self.files_exhausted = false;
                    continue;
                }
                conn.recycle();
                // and go right back to recv_request without waiting for readiness.
                conn.poll_recv_request(&self.config, now, &mut self.stats);
                if conn.state() == ConnectionState::Done {
                    // finished again already; handle it on this index once more
                    continue;
                }
            }
            index += 1;
        }
        Ok(())
    }

    /// Accept a connection and add it to the connection set.
    fn accept_connection(&mut self, now: SystemTime) {
        let (stream, addr) = match self.listener.accept() {
            Ok((stream, addr)) => (stream, addr),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    self.files_exhausted = true;
                }
                warn!("accept() failed: {}", e);
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(client = %addr.ip(), "failed to make connection non-blocking: {}", e);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %addr.ip(), "failed to set TCP_NODELAY: {}", e);
        }
        debug!(client = %addr, "accepted connection");

        let mut conn = Connection::new(now, stream, addr.ip(), self.config.timeout);
        // Try to read straight away rather than waiting for readiness.
        conn.poll_recv_request(&self.config, now, &mut self.stats);
        self.connections.push(conn);
    }

    #[cfg(test)]
    fn num_connections(&self) -> usize {
        self.connections.len()
    }
}
