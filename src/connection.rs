//! Per-client connection state machine.
//!
//! A connection moves through `ReceiveRequest -> SendHeader -> SendReply -> Done`. Every step is
//! non-blocking: when the socket would block, control goes back to the event loop, which resumes
//! the connection on the next readiness event. When a step completes, the next one is attempted
//! right away instead of waiting for another loop iteration.

use std::cmp::min;
use std::net::{IpAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, SystemTime};

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::poller::Interest;
use crate::request::{Parsed, RecvBuffer, Request};
use crate::response::{Block, KeepAlive, Responder, Response, Source, Status};
use crate::server::ServerStats;

// Limit size per sendfile call.
const SENDFILE_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReceiveRequest,
    SendHeader,
    SendReply,
    Done,
}

/// Which block of the response to transmit.
#[derive(Debug, Clone, Copy)]
enum Part {
    Header,
    Content,
}

pub struct Connection {
    socket: TcpStream,
    client: IpAddr,
    last_active: SystemTime,
    state: ConnectionState,
    recv: RecvBuffer,
    request: Option<Request>,
    response: Option<Response>,
    /// Close once the current response is out.
    conn_close: bool,
    /// The peer stopped sending. Only the idle timeout reclaims the connection then.
    stalled: bool,
    requests_served: u32,
    /// Idle timeout, possibly shortened by the client's `Keep-Alive:` header.
    timeout: Option<Duration>,
    total_sent: u64,
    #[cfg(test)]
    trail: Vec<ConnectionState>,
}

impl Connection {
    /// Wrap a freshly accepted, non-blocking socket.
    pub fn new(now: SystemTime, socket: TcpStream, client: IpAddr, timeout: Option<Duration>) -> Self {
        Self {
            socket,
            client,
            last_active: now,
            state: ConnectionState::ReceiveRequest,
            recv: RecvBuffer::new(),
            request: None,
            response: None,
            conn_close: false,
            stalled: false,
            requests_served: 0,
            timeout,
            total_sent: 0,
            #[cfg(test)]
            trail: vec![ConnectionState::ReceiveRequest],
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn client(&self) -> IpAddr {
        self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn status(&self) -> Option<Status> {
        self.response.as_ref().map(|response| response.status)
    }

    /// Header and content bytes sent for the current request.
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Should the connection be torn down instead of recycled once done?
    pub fn must_close(&self) -> bool {
        self.conn_close
    }

    /// What the connection waits for, if anything.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnectionState::ReceiveRequest if self.stalled => None,
            ConnectionState::ReceiveRequest => Some(Interest::Read),
            ConnectionState::SendHeader | ConnectionState::SendReply => Some(Interest::Write),
            ConnectionState::Done => None,
        }
    }

    /// When the connection times out if nothing happens.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.timeout
            .and_then(|timeout| self.last_active.checked_add(timeout))
    }

    fn advance(&mut self, state: ConnectionState) {
        trace!(client = %self.client, fd = self.fd(), from = ?self.state, to = ?state, "state change");
        self.state = state;
        #[cfg(test)]
        self.trail.push(state);
    }

    /// Give up on the connection.
    pub fn abort(&mut self) {
        self.conn_close = true;
        self.advance(ConnectionState::Done);
    }

    /// Make progress after a readiness event.
    pub fn poll(&mut self, config: &Config, now: SystemTime, stats: &mut ServerStats) {
        match self.state {
            ConnectionState::ReceiveRequest => self.poll_recv_request(config, now, stats),
            ConnectionState::SendHeader => self.poll_send_header(now, stats),
            ConnectionState::SendReply => self.poll_send_reply(now, stats),
            ConnectionState::Done => {}
        }
    }

    /// Recycle a finished connection for HTTP/1.1 Keep-Alive.
    pub fn recycle(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Done);
        // Bytes after the previous request are dropped: no pipelining.
        self.recv.clear();
        self.request = None;
        self.response = None;
        self.conn_close = false;
        self.total_sent = 0;
        self.advance(ConnectionState::ReceiveRequest); // ready for another
    }

    /// Time out the connection if it has been idle too long. Returns true if it did.
    pub fn poll_check_timeout(&mut self, now: SystemTime) -> bool {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        let idle = now.duration_since(self.last_active).unwrap_or_default();
        if idle < timeout {
            return false;
        }
        debug!(client = %self.client, ?idle, "connection timed out");
        self.abort();
        true
    }

    /// Receiving request.
    pub fn poll_recv_request(&mut self, config: &Config, now: SystemTime, stats: &mut ServerStats) {
        debug_assert_eq!(self.state, ConnectionState::ReceiveRequest);
        let fd = self.fd();
        let received = match socket::recv(fd, self.recv.spare(), MsgFlags::empty()) {
            Ok(0) => {
                // Not treated as closure; the idle timeout reclaims the connection.
                trace!(client = %self.client, "zero-byte read");
                self.stalled = true;
                return;
            }
            Ok(received) => received,
            Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => return,
            Err(e) => {
                debug!(client = %self.client, "recv failed: {}", e);
                self.abort();
                return;
            }
        };
        self.last_active = now;
        self.recv.commit(received);
        stats.total_in += received as u64;

        match self.recv.parse() {
            Parsed::Incomplete => return,
            Parsed::TooLarge => {
                stats.num_requests += 1;
                self.reject(
                    config,
                    now,
                    Status::RequestEntityTooLarge,
                    "Your request was dropped because it was too long.",
                );
            }
            Parsed::Malformed(e) => {
                debug!(client = %self.client, "malformed request: {}", e);
                stats.num_requests += 1;
                self.reject(
                    config,
                    now,
                    Status::BadRequest,
                    "You sent a request that the server couldn't understand.",
                );
            }
            Parsed::Complete(request) => {
                stats.num_requests += 1;
                self.process_request(config, now, request);
            }
        }

        // if we've moved on to the next state, try to send right away, instead of going through
        // another iteration of the event loop.
        self.advance(ConnectionState::SendHeader);
        self.poll_send_header(now, stats);
    }

    /// Answer with an error page and close.
    fn reject(&mut self, config: &Config, now: SystemTime, status: Status, reason: &str) {
        self.conn_close = true;
        let keep_alive = KeepAlive {
            close: true,
            ..KeepAlive::default()
        };
        self.response = Some(Responder::new(config, now, keep_alive).error(status, reason));
    }

    /// Settle keep-alive for this request and build the response.
    fn process_request(&mut self, config: &Config, now: SystemTime, request: Request) {
        self.requests_served += 1;

        // The client may only shorten the server's limits. Without a server timeout there is
        // nothing to shorten.
        if let (Some(timeout), Some(secs)) = (
            self.timeout,
            request.keep_alive.timeout.filter(|&secs| secs > 0),
        ) {
            self.timeout = Some(min(timeout, Duration::from_secs(secs)));
        }
        let limit = match (config.max_requests, request.keep_alive.max) {
            (Some(server), Some(client)) => Some(min(server, client)),
            (server, client) => server.or(client),
        };
        let remaining = limit.map(|limit| limit.saturating_sub(self.requests_served));

        self.conn_close =
            !config.keep_alive || !request.wants_keep_alive() || remaining == Some(0);
        let keep_alive = KeepAlive {
            close: self.conn_close,
            timeout: self.timeout,
            remaining,
        };
        let response = Responder::new(config, now, keep_alive).respond(&request);
        debug!(
            client = %self.client,
            url = %request.url,
            status = response.status.code(),
            "request processed"
        );
        self.response = Some(response);
        self.request = Some(request);
    }

    /// Sending header.
    pub fn poll_send_header(&mut self, now: SystemTime, stats: &mut ServerStats) {
        debug_assert_eq!(self.state, ConnectionState::SendHeader);
        if self.transmit(Part::Header, now, stats) != Some(true) {
            return;
        }
        let body_pending = self
            .response
            .as_ref()
            .map_or(false, |response| !response.header_only && !response.content.is_done());
        if body_pending {
            self.advance(ConnectionState::SendReply);
            // go straight on to body, don't go through another iteration of the event loop
            self.poll_send_reply(now, stats);
        } else {
            self.advance(ConnectionState::Done);
        }
    }

    /// Sending reply.
    pub fn poll_send_reply(&mut self, now: SystemTime, stats: &mut ServerStats) {
        debug_assert_eq!(self.state, ConnectionState::SendReply);
        if self.transmit(Part::Content, now, stats) == Some(true) {
            self.advance(ConnectionState::Done);
        }
    }

    /// Send as much of one block as the socket takes.
    ///
    /// Returns whether the block is complete, or None when the socket would block or the
    /// connection was aborted.
    fn transmit(&mut self, part: Part, now: SystemTime, stats: &mut ServerStats) -> Option<bool> {
        let fd = self.fd();
        let result = match self.response.as_mut() {
            Some(response) => {
                let block = match part {
                    Part::Header => &mut response.header,
                    Part::Content => &mut response.content,
                };
                send_block(fd, block).map(|sent| (sent, block.is_done()))
            }
            None => {
                warn!(client = %self.client, "no response to send");
                Err(nix::Error::Sys(Errno::EINVAL))
            }
        };
        match result {
            Ok((0, _)) => {
                // closure
                debug!(client = %self.client, "peer stopped accepting data");
                self.abort();
                None
            }
            Ok((sent, done)) => {
                self.last_active = now;
                self.total_sent += sent as u64;
                stats.total_out += sent as u64;
                Some(done)
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => None,
            Err(e) => {
                debug!(client = %self.client, ?part, "send failed: {}", e);
                self.abort();
                None
            }
        }
    }

    #[cfg(test)]
    pub fn trail(&self) -> &[ConnectionState] {
        &self.trail
    }
}

/// Send the pending part of `block` and account for what went out.
fn send_block(fd: RawFd, block: &mut Block) -> nix::Result<usize> {
    let pending = block.pending;
    let sent = match &block.source {
        Source::Generated(bytes) => {
            match bytes.get(pending.begin as usize..pending.end as usize) {
                Some(chunk) => socket::send(fd, chunk, MsgFlags::empty())?,
                // bookkeeping out of step with the buffer
                None => return Err(nix::Error::Sys(Errno::EINVAL)),
            }
        }
        Source::File(file) => {
            let count = min(pending.remaining(), SENDFILE_SIZE_LIMIT as u64) as usize;
            sendfile(fd, file.as_raw_fd(), pending.begin, count)?
        }
    };
    block.pending.advance(sent as u64);
    Ok(sent)
}

/// Safe wrapper for `libc::sendfile64`.
#[cfg(target_os = "linux")]
fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: usize) -> nix::Result<usize> {
    let mut offset = offset as libc::off64_t;
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, &mut offset, count) };
    Errno::result(ret).map(|sent| sent as usize)
}

/// Positional read and send, for systems without a usable `sendfile`.
#[cfg(not(target_os = "linux"))]
fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: u64, count: usize) -> nix::Result<usize> {
    let mut buf = vec![0; min(count, 1 << 16)];
    let read = nix::sys::uio::pread(in_fd, &mut buf, offset as libc::off_t)?;
    if read == 0 {
        return Ok(0);
    }
    socket::send(out_fd, &buf[..read], MsgFlags::empty())
}
