//! Readiness multiplexing over socket descriptors.
//!
//! The server states, once per loop iteration, what every descriptor is waiting for. Backends
//! turn that into whatever their system call needs and report back which descriptors are ready.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use tracing::trace;

/// What a descriptor is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Readiness reported by one wait.
#[derive(Debug, Default)]
pub struct Events {
    ready: HashMap<RawFd, Interest>,
}

impl Events {
    fn mark(&mut self, fd: RawFd, interest: Interest) {
        self.ready.insert(fd, interest);
    }

    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.ready.contains_key(&fd)
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

/// A readiness backend.
pub trait Poller {
    /// Set what `fd` is waiting for. Replaces any earlier interest.
    fn set_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`. Must be called before the descriptor is closed.
    fn deregister(&mut self, fd: RawFd);

    /// Block until a watched descriptor is ready or `timeout` passes. `None` waits forever.
    ///
    /// A signal interrupting the wait yields an `Interrupted` error.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Events>;
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PollerKind {
    Epoll,
    Select,
}

impl Default for PollerKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Epoll
        } else {
            Self::Select
        }
    }
}

impl PollerKind {
    pub fn create(self) -> io::Result<Box<dyn Poller>> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Epoll => Ok(Box::new(EpollPoller::new()?)),
            #[cfg(not(target_os = "linux"))]
            Self::Epoll => Err(io::Error::new(
                io::ErrorKind::Other,
                "epoll is only available on Linux",
            )),
            Self::Select => Ok(Box::new(SelectPoller::default())),
        }
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}

/// Portable backend built on `select()`.
#[derive(Debug, Default)]
pub struct SelectPoller {
    interests: HashMap<RawFd, Interest>,
}

impl Poller for SelectPoller {
    fn set_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {} does not fit in an fd_set", fd),
            ));
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Events> {
        let mut recv_set = FdSet::new();
        let mut send_set = FdSet::new();
        for (&fd, &interest) in &self.interests {
            match interest {
                Interest::Read => recv_set.insert(fd),
                Interest::Write => send_set.insert(fd),
            }
        }
        let mut timeout = timeout.map(|timeout| {
            TimeVal::from(libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            })
        });
        let count = select(
            None,
            Some(&mut recv_set),
            Some(&mut send_set),
            None,
            timeout.as_mut(),
        )
        .map_err(nix_to_io)?;

        let mut events = Events::default();
        if count > 0 {
            for (&fd, &interest) in &self.interests {
                let ready = match interest {
                    Interest::Read => recv_set.contains(fd),
                    Interest::Write => send_set.contains(fd),
                };
                if ready {
                    events.mark(fd, interest);
                }
            }
        }
        trace!(count, "select returned");
        Ok(events)
    }
}

#[cfg(target_os = "linux")]
pub use self::epoll::EpollPoller;

#[cfg(target_os = "linux")]
mod epoll {
    use std::collections::HashMap;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    use libc::{
        epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLL_CLOEXEC, EPOLL_CTL_ADD,
        EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };
    use tracing::{trace, warn};

    use super::{Events, Interest, Poller};

    const MAX_EVENTS: usize = 256;

    /// Linux backend. Registrations persist in the kernel, so only changes are passed down.
    pub struct EpollPoller {
        epoll: RawFd,
        interests: HashMap<RawFd, Interest>,
        events: Vec<epoll_event>,
    }

    impl EpollPoller {
        pub fn new() -> io::Result<Self> {
            Ok(Self {
                epoll: epoll_create1()?,
                interests: HashMap::new(),
                events: Vec::with_capacity(MAX_EVENTS),
            })
        }
    }

    fn flags(interest: Interest) -> u32 {
        match interest {
            Interest::Read => EPOLLIN as u32,
            Interest::Write => EPOLLOUT as u32,
        }
    }

    /// Safe wrapper for `libc::epoll_create1`.
    fn epoll_create1() -> io::Result<RawFd> {
        let epoll = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epoll == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(epoll)
    }

    /// Safe wrapper for `libc::epoll_ctl`.
    fn epoll_ctl(epoll: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll, op, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl Poller for EpollPoller {
        fn set_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
            match self.interests.get(&fd) {
                Some(&current) if current == interest => return Ok(()),
                Some(_) => epoll_ctl(self.epoll, EPOLL_CTL_MOD, fd, flags(interest))?,
                None => epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, flags(interest))?,
            }
            self.interests.insert(fd, interest);
            Ok(())
        }

        fn deregister(&mut self, fd: RawFd) {
            if self.interests.remove(&fd).is_some() {
                if let Err(e) = epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, 0) {
                    warn!(fd, "failed to remove descriptor from epoll: {}", e);
                }
            }
        }

        fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Events> {
            let timeout_ms = match timeout {
                // round up so a pending deadline is not polled in a busy loop
                Some(timeout) => timeout
                    .as_millis()
                    .saturating_add(u128::from(timeout.subsec_nanos() % 1_000_000 != 0))
                    .min(libc::c_int::MAX as u128) as libc::c_int,
                None => -1,
            };
            self.events.clear();
            let count = unsafe {
                libc::epoll_wait(
                    self.epoll,
                    self.events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_ms,
                )
            };
            if count == -1 {
                return Err(io::Error::last_os_error());
            }
            unsafe { self.events.set_len(count as usize) };

            let mut events = Events::default();
            for event in &self.events {
                let fd = event.u64 as RawFd;
                let interest = match self.interests.get(&fd) {
                    Some(&interest) => interest,
                    None => continue,
                };
                let wanted = flags(interest) | (EPOLLERR | EPOLLHUP) as u32;
                if event.events & wanted != 0 {
                    events.mark(fd, interest);
                }
            }
            trace!(count, "epoll_wait returned");
            Ok(events)
        }
    }

    impl Drop for EpollPoller {
        fn drop(&mut self) {
            unsafe { libc::close(self.epoll) };
        }
    }
}
