//! Process setup around the server: detaching, pid files, chroot and privilege dropping.

use std::fs::{remove_file, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    chdir, chroot, close, dup2, fork, getpid, pipe, read, setgid, setgroups, setsid, setuid,
    ForkResult, Gid, Group, Pid, Uid, User,
};
use tracing::warn;

const PATH_DEVNULL: &str = "/dev/null";
const PIDFILE_MODE: u32 = 0o600;

/// A pid file owned by this process, removed on shutdown.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Create the pid file, failing if it already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PIDFILE_MODE)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    match Self::read(path) {
                        Ok(pid) => anyhow!("daemon already running with pid {}", pid),
                        Err(e) => e,
                    }
                } else {
                    anyhow::Error::new(e)
                        .context(format!("failed to create pidfile {}", path.display()))
                }
            })?;

        if let Err(e) = write!(file, "{}", getpid()) {
            Self::remove_raw(path, file).ok();
            return Err(e)
                .with_context(|| format!("failed to write to pidfile {}", path.display()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn read(path: &Path) -> Result<Pid> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open pidfile {}", path.display()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("failed to read pidfile {}", path.display()))?;
        Ok(Pid::from_raw(
            buf.trim().parse().context("invalid pidfile contents")?,
        ))
    }

    pub fn remove(self) -> Result<()> {
        Self::remove_raw(&self.path, self.file)
    }

    fn remove_raw(path: &Path, file: File) -> Result<()> {
        remove_file(path).with_context(|| format!("failed to remove pidfile {}", path.display()))?;
        drop(file);
        Ok(())
    }
}

/// Detach in two steps. The parent waits on a pipe (the lifeline) until the child has finished
/// initializing, so startup errors still reach the terminal and the exit status.
pub struct Daemonize {
    lifeline_read: RawFd,
    lifeline_write: RawFd,
    fd_null: RawFd,
}

impl Daemonize {
    /// Fork. Only the child returns; the parent exits once the lifeline is cut.
    pub fn start() -> Result<Self> {
        let (lifeline_read, lifeline_write) = pipe().context("failed to create pipe")?;

        let fd_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open(PATH_DEVNULL)
            .with_context(|| format!("failed to open {}", PATH_DEVNULL))?
            .into_raw_fd();

        if let ForkResult::Parent { child } = unsafe { fork() }.context("failed to fork process")? {
            if let Err(e) = close(lifeline_write) {
                warn!("failed to close lifeline in parent: {}", e);
            }
            // blocks until the child closes its end or dies
            let mut buf = [0; 1];
            if let Err(e) = read(lifeline_read, &mut buf) {
                warn!("failed to read lifeline in parent: {}", e);
            }
            match waitpid(child, Some(WaitPidFlag::WNOHANG))
                .with_context(|| format!("failed to wait for process {}", child))?
            {
                WaitStatus::StillAlive => std::process::exit(0),
                WaitStatus::Exited(_, status) => std::process::exit(status),
                _ => return Err(anyhow!("waitpid returned unknown status")),
            }
        }
        Ok(Self {
            lifeline_read,
            lifeline_write,
            fd_null,
        })
    }

    /// Start a new session, release the parent and point the standard descriptors at /dev/null.
    pub fn finish(self) -> Result<()> {
        setsid().context("failed to create session")?;
        if let Err(e) = close(self.lifeline_read) {
            warn!("failed to close read end of lifeline in child: {}", e);
        }
        if let Err(e) = close(self.lifeline_write) {
            warn!("failed to cut the lifeline: {}", e);
        }

        for (fd, name) in [
            (libc::STDIN_FILENO, "stdin"),
            (libc::STDOUT_FILENO, "stdout"),
            (libc::STDERR_FILENO, "stderr"),
        ] {
            if let Err(e) = dup2(self.fd_null, fd) {
                warn!("failed to close {}: {}", name, e);
            }
        }
        if self.fd_null > libc::STDERR_FILENO {
            close(self.fd_null).ok();
        }
        Ok(())
    }
}

/// Look up a user by name, then by number.
pub fn resolve_user(user: &str) -> Result<Uid> {
    let by_name = User::from_name(user).context("getpwnam failed")?;
    let by_uid = match user.parse() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid)).context("getpwuid failed")?,
        Err(_) => None,
    };
    by_name
        .or(by_uid)
        .map(|user| user.uid)
        .with_context(|| format!("no such uid: `{}'", user))
}

/// Look up a group by name, then by number.
pub fn resolve_group(group: &str) -> Result<Gid> {
    let by_name = Group::from_name(group).context("getgrnam failed")?;
    let by_gid = match group.parse() {
        Ok(gid) => Group::from_gid(Gid::from_raw(gid)).context("getgrgid failed")?,
        Err(_) => None,
    };
    by_name
        .or(by_gid)
        .map(|group| group.gid)
        .with_context(|| format!("no such gid: `{}'", group))
}

/// Make `root` the filesystem root and working directory.
pub fn enter_chroot(root: &Path) -> Result<()> {
    // Force reading the local timezone before chroot makes this impossible.
    Local::now();

    chdir(root).with_context(|| format!("failed to change working directory to {}", root.display()))?;
    chroot(root).with_context(|| format!("failed to change root directory to {}", root.display()))?;
    Ok(())
}

/// Switch to `gid` then `uid`. The group goes first, while we still may.
pub fn drop_privileges(uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
    if let Some(gid) = gid {
        setgroups(&[gid])
            .with_context(|| format!("failed to set supplementary group IDs to [{}]", gid))?;
        setgid(gid).with_context(|| format!("failed to set group ID to {}", gid))?;
        println!("set gid to {}", gid);
    }
    if let Some(uid) = uid {
        setuid(uid).with_context(|| format!("failed to set user ID to {}", uid))?;
        println!("set uid to {}", uid);
    }
    Ok(())
}
