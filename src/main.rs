use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};

use darkerhttpd::config::{Cli, Config};
use darkerhttpd::daemon::{self, Daemonize, PidFile};
use darkerhttpd::log::{init_tracing, AccessLog, LogSink};
use darkerhttpd::server::{create_listener, Server};

const COPYRIGHT: &str = "copyright (c) 2021 Tom Dryer";

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    let config = Config::from_cli(&cli)?;
    let drop_uid = cli.uid.as_deref().map(daemon::resolve_user).transpose()?;
    let drop_gid = cli.gid.as_deref().map(daemon::resolve_group).transpose()?;

    let log_sink = if let Some(path) = &cli.log {
        LogSink::open_file(path)?
    } else if cli.syslog {
        LogSink::Syslog
    } else {
        LogSink::Stdout
    };
    let print_stats = !matches!(log_sink, LogSink::Stdout);

    let listener = create_listener(config.bind_addr)?;
    let local_addr = listener
        .local_addr()
        .context("failed to get listening address")?;
    println!("listening on: http://{}/", local_addr);

    let mut server = Server::new(config, listener, AccessLog::new(log_sink))?;

    let daemonize = cli
        .daemon
        .then(|| Daemonize::start().context("failed to daemonize"))
        .transpose()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    if cli.chroot {
        daemon::enter_chroot(&cli.wwwroot)?;
        println!("chrooted to `{}'", cli.wwwroot.display());
        server.set_wwwroot(Vec::new());
    }

    daemon::drop_privileges(drop_uid, drop_gid)?;

    let pidfile = cli.pidfile.as_deref().map(PidFile::create).transpose()?;

    daemonize
        .map(|daemonize| daemonize.finish().context("failed to daemonize"))
        .transpose()?;

    server.run(&RUNNING)?;

    pidfile.map(|pidfile| pidfile.remove()).transpose()?;

    // Usage goes to stdout, which is the access log unless a file or syslog took over.
    if print_stats {
        server.stats().print()?;
    }
    Ok(())
}
