//! Daemonization: fork-detach, descriptor hygiene, log and PID files, the
//! singleton lock, and the signal watcher thread.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::process::exit;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{open, Flock, FlockArg, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, fork, getpid, setpgid, setsid, ForkResult, Pid};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGPIPE, SIGTERM};
use signal_hook::iterator::Signals;

use crate::args::EXIT_OK;
use crate::logging;
use crate::server::Daemon;

pub const DAEMON_DIR: &str = "/tmp";
pub const DAEMON_LOG_PATH: &str = "/tmp/yashd.log";
pub const DAEMON_PID_PATH: &str = "/tmp/yashd.pid";

/// Detach from the terminal and become the single daemon instance. On
/// return stderr is the log file and the PID file is exclusively locked;
/// the returned guard must live as long as the process.
pub fn daemonize() -> Result<Flock<File>> {
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => exit(EXIT_OK),
        ForkResult::Child => {}
    }

    // Drop every inherited descriptor above stderr.
    let max = unsafe { libc::getdtablesize() };
    for fd in 3..max {
        unsafe {
            libc::close(fd);
        }
    }

    // stdin/stdout to /dev/null, stderr to the log file.
    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty()).context("open /dev/null")?;
    dup2(devnull, libc::STDIN_FILENO).context("dup2 stdin")?;
    dup2(devnull, libc::STDOUT_FILENO).context("dup2 stdout")?;
    let _ = nix::unistd::close(devnull);

    let log = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(DAEMON_LOG_PATH)
        .with_context(|| format!("open {DAEMON_LOG_PATH}"))?;
    dup2(log.as_raw_fd(), libc::STDERR_FILENO).context("dup2 stderr")?;
    drop(log);

    chdir(DAEMON_DIR).with_context(|| format!("chdir {DAEMON_DIR}"))?;
    umask(Mode::empty());

    // Become session leader in a fresh process group; the fork above
    // guarantees we are not one already.
    setsid().context("setsid")?;
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

    // The daemon must never be stopped by its children's terminal traffic.
    unsafe {
        let _ = signal(Signal::SIGTTOU, SigHandler::SigIgn);
        let _ = signal(Signal::SIGTTIN, SigHandler::SigIgn);
        let _ = signal(Signal::SIGTSTP, SigHandler::SigIgn);
    }

    // Singleton: hold an exclusive advisory lock on the PID file for life.
    let pid_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o644)
        .open(DAEMON_PID_PATH)
        .with_context(|| format!("open {DAEMON_PID_PATH}"))?;
    let lock = match Flock::lock(pid_file, FlockArg::LockExclusiveNonblock) {
        Ok(l) => l,
        Err((_, errno)) => {
            logging::error(
                "could not lock PID file: another daemon instance is already running",
            );
            return Err(anyhow!("PID file lock held by another instance: {errno}"));
        }
    };
    lock.set_len(0).context("truncate PID file")?;
    (&*lock)
        .write_all(format!("{}\n", getpid()).as_bytes())
        .context("write PID file")?;

    Ok(lock)
}

/// Watcher thread: turns asynchronous signals into ordinary control flow,
/// keeping handler bodies out of the picture entirely.
pub fn spawn_signal_watcher(daemon: Arc<Daemon>) -> Result<()> {
    let mut signals =
        Signals::new([SIGCHLD, SIGPIPE, SIGTERM, SIGINT]).context("install signal watcher")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGCHLD => {
                        // Fallback reap only: while any session owns a live
                        // job, its supervisor does the waiting.
                        if daemon.live_jobs.load(Ordering::Acquire) == 0 {
                            reap_orphans(&daemon);
                        }
                    }
                    SIGPIPE => logging::warn("broken pipe signal, continuing"),
                    SIGTERM | SIGINT => {
                        logging::warn("termination signal received, shutting down");
                        daemon.terminating.store(true, Ordering::Release);
                        daemon.registry.shutdown_all();
                        logging::warn("all servants joined, exiting");
                        exit(EXIT_OK);
                    }
                    _ => {}
                }
            }
        })
        .context("spawn signal watcher thread")?;
    Ok(())
}

fn reap_orphans(daemon: &Daemon) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, ..)) => {
                logging::info(daemon.args.verbose, &format!("reaped orphan child {pid}"));
            }
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                logging::warn(&format!("orphan reap failed: {e}"));
                break;
            }
        }
    }
}
