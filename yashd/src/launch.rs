//! Job launcher: forks the one or two children of a job into their own
//! process group, wires stdio onto the client socket (or the pipe), applies
//! path redirections and image-replaces with the command.
//!
//! The parent is multithreaded, so everything a child touches after fork is
//! prepared up front: argv and paths as `CString`s, diagnostics as byte
//! buffers. Post-fork code is limited to async-signal-safe calls.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::process::exit;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{killpg, signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{dup2, execvp, fork, pipe, setpgid, ForkResult, Pid};

use crate::args::EXIT_ERR_CMD;
use crate::jobs::{CmdSpec, JobStatus};
use crate::protocol::write_all_fd;
use crate::session::Session;
use crate::supervise;

/// Everything one child needs, fully materialized before fork.
struct ChildPlan {
    file: CString,
    argv: Vec<CString>,
    /// (path, pre-rendered open-failure diagnostic) per redirected stream.
    stdin: Option<(CString, Vec<u8>)>,
    stdout: Option<(CString, Vec<u8>)>,
    stderr: Option<(CString, Vec<u8>)>,
    exec_err: Vec<u8>,
}

impl ChildPlan {
    fn build(spec: &CmdSpec) -> Result<Self> {
        let file = CString::new(spec.argv[0].as_str())
            .map_err(|_| anyhow!("command contains a NUL byte"))?;
        let argv = spec
            .argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| anyhow!("argument contains a NUL byte"))?;
        let redir = |path: &Option<String>| -> Result<Option<(CString, Vec<u8>)>> {
            match path {
                None => Ok(None),
                Some(p) => {
                    let c = CString::new(p.as_str())
                        .map_err(|_| anyhow!("redirection path contains a NUL byte"))?;
                    let diag = format!("-yash: could not open file: {p}\n").into_bytes();
                    Ok(Some((c, diag)))
                }
            }
        };
        Ok(ChildPlan {
            file,
            argv,
            stdin: redir(&spec.stdin)?,
            stdout: redir(&spec.stdout)?,
            stderr: redir(&spec.stderr)?,
            exec_err: format!("-yash: {}: command not found\n", spec.argv[0]).into_bytes(),
        })
    }
}

/// Fate of a redirection stream inside the child, before path redirections.
struct ChildIo {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
}

/// Entry point of a job thread. Forks and supervises one job, then emits
/// the prompt that hands the session back to the client.
pub fn run_job(sess: &Arc<Session>, jobno: usize) {
    // Counted before the fork so the SIGCHLD fallback reaper stands down
    // even for a child that exits immediately.
    sess.daemon.live_jobs.fetch_add(1, Ordering::AcqRel);
    match spawn_children(sess, jobno) {
        Ok(background) => {
            if background {
                sess.send_prompt();
            } else {
                supervise::foreground(sess, jobno);
            }
        }
        Err(e) => {
            sess.daemon.live_jobs.fetch_sub(1, Ordering::AcqRel);
            sess.warn(&format!("job [{jobno}] failed to launch: {e}"));
            {
                let mut state = sess.state.lock().unwrap();
                state.jobs.remove(jobno);
            }
            sess.send_error(&format!("{e}"));
            sess.send_prompt();
        }
    }
}

/// Fork the job's children and record the group PID. Returns the job's
/// background flag.
fn spawn_children(sess: &Arc<Session>, jobno: usize) -> Result<bool> {
    let (left, right, background) = {
        let state = sess.state.lock().unwrap();
        let job = state
            .jobs
            .get(jobno)
            .ok_or_else(|| anyhow!("job vanished before launch"))?;
        (
            ChildPlan::build(&job.left)?,
            job.right.as_ref().map(ChildPlan::build).transpose()?,
            job.background,
        )
    };

    let pipe_fds: Option<(OwnedFd, OwnedFd)> = if right.is_some() {
        Some(pipe().map_err(|_| anyhow!("failed to make pipe"))?)
    } else {
        None
    };

    let sock = sess.sock_fd();
    let stdin_fd = sess.stdin_fd();

    let left_io = ChildIo {
        stdin: stdin_fd,
        stdout: pipe_fds
            .as_ref()
            .map(|(_, w)| w.as_raw_fd())
            .unwrap_or(sock),
        stderr: sock,
    };
    let gpid = fork_child(&left, Pid::from_raw(0), left_io)
        .map_err(|e| anyhow!("fork failed: {e}"))?;

    if let Some(right_plan) = &right {
        let right_io = ChildIo {
            stdin: pipe_fds.as_ref().map(|(r, _)| r.as_raw_fd()).unwrap(),
            stdout: sock,
            stderr: sock,
        };
        if let Err(e) = fork_child(right_plan, gpid, right_io) {
            // The left child is already running; take the group down and
            // collect it so no zombie lingers.
            let _ = killpg(gpid, Signal::SIGKILL);
            while nix::sys::wait::waitpid(Pid::from_raw(-gpid.as_raw()), None).is_ok() {}
            return Err(anyhow!("fork failed: {e}"));
        }
    }
    // Both pipe ends close here so EOF can propagate between the children.
    drop(pipe_fds);

    let cmd_str = {
        let mut state = sess.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(jobno)
            .ok_or_else(|| anyhow!("job vanished during launch"))?;
        job.gpid = Some(gpid);
        job.status = JobStatus::Running;
        job.cmd_str.clone()
    };
    sess.info(&format!("job [{jobno}] started, group {gpid}: {cmd_str}"));
    Ok(background)
}

/// Fork one child into the group `pgid` (0 means: lead a fresh group).
/// The parent returns the child's PID; the child never returns.
fn fork_child(plan: &ChildPlan, pgid: Pid, io: ChildIo) -> nix::Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            // Mirror the child's setpgid to close the race; losing to the
            // child (or to its exec) is fine.
            let group = if pgid.as_raw() == 0 { child } else { pgid };
            let _ = setpgid(child, group);
            Ok(child)
        }
        ForkResult::Child => {
            let _ = setpgid(Pid::from_raw(0), pgid);
            unsafe {
                let _ = signal(Signal::SIGTTOU, SigHandler::SigIgn);
                let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
                let _ = signal(Signal::SIGTSTP, SigHandler::SigDfl);
                let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
            }

            let _ = dup2(io.stdin, libc::STDIN_FILENO);
            let _ = dup2(io.stdout, libc::STDOUT_FILENO);
            let _ = dup2(io.stderr, libc::STDERR_FILENO);
            // Drop every inherited descriptor: the raw socket, the pipe
            // ends, other sessions' fds.
            let max = unsafe { libc::getdtablesize() };
            for fd in 3..max {
                unsafe {
                    libc::close(fd);
                }
            }

            apply_redir(&plan.stdin, OFlag::O_RDONLY, libc::STDIN_FILENO);
            apply_redir(
                &plan.stdout,
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                libc::STDOUT_FILENO,
            );
            apply_redir(
                &plan.stderr,
                OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                libc::STDERR_FILENO,
            );

            let _ = execvp(&plan.file, &plan.argv);
            // stderr is the socket (or the redirection target) by now.
            let _ = write_all_fd(libc::STDERR_FILENO, &plan.exec_err);
            exit(EXIT_ERR_CMD);
        }
    }
}

/// In-child: open a redirection target over the given stream, or report the
/// pre-rendered diagnostic and die.
fn apply_redir(redir: &Option<(CString, Vec<u8>)>, flags: OFlag, target: RawFd) {
    let (path, diag) = match redir {
        Some(r) => r,
        None => return,
    };
    let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH;
    match open(path.as_c_str(), flags, mode) {
        Ok(fd) => {
            let _ = dup2(fd, target);
            let _ = nix::unistd::close(fd);
        }
        Err(_) => {
            let _ = write_all_fd(libc::STDERR_FILENO, diag);
            exit(EXIT_ERR_CMD);
        }
    }
}
