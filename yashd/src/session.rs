//! Per-client shell session: the servant loop, request routing, signal
//! forwarding and teardown.

use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe, Pid};

use crate::jobs::{JobStatus, JobTable, JobThread, MAX_CONCURRENT_JOBS};
use crate::launch;
use crate::logging;
use crate::parse;
use crate::protocol::{self, Ctl, Request, ResponseMode};
use crate::server::Daemon;
use crate::supervise;

/// Servant poll interval; also the latency bound for cooperative shutdown.
const POLL_INTERVAL_MS: u16 = 500;

/// Cap on buffered request bytes awaiting a newline. A legal request fits
/// in `CMD ` + 2000 + `\n`; anything beyond this is a misbehaving client.
const MAX_REQUEST_BUF: usize = 8192;

/// Grace given to signalled job groups before escalating, in teardown.
const TEARDOWN_GRACE: Duration = Duration::from_millis(20);

pub struct SessionState {
    pub jobs: JobTable,
    pub threads: Vec<JobThread>,
}

/// One connected client. Owned by its servant thread; job threads hold an
/// `Arc` back to it and are joined before the last reference drops.
pub struct Session {
    pub daemon: Arc<Daemon>,
    pub peer: String,
    pub run: Arc<AtomicBool>,
    pub mode: ResponseMode,
    pub state: Mutex<SessionState>,
    sock: OwnedFd,
    /// Foreground-stdin pipe: children inherit the read end as stdin, the
    /// daemon keeps the write end open so they block instead of hitting
    /// EOF.
    stdin_r: OwnedFd,
    _stdin_w: OwnedFd,
}

impl Session {
    pub fn new(
        daemon: Arc<Daemon>,
        sock: OwnedFd,
        peer: String,
        run: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (stdin_r, stdin_w) = pipe().context("session stdin pipe")?;
        Ok(Session {
            daemon,
            peer,
            run,
            mode: ResponseMode::default(),
            state: Mutex::new(SessionState {
                jobs: JobTable::default(),
                threads: Vec::new(),
            }),
            sock,
            stdin_r,
            _stdin_w: stdin_w,
        })
    }

    pub fn sock_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn stdin_fd(&self) -> RawFd {
        self.stdin_r.as_raw_fd()
    }

    pub fn verbose(&self) -> bool {
        self.daemon.args.verbose
    }

    pub fn info(&self, msg: &str) {
        logging::session_info(self.verbose(), &self.peer, msg);
    }

    pub fn warn(&self, msg: &str) {
        logging::session_warn(&self.peer, msg);
    }

    /// Write daemon-originated bytes; a failed send means the client is
    /// gone and the session winds down.
    pub fn send_bytes(&self, bytes: &[u8]) {
        if let Err(e) = protocol::send_response(self.sock_fd(), self.mode, bytes) {
            self.warn(&format!("send failed ({e}), dropping client"));
            self.run.store(false, Ordering::Release);
        }
    }

    pub fn send_error(&self, msg: &str) {
        self.send_bytes(format!("-yash: {msg}\n").as_bytes());
    }

    pub fn send_prompt(&self) {
        if let Err(e) = protocol::send_prompt(self.sock_fd(), self.mode) {
            self.warn(&format!("prompt send failed ({e}), dropping client"));
            self.run.store(false, Ordering::Release);
        }
    }

    /// Body of the servant thread.
    pub fn serve(self: &Arc<Self>) {
        self.send_prompt();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];

        while self.run.load(Ordering::Acquire) && !self.daemon.terminating.load(Ordering::Acquire)
        {
            self.reap_finished_threads();

            let mut fds = [PollFd::new(self.sock.as_fd(), PollFlags::POLLIN)];
            let n = match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.warn(&format!("poll failed: {e}"));
                    break;
                }
            };
            if n == 0 {
                continue;
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if !revents.contains(PollFlags::POLLIN) {
                if revents.intersects(
                    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL,
                ) {
                    self.info("client hung up");
                    break;
                }
                continue;
            }

            let rc = unsafe {
                libc::read(
                    self.sock_fd(),
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if rc == 0 {
                self.info("client closed connection");
                break;
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                self.warn(&format!("read failed: {err}"));
                break;
            }
            buf.extend_from_slice(&chunk[..rc as usize]);

            // Requests are processed strictly in arrival order.
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                self.handle_line(&line[..line.len() - 1]);
                if !self.run.load(Ordering::Acquire) {
                    break;
                }
            }
            if buf.len() > MAX_REQUEST_BUF {
                self.warn("request buffer overflow, dropping pending bytes");
                buf.clear();
            }
        }

        self.teardown();
    }

    fn handle_line(self: &Arc<Self>, line: &[u8]) {
        let request = match protocol::parse_request(line) {
            Some(r) => r,
            None => {
                self.warn("dropping malformed request");
                return;
            }
        };
        match request {
            Request::Ctl(Ctl::Interrupt) => self.signal_foreground(Signal::SIGINT),
            Request::Ctl(Ctl::Suspend) => self.signal_foreground(Signal::SIGTSTP),
            Request::Ctl(Ctl::Disconnect) => {
                self.info("client requested disconnect");
                self.run.store(false, Ordering::Release);
            }
            Request::Cmd(cmd) => self.handle_cmd(cmd),
        }
    }

    /// Deliver a client signal to the newest non-Done, non-background job.
    fn signal_foreground(&self, sig: Signal) {
        let target = {
            let state = self.state.lock().unwrap();
            state
                .jobs
                .iter()
                .filter(|j| j.status != JobStatus::Done && !j.background)
                .filter_map(|j| j.gpid.map(|g| (j.jobno, g)))
                .last()
        };
        match target {
            Some((jobno, gpid)) => {
                self.info(&format!("forwarding {sig} to job [{jobno}] group {gpid}"));
                if let Err(e) = killpg(gpid, sig) {
                    self.warn(&format!("killpg({gpid}, {sig}) failed: {e}"));
                }
            }
            None => self.info(&format!("no foreground job to receive {sig}")),
        }
    }

    fn handle_cmd(self: &Arc<Self>, cmd: String) {
        if ignore_input(&cmd) {
            self.info("input ignored");
            supervise::maintain_jobs(self, false);
            self.send_prompt();
            return;
        }
        // Builtins dispatch on the exact input line.
        match cmd.as_str() {
            "jobs" => {
                supervise::builtin_jobs(self);
                self.send_prompt();
                return;
            }
            "fg" => {
                supervise::builtin_fg(self);
                return;
            }
            "bg" => {
                supervise::builtin_bg(self);
                self.send_prompt();
                return;
            }
            _ => {}
        }
        self.new_job(cmd);
    }

    fn new_job(self: &Arc<Self>, cmd: String) {
        // Capacity gates a new job before its syntax is even looked at; a
        // full table answers the same way for valid and invalid lines.
        if self.state.lock().unwrap().jobs.is_full() {
            self.send_error(&format!(
                "max number of concurrent jobs reached: {MAX_CONCURRENT_JOBS}"
            ));
            self.send_prompt();
            return;
        }

        let tokens = parse::tokenize(&cmd);
        let parsed = match parse::parse(&tokens) {
            Ok(p) => p,
            Err(e) => {
                self.info(&format!("parse error: {e}"));
                self.send_error(&e.to_string());
                self.send_prompt();
                return;
            }
        };
        if parsed.left.argv.is_empty() {
            // Nothing but operators survived (e.g. a bare `&`).
            self.info("input ignored");
            self.send_prompt();
            return;
        }

        let jobno = {
            let mut state = self.state.lock().unwrap();
            match state.jobs.insert(cmd, tokens, parsed) {
                Some(n) => n,
                None => {
                    drop(state);
                    self.send_error(&format!(
                        "max number of concurrent jobs reached: {MAX_CONCURRENT_JOBS}"
                    ));
                    self.send_prompt();
                    return;
                }
            }
        };

        self.info(&format!("new job [{jobno}]"));
        let sess = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("job-{jobno}"))
            .spawn(move || launch::run_job(&sess, jobno));
        match spawned {
            Ok(handle) => {
                let mut state = self.state.lock().unwrap();
                state.threads.push(JobThread { jobno, handle });
            }
            Err(e) => {
                self.warn(&format!("job thread spawn failed: {e}"));
                let mut state = self.state.lock().unwrap();
                state.jobs.remove(jobno);
                drop(state);
                self.send_error("failed to start job");
                self.send_prompt();
                return;
            }
        }
        supervise::maintain_jobs(self, false);
    }

    /// Collect job threads that have already finished.
    fn reap_finished_threads(&self) {
        let finished: Vec<JobThread> = {
            let mut state = self.state.lock().unwrap();
            let (done, rest): (Vec<_>, Vec<_>) = state
                .threads
                .drain(..)
                .partition(|t| t.handle.is_finished());
            state.threads = rest;
            done
        };
        for t in finished {
            self.info(&format!("collected job thread [{}]", t.jobno));
            let _ = t.handle.join();
        }
    }

    /// Signal surviving job groups, reap what can be reaped, join job
    /// threads, close up.
    fn teardown(self: &Arc<Self>) {
        let hard = self.daemon.terminating.load(Ordering::Acquire);
        self.run.store(false, Ordering::Release);
        self.info(if hard {
            "daemon shutting down, killing session jobs"
        } else {
            "session closing, hanging up job groups"
        });

        let first = if hard { Signal::SIGKILL } else { Signal::SIGHUP };
        self.signal_all_groups(first);
        thread::sleep(TEARDOWN_GRACE);
        supervise::maintain_jobs(self, true);

        // Anything that survived the hangup gets killed outright so the
        // job threads can be joined within a bounded time.
        if !self.live_groups().is_empty() {
            self.signal_all_groups(Signal::SIGKILL);
            thread::sleep(TEARDOWN_GRACE);
            supervise::maintain_jobs(self, true);
        }

        // Orphan whatever is left to the daemon's fallback reaper.
        {
            let mut state = self.state.lock().unwrap();
            let jobnos = state.jobs.jobnos();
            for jobno in jobnos {
                if let Some(job) = state.jobs.get_mut(jobno) {
                    supervise::finish_job(&self.daemon, job);
                }
                state.jobs.remove(jobno);
            }
        }

        let threads: Vec<JobThread> = {
            let mut state = self.state.lock().unwrap();
            state.threads.drain(..).collect()
        };
        for t in threads {
            let _ = t.handle.join();
        }
        self.info("session closed");
    }

    fn live_groups(&self) -> Vec<Pid> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .iter()
            .filter(|j| j.status != JobStatus::Done)
            .filter_map(|j| j.gpid)
            .collect()
    }

    fn signal_all_groups(&self, sig: Signal) {
        for gpid in self.live_groups() {
            let _ = killpg(gpid, sig);
            // A stopped group only sees the signal once continued.
            let _ = killpg(gpid, Signal::SIGCONT);
        }
    }
}

/// Blank input: empty or whitespace-only lines are not jobs.
fn ignore_input(input: &str) -> bool {
    input.chars().all(|c| c.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_is_ignored() {
        assert!(ignore_input(""));
        assert!(ignore_input("   "));
        assert!(ignore_input(" \t "));
        assert!(!ignore_input("ls"));
        assert!(!ignore_input("  ls  "));
    }
}
