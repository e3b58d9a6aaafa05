//! Per-session job bookkeeping: one `Job` per parsed command line, stored in
//! a bounded table whose watermark only shrinks past completed tail slots.

use std::fmt;
use std::thread::JoinHandle;

use nix::unistd::Pid;

/// Max number of concurrent jobs per session.
pub const MAX_CONCURRENT_JOBS: usize = 20;

/// One side of a command line: argv plus optional path redirections. An
/// unset redirection means the corresponding stream stays on the socket
/// (or the pipe, for the wired ends of a pipeline).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdSpec {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Output of the parser, before the job gains runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub left: CmdSpec,
    /// Present exactly when the line contained a pipe.
    pub right: Option<CmdSpec>,
    pub background: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    Done,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Stopped => write!(f, "Stopped"),
            JobStatus::Done => write!(f, "Done"),
        }
    }
}

/// A parsed command line and the process group it spawned.
#[derive(Debug)]
pub struct Job {
    pub cmd_str: String,
    pub tokens: Vec<String>,
    pub left: CmdSpec,
    pub right: Option<CmdSpec>,
    pub background: bool,
    /// Group PID, recorded after a successful fork of the group leader.
    pub gpid: Option<Pid>,
    /// 1-based; equals slot index + 1 at insertion time.
    pub jobno: usize,
    pub status: JobStatus,
    /// Children of the group not yet reaped (1 simple, 2 piped).
    pub live: u8,
}

impl Job {
    pub fn new(jobno: usize, cmd_str: String, mut tokens: Vec<String>, parsed: Parsed) -> Self {
        let live = if parsed.right.is_some() { 2 } else { 1 };
        // Listings show the command without the background marker.
        if parsed.background && tokens.last().map(String::as_str) == Some("&") {
            tokens.pop();
        }
        Job {
            cmd_str,
            tokens,
            left: parsed.left,
            right: parsed.right,
            background: parsed.background,
            gpid: None,
            jobno,
            status: JobStatus::Running,
            live,
        }
    }

    /// `[N](+|-) STATUS<TAB>tok1 tok2 `. The trailing space comes from the
    /// token join.
    pub fn format_line(&self, current: bool) -> String {
        let marker = if current { '+' } else { '-' };
        let mut line = format!("[{}]{} {}\t", self.jobno, marker, self.status);
        for tok in &self.tokens {
            line.push_str(tok);
            line.push(' ');
        }
        line.push('\n');
        line
    }
}

/// Record of the OS thread driving one job's launcher and wait loop.
pub struct JobThread {
    pub jobno: usize,
    pub handle: JoinHandle<()>,
}

/// Bounded job table. New jobs always enter at the watermark; freeing a
/// slot clears it and lets the watermark retreat past any completed tail.
#[derive(Default)]
pub struct JobTable {
    slots: Vec<Option<Job>>,
}

impl JobTable {
    /// True when the watermark has hit capacity; no new job may enter.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= MAX_CONCURRENT_JOBS
    }

    /// Reserve the next slot. Returns the 1-based job number, or None if
    /// the table is at capacity.
    pub fn insert(&mut self, cmd_str: String, tokens: Vec<String>, parsed: Parsed) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let jobno = self.slots.len() + 1;
        self.slots.push(Some(Job::new(jobno, cmd_str, tokens, parsed)));
        Some(jobno)
    }

    pub fn get(&self, jobno: usize) -> Option<&Job> {
        self.slots.get(jobno.checked_sub(1)?)?.as_ref()
    }

    pub fn get_mut(&mut self, jobno: usize) -> Option<&mut Job> {
        self.slots.get_mut(jobno.checked_sub(1)?)?.as_mut()
    }

    /// Clear a slot and retreat the watermark past the completed tail.
    pub fn remove(&mut self, jobno: usize) {
        if let Some(slot) = self.slots.get_mut(jobno.wrapping_sub(1)) {
            *slot = None;
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    /// Highest job number currently occupied; this job carries the `+`
    /// marker in listings.
    pub fn current(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, s)| s.as_ref().map(|_| i + 1))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Job numbers in table order, for lock-free iteration over a snapshot.
    pub fn jobnos(&self) -> Vec<usize> {
        self.iter().map(|j| j.jobno).collect()
    }
}
