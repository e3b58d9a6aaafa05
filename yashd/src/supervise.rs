//! Job supervision: the synchronous foreground wait, non-blocking status
//! maintenance, and the `jobs` / `fg` / `bg` builtins.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, tcsetpgrp, Pid};

use crate::jobs::{Job, JobStatus, JobThread};
use crate::server::Daemon;
use crate::session::Session;

/// Transition a job to Done exactly once, releasing its group accounting.
/// Clearing `gpid` keeps the "gpid set iff not Done" invariant.
pub fn finish_job(daemon: &Daemon, job: &mut Job) {
    if job.status != JobStatus::Done {
        job.status = JobStatus::Done;
        job.live = 0;
        if job.gpid.take().is_some() {
            daemon.live_jobs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Wait pid argument addressing the whole process group.
fn group_target(gpid: Pid) -> Pid {
    Pid::from_raw(-gpid.as_raw())
}

/// Drive a foreground job: hand over the (virtual) terminal, block until
/// the group finishes or stops, take the terminal back, and prompt. Used by
/// the launcher and by the `fg` builtin.
pub fn foreground(sess: &Arc<Session>, jobno: usize) {
    let gpid = {
        let state = sess.state.lock().unwrap();
        match state.jobs.get(jobno).and_then(|j| j.gpid) {
            Some(g) => g,
            None => {
                sess.send_prompt();
                return;
            }
        }
    };

    // The daemon has no controlling terminal, so this is best-effort; it
    // keeps the handover observable under a pty-backed test harness.
    let _ = tcsetpgrp(std::io::stdin(), gpid);
    let status = wait_foreground(sess, jobno, gpid);
    let _ = tcsetpgrp(std::io::stdin(), getpid());

    if status == JobStatus::Done {
        let mut state = sess.state.lock().unwrap();
        state.jobs.remove(jobno);
    }
    sess.send_prompt();
}

/// Blocking wait on the exact group until its expected children are gone or
/// the group stops. Stop leaves the job in the table for `fg`/`bg`.
fn wait_foreground(sess: &Arc<Session>, jobno: usize, gpid: Pid) -> JobStatus {
    let flags = Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED);
    loop {
        // Another reaper (maintenance, fallback) may have finished the job.
        {
            let state = sess.state.lock().unwrap();
            match state.jobs.get(jobno) {
                None => return JobStatus::Done,
                Some(job) if job.status == JobStatus::Done => return JobStatus::Done,
                _ => {}
            }
        }
        match waitpid(group_target(gpid), flags) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                let mut state = sess.state.lock().unwrap();
                let job = match state.jobs.get_mut(jobno) {
                    Some(j) => j,
                    None => return JobStatus::Done,
                };
                job.live = job.live.saturating_sub(1);
                if job.live == 0 {
                    finish_job(&sess.daemon, job);
                    return JobStatus::Done;
                }
            }
            Ok(WaitStatus::Stopped(..)) => {
                let mut state = sess.state.lock().unwrap();
                if let Some(job) = state.jobs.get_mut(jobno) {
                    job.status = JobStatus::Stopped;
                }
                sess.info(&format!("job [{jobno}] stopped"));
                return JobStatus::Stopped;
            }
            Ok(WaitStatus::Continued(..)) => {
                let mut state = sess.state.lock().unwrap();
                if let Some(job) = state.jobs.get_mut(jobno) {
                    job.status = JobStatus::Running;
                }
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                if e != Errno::ECHILD {
                    sess.warn(&format!("waitpid on group {gpid} failed: {e}"));
                }
                let mut state = sess.state.lock().unwrap();
                if let Some(job) = state.jobs.get_mut(jobno) {
                    finish_job(&sess.daemon, job);
                }
                return JobStatus::Done;
            }
        }
    }
}

/// Non-blocking sweep over every live job: reap exits, flip stop/continue
/// status, report and drop finished jobs. Socket writes happen after the
/// session lock is released; `quiet` suppresses them during teardown.
pub fn maintain_jobs(sess: &Session, quiet: bool) {
    let mut report: Vec<String> = Vec::new();
    {
        let mut state = sess.state.lock().unwrap();
        let jobnos = state.jobs.jobnos();
        for jobno in jobnos {
            let mut done = false;
            {
                let job = match state.jobs.get_mut(jobno) {
                    Some(j) => j,
                    None => continue,
                };
                if job.status == JobStatus::Done {
                    continue;
                }
                // A running foreground job is owned by its wait thread;
                // draining its group here would steal the exit status.
                if job.status == JobStatus::Running && !job.background {
                    continue;
                }
                let gpid = match job.gpid {
                    Some(g) => g,
                    // Not launched yet; its job thread owns it.
                    None => continue,
                };
                let flags = Some(
                    WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED,
                );
                loop {
                    match waitpid(group_target(gpid), flags) {
                        Ok(WaitStatus::StillAlive) => break,
                        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                            job.live = job.live.saturating_sub(1);
                            if job.live == 0 {
                                finish_job(&sess.daemon, job);
                                done = true;
                                break;
                            }
                        }
                        Ok(WaitStatus::Stopped(..)) => {
                            job.status = JobStatus::Stopped;
                            break;
                        }
                        Ok(WaitStatus::Continued(..)) => {
                            job.status = JobStatus::Running;
                        }
                        Ok(_) => {}
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            if e != Errno::ECHILD {
                                sess.warn(&format!(
                                    "status check for group {gpid} failed: {e}"
                                ));
                            }
                            finish_job(&sess.daemon, job);
                            done = true;
                            break;
                        }
                    }
                }
            }
            if done {
                let current = state.jobs.current() == Some(jobno);
                if let Some(job) = state.jobs.get(jobno) {
                    report.push(job.format_line(current));
                }
                state.jobs.remove(jobno);
            }
        }
    }
    if !quiet {
        for line in report {
            sess.send_bytes(line.as_bytes());
        }
    }
}

/// `jobs`: refresh the table, then list Running/Stopped jobs; `+` marks the
/// highest-numbered live job.
pub fn builtin_jobs(sess: &Session) {
    maintain_jobs(sess, false);
    let listing = {
        let state = sess.state.lock().unwrap();
        if state.jobs.is_empty() {
            "No jobs in job table\n".to_string()
        } else {
            let current = state.jobs.current();
            state
                .jobs
                .iter()
                .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Stopped))
                .map(|j| j.format_line(current == Some(j.jobno)))
                .collect()
        }
    };
    sess.send_bytes(listing.as_bytes());
}

/// `fg`: bring the highest-numbered live job to the foreground, continuing
/// it if stopped, and wait for it on a fresh job thread.
pub fn builtin_fg(sess: &Arc<Session>) {
    let picked = {
        let mut state = sess.state.lock().unwrap();
        let target = state
            .jobs
            .iter()
            .filter(|j| j.status != JobStatus::Done && j.gpid.is_some())
            .map(|j| j.jobno)
            .last();
        match target {
            None => None,
            Some(jobno) => {
                let current = state.jobs.current() == Some(jobno);
                let job = state.jobs.get_mut(jobno).unwrap();
                job.background = false;
                job.status = JobStatus::Running;
                Some((jobno, job.gpid.unwrap(), job.format_line(current)))
            }
        }
    };
    let (jobno, gpid, line) = match picked {
        Some(p) => p,
        None => {
            sess.send_error("fg: no current job");
            sess.send_prompt();
            return;
        }
    };
    sess.send_bytes(line.as_bytes());
    if let Err(e) = killpg(gpid, Signal::SIGCONT) {
        sess.warn(&format!("killpg({gpid}, SIGCONT) failed: {e}"));
    }

    let sess2 = Arc::clone(sess);
    let spawned = thread::Builder::new()
        .name(format!("job-{jobno}-fg"))
        .spawn(move || foreground(&sess2, jobno));
    match spawned {
        Ok(handle) => {
            let mut state = sess.state.lock().unwrap();
            state.threads.push(JobThread { jobno, handle });
        }
        Err(e) => {
            sess.warn(&format!("fg wait thread spawn failed: {e}"));
            sess.send_error("failed to resume job");
            sess.send_prompt();
        }
    }
}

/// `bg`: continue the highest-numbered stopped job in the background.
pub fn builtin_bg(sess: &Session) {
    let picked = {
        let mut state = sess.state.lock().unwrap();
        let target = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Stopped && j.gpid.is_some())
            .map(|j| j.jobno)
            .last();
        match target {
            None => None,
            Some(jobno) => {
                let current = state.jobs.current() == Some(jobno);
                let job = state.jobs.get_mut(jobno).unwrap();
                job.background = true;
                job.status = JobStatus::Running;
                Some((job.gpid.unwrap(), job.format_line(current)))
            }
        }
    };
    let (gpid, line) = match picked {
        Some(p) => p,
        None => {
            sess.send_error("bg: no current job");
            return;
        }
    };
    if let Err(e) = killpg(gpid, Signal::SIGCONT) {
        sess.warn(&format!("killpg({gpid}, SIGCONT) failed: {e}"));
    }
    sess.send_bytes(line.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use crate::jobs::Job;
    use crate::parse::{parse, tokenize};
    use nix::fcntl::{Flock, FlockArg};

    fn test_daemon() -> Daemon {
        let file = tempfile::tempfile().unwrap();
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(l) => l,
            Err((_, e)) => panic!("flock scratch file: {e}"),
        };
        Daemon::new(Args::default(), lock)
    }

    fn job(line: &str) -> Job {
        let toks = tokenize(line);
        let parsed = parse(&toks).unwrap();
        Job::new(1, line.to_string(), toks, parsed)
    }

    #[test]
    fn group_target_addresses_the_whole_group() {
        assert_eq!(group_target(Pid::from_raw(57)).as_raw(), -57);
    }

    #[test]
    fn finish_job_releases_accounting_once() {
        let daemon = test_daemon();
        let mut j = job("sleep 30 &");
        j.gpid = Some(Pid::from_raw(4242));
        daemon.live_jobs.fetch_add(1, Ordering::AcqRel);

        finish_job(&daemon, &mut j);
        assert_eq!(j.status, JobStatus::Done);
        assert!(j.gpid.is_none());
        assert_eq!(j.live, 0);
        assert_eq!(daemon.live_jobs.load(Ordering::Acquire), 0);

        // Repeated transitions (wait thread racing maintenance) must not
        // release the group accounting twice.
        finish_job(&daemon, &mut j);
        assert_eq!(j.status, JobStatus::Done);
        assert_eq!(daemon.live_jobs.load(Ordering::Acquire), 0);
    }

    #[test]
    fn finish_job_without_group_leaves_counter_alone() {
        let daemon = test_daemon();
        // Never launched: no gpid was recorded, so nothing was counted.
        let mut j = job("ls");
        finish_job(&daemon, &mut j);
        assert_eq!(j.status, JobStatus::Done);
        assert_eq!(daemon.live_jobs.load(Ordering::Acquire), 0);
    }
}
