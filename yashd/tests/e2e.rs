//! End-to-end coverage: boots the real daemon binary, speaks the wire
//! protocol over TCP and checks the observable contract. The daemon is a
//! host-wide singleton (PID-file lock), so everything runs in one test.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::Command;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;

const PORT: u16 = 28391;
const PID_PATH: &str = "/tmp/yashd.pid";
const LOG_PATH: &str = "/tmp/yashd.log";
const PROMPT: &str = "\n# ";

fn start_daemon() -> Pid {
    // Clear out any daemon left behind by an earlier aborted run.
    stop_daemon_if_running();

    let status = Command::new(env!("CARGO_BIN_EXE_yashd"))
        .arg("-p")
        .arg(PORT.to_string())
        .arg("-v")
        .status()
        .expect("spawn yashd");
    // The CLI process is only the fork parent; it exits 0 at once.
    assert!(status.success(), "yashd launcher exited with {status}");

    // Wait for the daemonized child to come up and write its PID.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", PORT)) {
            drop(stream);
            break;
        }
        assert!(Instant::now() < deadline, "daemon never started listening");
        std::thread::sleep(Duration::from_millis(50));
    }
    let pid: i32 = fs::read_to_string(PID_PATH)
        .expect("read pid file")
        .trim()
        .parse()
        .expect("pid file holds decimal pid");
    Pid::from_raw(pid)
}

fn stop_daemon_if_running() {
    if let Ok(text) = fs::read_to_string(PID_PATH) {
        if let Ok(pid) = text.trim().parse::<i32>() {
            let pid = Pid::from_raw(pid);
            if kill(pid, None).is_ok() {
                let _ = kill(pid, Signal::SIGTERM);
                let deadline = Instant::now() + Duration::from_secs(3);
                while kill(pid, None).is_ok() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

struct Client {
    stream: TcpStream,
    buf: String,
}

impl Client {
    fn connect() -> Self {
        let stream = TcpStream::connect(("127.0.0.1", PORT)).expect("connect to daemon");
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        Client {
            stream,
            buf: String::new(),
        }
    }

    fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .expect("send request");
    }

    /// Accumulate server bytes until `needle` shows up; panics on timeout.
    fn read_until(&mut self, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        while !self.buf.contains(needle) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {needle:?}; got {:?}",
                self.buf
            );
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("server closed the connection; got {:?}", self.buf),
                Ok(n) => self.buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        let end = self.buf.find(needle).unwrap() + needle.len();
        let consumed: String = self.buf.drain(..end).collect();
        consumed
    }

    fn read_until_prompt(&mut self) -> String {
        self.read_until(PROMPT, Duration::from_secs(5))
    }

    /// True once the server has closed its side.
    fn wait_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return true,
            }
        }
        false
    }
}

#[test]
fn daemon_end_to_end() {
    let daemon_pid = start_daemon();

    // A fresh session greets with the prompt.
    let mut c = Client::connect();
    c.read_until_prompt();

    // Simple command: output, then the prompt, then an empty job table.
    c.send("CMD echo hello");
    let out = c.read_until_prompt();
    assert!(out.contains("hello\n"), "missing echo output in {out:?}");
    c.send("CMD jobs");
    let out = c.read_until_prompt();
    assert!(
        out.contains("No jobs in job table"),
        "expected empty job table, got {out:?}"
    );

    // Background job shows up in the listing with the `+` marker.
    c.send("CMD sleep 30 &");
    c.read_until_prompt();
    c.send("CMD jobs");
    let out = c.read_until_prompt();
    let re = Regex::new(r"(?m)^\[1\]\+ Running\tsleep 30 $").unwrap();
    assert!(re.is_match(&out), "jobs listing mismatch: {out:?}");

    // Parser diagnostics use the fixed templates and spawn nothing.
    c.send("CMD > out");
    let out = c.read_until_prompt();
    assert!(
        out.contains("-yash: syntax error: command should not start with >"),
        "missing parse diagnostic in {out:?}"
    );

    // Pipeline with redirection: both children share a group, the file
    // gets the right-hand output, and the job leaves the table.
    let dir = tempfile::tempdir().expect("tempdir");
    let outfile = dir.path().join("out");
    c.send(&format!("CMD echo xylophone | grep xylo > {}", outfile.display()));
    c.read_until_prompt();
    let written = fs::read_to_string(&outfile).expect("redirection target written");
    assert_eq!(written, "xylophone\n");
    c.send("CMD jobs");
    let out = c.read_until_prompt();
    assert!(
        !out.contains("[2]"),
        "completed pipeline job still listed: {out:?}"
    );
    assert!(
        out.contains("[1]+ Running\tsleep 30 "),
        "background job disappeared: {out:?}"
    );

    // CTL c interrupts the foreground job; the servant recovers with a
    // fresh prompt and the daemon survives.
    c.send("CMD cat");
    std::thread::sleep(Duration::from_millis(300));
    c.send("CTL c");
    c.read_until_prompt();
    assert!(kill(daemon_pid, None).is_ok(), "daemon died after CTL c");

    // CTL d closes this session only; the listener stays available.
    c.send("CTL d");
    assert!(
        c.wait_closed(Duration::from_secs(2)),
        "daemon kept the socket open after CTL d"
    );
    let mut c2 = Client::connect();
    c2.read_until_prompt();

    // Stop/continue: a suspended foreground job stays in the table as
    // Stopped and bg resumes it.
    c2.send("CMD sleep 20");
    std::thread::sleep(Duration::from_millis(300));
    c2.send("CTL z");
    c2.read_until_prompt();
    c2.send("CMD jobs");
    let out = c2.read_until_prompt();
    assert!(
        out.contains("Stopped\tsleep 20 "),
        "suspended job not listed as Stopped: {out:?}"
    );
    c2.send("CMD bg");
    let out = c2.read_until_prompt();
    assert!(
        out.contains("Running\tsleep 20 "),
        "bg did not report the resumed job: {out:?}"
    );

    // fg: stop a fresh foreground job, resume it in the foreground. The
    // job line is echoed, the wait runs to completion and the prompt only
    // comes back once the job has left the table.
    c2.send("CMD sleep 2");
    std::thread::sleep(Duration::from_millis(300));
    c2.send("CTL z");
    c2.read_until_prompt();
    c2.send("CMD fg");
    let out = c2.read_until_prompt();
    assert!(
        out.contains("[2]+ Running\tsleep 2 "),
        "fg did not echo the resumed job line: {out:?}"
    );
    c2.send("CMD jobs");
    let out = c2.read_until_prompt();
    assert!(
        !out.contains("[2]"),
        "foregrounded job still listed after completion: {out:?}"
    );
    assert!(
        out.contains("[1]+ Running\tsleep 20 "),
        "background job lost across fg: {out:?}"
    );

    // Singleton: a second instance must bow out, logging distinctively.
    let log_len = fs::metadata(LOG_PATH).map(|m| m.len()).unwrap_or(0) as usize;
    let status = Command::new(env!("CARGO_BIN_EXE_yashd"))
        .arg("-p")
        .arg((PORT + 1).to_string())
        .status()
        .expect("spawn second yashd");
    assert!(status.success());
    std::thread::sleep(Duration::from_secs(1));
    let log = fs::read_to_string(LOG_PATH).unwrap_or_default();
    assert!(
        log[log_len.min(log.len())..].contains("another daemon instance"),
        "missing singleton conflict log line"
    );
    assert!(
        TcpStream::connect(("127.0.0.1", PORT + 1)).is_err(),
        "second instance is listening; singleton lock failed"
    );

    // Shutdown: SIGTERM stops the daemon and the port closes.
    kill(daemon_pid, Signal::SIGTERM).expect("SIGTERM daemon");
    let deadline = Instant::now() + Duration::from_secs(5);
    while kill(daemon_pid, None).is_ok() {
        assert!(Instant::now() < deadline, "daemon ignored SIGTERM");
        std::thread::sleep(Duration::from_millis(50));
    }
}
