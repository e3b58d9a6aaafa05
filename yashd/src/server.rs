//! Daemon-wide state, the servant-thread registry and the accept loop.

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::sys::socket::{
    accept, bind, getpeername, listen, setsockopt, shutdown, socket, sockopt, AddressFamily,
    Backlog, Shutdown, SockFlag, SockType, SockaddrIn,
};

use crate::args::{Args, EXIT_ERR_SOCKET};
use crate::logging;
use crate::session::Session;

/// Max concurrently connected clients.
pub const MAX_SERVANTS: usize = 50;

const LISTEN_BACKLOG: i32 = 5;

/// Process-wide daemon context, passed explicitly instead of living in
/// globals. The PID-file lock rides along so the singleton lock lives
/// exactly as long as the process.
pub struct Daemon {
    pub args: Args,
    pub registry: ServantRegistry,
    /// Set on SIGTERM/SIGINT; sessions escalate to SIGKILL on the way out.
    pub terminating: AtomicBool,
    /// Number of process groups currently owned by some session. The
    /// SIGCHLD fallback reaper only runs when this is zero, so it cannot
    /// steal wait statuses from the supervisors.
    pub live_jobs: AtomicUsize,
    _pid_lock: Flock<File>,
}

impl Daemon {
    pub fn new(args: Args, pid_lock: Flock<File>) -> Self {
        Daemon {
            args,
            registry: ServantRegistry::default(),
            terminating: AtomicBool::new(false),
            live_jobs: AtomicUsize::new(0),
            _pid_lock: pid_lock,
        }
    }
}

/// One row per client-servicing thread.
pub struct ServantRecord {
    pub run: Arc<AtomicBool>,
    pub finished: Arc<AtomicBool>,
    pub socket: RawFd,
    pub handle: Option<JoinHandle<()>>,
}

/// Slots are packed by highest watermark: new servants always enter at the
/// end, and the table only shrinks past a contiguous finished tail. A
/// finished slot is joined before its index is observed as reusable.
#[derive(Default)]
pub struct ServantRegistry {
    slots: Mutex<Vec<Option<ServantRecord>>>,
}

impl ServantRegistry {
    fn trim_tail(slots: &mut Vec<Option<ServantRecord>>) {
        loop {
            match slots.last_mut() {
                Some(None) => {
                    slots.pop();
                }
                Some(Some(rec)) if rec.finished.load(Ordering::Acquire) => {
                    let handle = rec.handle.take();
                    slots.pop();
                    if let Some(h) = handle {
                        // The thread body has already finished; this join
                        // only collects it.
                        let _ = h.join();
                    }
                }
                _ => break,
            }
        }
    }

    /// Reserve a slot for a new connection. Returns the slot index and the
    /// latches shared with the servant, or None when the table is full.
    pub fn reserve(&self, socket: RawFd) -> Option<(usize, Arc<AtomicBool>, Arc<AtomicBool>)> {
        let mut slots = self.slots.lock().unwrap();
        Self::trim_tail(&mut slots);
        if slots.len() >= MAX_SERVANTS {
            return None;
        }
        let run = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let idx = slots.len();
        slots.push(Some(ServantRecord {
            run: run.clone(),
            finished: finished.clone(),
            socket,
            handle: None,
        }));
        Some((idx, run, finished))
    }

    pub fn attach_thread(&self, idx: usize, handle: JoinHandle<()>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Some(rec)) = slots.get_mut(idx) {
            rec.handle = Some(handle);
        }
    }

    /// Free a slot whose servant never started (thread spawn failure).
    pub fn release(&self, idx: usize) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(idx) {
            *slot = None;
        }
        Self::trim_tail(&mut slots);
    }

    pub fn active_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .filter(|s| {
                s.as_ref()
                    .map(|r| !r.finished.load(Ordering::Acquire))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Clear every run latch, then join the servants in reverse order. The
    /// lock is dropped before any join. Sockets are shut down so blocked
    /// polls wake immediately instead of waiting out the interval.
    pub fn shutdown_all(&self) {
        let mut taken = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.iter_mut() {
                if let Some(rec) = slot.take() {
                    rec.run.store(false, Ordering::Release);
                    taken.push(rec);
                }
            }
        }
        for rec in &taken {
            let _ = shutdown(rec.socket, Shutdown::Both);
        }
        for rec in taken.into_iter().rev() {
            if let Some(h) = rec.handle {
                let _ = h.join();
            }
        }
    }
}

/// Flips the `finished` latch even if the servant panics, so the registry
/// never joins a slot that is still running.
struct FinishedGuard(Arc<AtomicBool>);

impl Drop for FinishedGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Bind the TCP listening endpoint: SO_REUSEADDR, INADDR_ANY, backlog 5.
pub fn create_socket(port: u16) -> Result<OwnedFd> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("socket")?;
    setsockopt(&sock, sockopt::ReuseAddr, &true).context("setsockopt SO_REUSEADDR")?;
    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    bind(sock.as_raw_fd(), &addr).with_context(|| format!("bind port {port}"))?;
    listen(&sock, Backlog::new(LISTEN_BACKLOG).expect("valid backlog")).context("listen")?;
    Ok(sock)
}

/// The accept loop. Never blocks on client I/O; every connection gets its
/// own servant thread.
pub fn run_dispatcher(daemon: Arc<Daemon>, listener: OwnedFd) -> ! {
    loop {
        let fd = match accept(listener.as_raw_fd()) {
            Ok(fd) => fd,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                logging::error(&format!("accept failed: {e}"));
                exit(EXIT_ERR_SOCKET);
            }
        };
        // From here the fd is owned; dropping `sock` closes it.
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer = getpeername::<SockaddrIn>(fd)
            .map(|sa| sa.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let (idx, run, finished) = match daemon.registry.reserve(fd) {
            Some(t) => t,
            None => {
                logging::session_warn(&peer, "servant table full, rejecting connection");
                continue;
            }
        };

        let session = match Session::new(daemon.clone(), sock, peer.clone(), run) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                logging::session_error(&peer, &format!("session setup failed: {e}"));
                daemon.registry.release(idx);
                continue;
            }
        };

        logging::session_info(
            daemon.args.verbose,
            &peer,
            &format!(
                "client connected ({} of {MAX_SERVANTS} servant slots in use)",
                daemon.registry.active_count()
            ),
        );
        let spawn = thread::Builder::new()
            .name(format!("servant-{idx}"))
            .spawn(move || {
                let _guard = FinishedGuard(finished);
                session.serve();
            });
        match spawn {
            Ok(handle) => daemon.registry.attach_thread(idx, handle),
            Err(e) => {
                logging::session_error(&peer, &format!("servant thread spawn failed: {e}"));
                daemon.registry.release(idx);
                // The session (and its socket) died with the closure.
            }
        }
    }
}
