//! yashd: a daemon that runs a miniature POSIX shell for each TCP client.
//! Clients send `CMD`/`CTL` request lines; child process output streams
//! back over the socket directly.

mod args;
mod daemon;
mod jobs;
mod launch;
mod logging;
mod parse;
mod protocol;
mod server;
mod session;
mod supervise;

use std::env;
use std::process::exit;
use std::sync::Arc;

use nix::unistd::getpid;

use args::{EXIT_ERR_DAEMON, EXIT_ERR_SOCKET, EXIT_ERR_THREAD};
use server::Daemon;

fn main() {
    let args = args::parse(env::args().skip(1));

    let pid_lock = match daemon::daemonize() {
        Ok(lock) => lock,
        Err(e) => {
            logging::error(&format!("daemonization failed: {e:#}"));
            exit(EXIT_ERR_DAEMON);
        }
    };
    logging::info(
        args.verbose,
        &format!("daemon started, pid {}", getpid()),
    );

    let daemon = Arc::new(Daemon::new(args, pid_lock));
    if let Err(e) = daemon::spawn_signal_watcher(daemon.clone()) {
        logging::error(&format!("signal watcher setup failed: {e:#}"));
        exit(EXIT_ERR_THREAD);
    }

    let listener = match server::create_socket(args.port) {
        Ok(l) => l,
        Err(e) => {
            logging::error(&format!("listener setup failed: {e:#}"));
            exit(EXIT_ERR_SOCKET);
        }
    };
    logging::notice(&format!("listening on port {}", args.port));

    server::run_dispatcher(daemon, listener);
}
