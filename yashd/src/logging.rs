//! Log output goes to stderr, which the daemonizer points at
//! /tmp/yashd.log. One formatted message per write keeps lines atomic.

use chrono::Local;

fn stamp() -> String {
    Local::now().format("%b %d %H:%M:%S").to_string()
}

pub fn info(verbose: bool, msg: &str) {
    if verbose {
        eprintln!("{} yashd: INFO: {}", stamp(), msg);
    }
}

/// Unconditional informational line (not gated by --verbose).
pub fn notice(msg: &str) {
    eprintln!("{} yashd: INFO: {}", stamp(), msg);
}

pub fn warn(msg: &str) {
    eprintln!("{} yashd: WARN: {}", stamp(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} yashd: ERROR: {}", stamp(), msg);
}

/// Session-scoped variants carry the peer address as a `yashd[ip:port]:`
/// tag.
pub fn session_info(verbose: bool, peer: &str, msg: &str) {
    if verbose {
        eprintln!("{} yashd[{}]: INFO: {}", stamp(), peer, msg);
    }
}

pub fn session_warn(peer: &str, msg: &str) {
    eprintln!("{} yashd[{}]: WARN: {}", stamp(), peer, msg);
}

pub fn session_error(peer: &str, msg: &str) {
    eprintln!("{} yashd[{}]: ERROR: {}", stamp(), peer, msg);
}
