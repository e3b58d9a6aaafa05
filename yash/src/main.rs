//! yash: terminal client for the yashd daemon. Relays stdin lines as
//! `CMD` requests, terminal signals as `CTL c` / `CTL z`, and streams
//! server output to stdout.

use std::io::{self, BufRead, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::exit;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTSTP};
use signal_hook::iterator::Signals;

const DEFAULT_TCP_PORT: u16 = 3826;

const EXIT_OK: i32 = 0;
const EXIT_ERR_ARG: i32 = 2;
const EXIT_ERR_SOCKET: i32 = 4;

const USAGE: &str = "\nUsage:\n\
    yash [options] <host>\n\
    \n\
    Options:\n\
    -h, --help              Print help and exit\n\
    -p PORT, --port PORT    Server port [1024-65535]\n";

struct ClientArgs {
    host: String,
    port: u16,
}

fn parse_args<I: Iterator<Item = String>>(mut argv: I) -> ClientArgs {
    let mut host: Option<String> = None;
    let mut port = DEFAULT_TCP_PORT;
    while let Some(a) = argv.next() {
        match a.as_str() {
            "-h" | "--help" => {
                print!("{USAGE}");
                exit(EXIT_OK);
            }
            "-p" | "--port" => match argv.next().and_then(|v| v.parse::<u16>().ok()) {
                Some(p) if p >= 1024 => port = p,
                _ => {
                    println!("-yash: port must be an integer between 1024 and 65535");
                    print!("{USAGE}");
                    exit(EXIT_ERR_ARG);
                }
            },
            other if host.is_none() && !other.starts_with('-') => {
                host = Some(other.to_string());
            }
            other => {
                println!("-yash: unknown argument: {other}");
                print!("{USAGE}");
                exit(EXIT_ERR_ARG);
            }
        }
    }
    match host {
        Some(host) => ClientArgs { host, port },
        None => {
            println!("-yash: missing host address");
            print!("{USAGE}");
            exit(EXIT_ERR_ARG);
        }
    }
}

/// Map terminal SIGINT/SIGTSTP to CTL requests instead of dying on them.
fn spawn_signal_relay(sock: Arc<TcpStream>) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTSTP]).context("install signal relay")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let msg: &[u8] = match sig {
                    SIGINT => b"CTL c\n",
                    SIGTSTP => b"CTL z\n",
                    _ => continue,
                };
                if (&*sock).write_all(msg).is_err() {
                    break;
                }
            }
        })
        .context("spawn signal relay thread")?;
    Ok(())
}

/// Stream server bytes to stdout until the daemon closes the connection.
fn spawn_reader(sock: Arc<TcpStream>) -> Result<()> {
    thread::Builder::new()
        .name("reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            let mut out = io::stdout();
            loop {
                match (&*sock).read(&mut buf) {
                    Ok(0) | Err(_) => {
                        println!("Disconnected!");
                        exit(EXIT_OK);
                    }
                    Ok(n) => {
                        if out.write_all(&buf[..n]).is_err() {
                            exit(EXIT_OK);
                        }
                        let _ = out.flush();
                    }
                }
            }
        })
        .context("spawn reader thread")?;
    Ok(())
}

fn run(args: ClientArgs) -> Result<()> {
    let addr = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve host {}", args.host))?
        .next()
        .with_context(|| format!("no address for host {}", args.host))?;
    let sock = Arc::new(
        TcpStream::connect(addr).with_context(|| format!("cannot connect to {addr}"))?,
    );

    spawn_signal_relay(sock.clone())?;
    spawn_reader(sock.clone())?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim() == "exit" {
            return Ok(());
        }
        (&*sock)
            .write_all(format!("CMD {line}\n").as_bytes())
            .context("send command")?;
    }
    // Terminal EOF: ask the daemon to close the session.
    let _ = (&*sock).write_all(b"CTL d\n");
    Ok(())
}

fn main() {
    let args = parse_args(std::env::args().skip(1));
    if let Err(e) = run(args) {
        eprintln!("-yash: {e:#}");
        exit(EXIT_ERR_SOCKET);
    }
}
