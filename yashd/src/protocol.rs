//! Wire protocol. Requests are newline-terminated text lines of the form
//! `TYPE SP ARG`; responses are an unframed byte stream by default, with an
//! optional sentinel-framed mode for daemon-originated messages.

use std::os::unix::io::RawFd;

/// Max raw command line carried by a CMD request, in bytes.
pub const MAX_CMD_LEN: usize = 2000;

/// The shell prompt, exactly these three bytes.
pub const PROMPT: &[u8] = b"\n# ";

/// Sentinels of the framed response mode.
const FRAME_OPEN: [u8; 2] = [0x02, 0x02];
const FRAME_CLOSE: [u8; 2] = [0x03, 0x03];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctl {
    /// `CTL c`: interrupt the foreground job.
    Interrupt,
    /// `CTL z`: suspend the foreground job.
    Suspend,
    /// `CTL d`: close the session.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Cmd(String),
    Ctl(Ctl),
}

/// How daemon-originated bytes are written back to the client. Child output
/// always bypasses this: the socket is the child's stdout/stderr directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    #[default]
    Stream,
    Framed,
}

/// Decode one request line (trailing newline already split off). Returns
/// None for anything malformed or oversized; the caller logs and drops it.
pub fn parse_request(line: &[u8]) -> Option<Request> {
    let line = match line.strip_suffix(b"\r") {
        Some(l) => l,
        None => line,
    };
    let sp = line.iter().position(|&b| b == b' ')?;
    let (ty, arg) = (&line[..sp], &line[sp + 1..]);
    match ty {
        b"CMD" => {
            if arg.len() > MAX_CMD_LEN {
                return None;
            }
            let s = std::str::from_utf8(arg).ok()?;
            Some(Request::Cmd(s.to_string()))
        }
        b"CTL" => match arg {
            b"c" => Some(Request::Ctl(Ctl::Interrupt)),
            b"z" => Some(Request::Ctl(Ctl::Suspend)),
            b"d" => Some(Request::Ctl(Ctl::Disconnect)),
            _ => None,
        },
        _ => None,
    }
}

/// Write all of `buf` to a raw fd, retrying on EINTR and short writes.
pub fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let written = rc as usize;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write returned 0",
            ));
        }
        buf = &buf[written..];
    }
    Ok(())
}

/// Send one daemon-originated message in the session's response mode.
pub fn send_response(fd: RawFd, mode: ResponseMode, payload: &[u8]) -> std::io::Result<()> {
    match mode {
        ResponseMode::Stream => write_all_fd(fd, payload),
        ResponseMode::Framed => {
            let mut framed = Vec::with_capacity(payload.len() + 4);
            framed.extend_from_slice(&FRAME_OPEN);
            framed.extend_from_slice(payload);
            framed.extend_from_slice(&FRAME_CLOSE);
            write_all_fd(fd, &framed)
        }
    }
}

pub fn send_prompt(fd: RawFd, mode: ResponseMode) -> std::io::Result<()> {
    send_response(fd, mode, PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_request_keeps_raw_line() {
        let req = parse_request(b"CMD ls -l | grep x > /tmp/out").unwrap();
        assert_eq!(req, Request::Cmd("ls -l | grep x > /tmp/out".to_string()));
    }

    #[test]
    fn ctl_requests() {
        assert_eq!(parse_request(b"CTL c"), Some(Request::Ctl(Ctl::Interrupt)));
        assert_eq!(parse_request(b"CTL z"), Some(Request::Ctl(Ctl::Suspend)));
        assert_eq!(parse_request(b"CTL d"), Some(Request::Ctl(Ctl::Disconnect)));
        assert_eq!(parse_request(b"CTL q"), None);
    }

    #[test]
    fn malformed_requests_are_dropped() {
        assert_eq!(parse_request(b""), None);
        assert_eq!(parse_request(b"CMD"), None);
        assert_eq!(parse_request(b" CMD ls"), None);
        assert_eq!(parse_request(b"NOP ls"), None);
    }

    #[test]
    fn oversized_cmd_is_dropped() {
        let mut line = b"CMD ".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_CMD_LEN + 1));
        assert_eq!(parse_request(&line), None);
        let mut ok = b"CMD ".to_vec();
        ok.extend(std::iter::repeat(b'a').take(MAX_CMD_LEN));
        assert!(parse_request(&ok).is_some());
    }

    #[test]
    fn crlf_is_tolerated() {
        assert_eq!(parse_request(b"CTL c\r"), Some(Request::Ctl(Ctl::Interrupt)));
    }

    #[test]
    fn framed_mode_wraps_in_sentinels() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::AsRawFd;
        send_response(w.as_raw_fd(), ResponseMode::Framed, b"hello").unwrap();
        drop(w);
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x02, 0x02, b'h', b'e', b'l', b'l', b'o', 0x03, 0x03]);
    }
}
