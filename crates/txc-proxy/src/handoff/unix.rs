use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, Command};

use super::SESSION_FD_ENV;

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Spawn `command` with `stream` inherited under its current descriptor.
pub async fn spawn_with_socket(mut command: Command, stream: &TcpStream) -> io::Result<Child> {
    let fd = stream.as_raw_fd();
    command.env(SESSION_FD_ENV, fd.to_string()).stdin(Stdio::null());
    // SAFETY: the hook only issues fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || set_cloexec(fd, false));
    }
    command.spawn()
}

/// Socket handed over by the parent, `None` outside a session child.
///
/// Only the first call can succeed.
pub fn take_session_stream() -> io::Result<Option<TcpStream>> {
    let Some(value) = std::env::var_os(SESSION_FD_ENV) else {
        return Ok(None);
    };
    if TAKEN.swap(true, Ordering::SeqCst) {
        return Err(io::Error::other("session socket already taken"));
    }
    let fd: RawFd = value.to_str().and_then(|s| s.parse().ok()).ok_or_else(|| {
        let msg = format!("bad {SESSION_FD_ENV} value {value:?}");
        io::Error::new(io::ErrorKind::InvalidInput, msg)
    })?;
    // validates the descriptor and keeps it away from our own children
    set_cloexec(fd, true)?;
    // SAFETY: the descriptor is open and owned by nobody else in this process.
    Ok(Some(unsafe { TcpStream::from_raw_fd(fd) }))
}

fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: plain fcntl calls on an integer descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::os::fd::IntoRawFd;

    fn cloexec(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) & libc::FD_CLOEXEC != 0 }
    }

    #[test]
    fn toggles_close_on_exec() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let fd = stream.as_raw_fd();
        assert!(cloexec(fd));
        set_cloexec(fd, false).unwrap();
        assert!(!cloexec(fd));
        set_cloexec(fd, true).unwrap();
        assert!(cloexec(fd));
    }

    #[test]
    fn closed_descriptor_is_an_error() {
        assert!(set_cloexec(-1, true).is_err());
    }

    #[test]
    fn inherited_socket_is_taken_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        // as a session child sees it: an open descriptor without FD_CLOEXEC
        let fd = accepted.into_raw_fd();
        set_cloexec(fd, false).unwrap();
        // SAFETY: no other test in this crate touches the variable.
        unsafe { std::env::set_var(SESSION_FD_ENV, fd.to_string()) };

        let mut stream = take_session_stream().unwrap().unwrap();
        assert_eq!(stream.as_raw_fd(), fd);
        assert!(cloexec(fd));
        stream.write_all(b"<ok/>\0").unwrap();
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"<ok/>\0");

        let err = take_session_stream().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        unsafe { std::env::remove_var(SESSION_FD_ENV) };
        assert!(take_session_stream().unwrap().is_none());
    }
}
