use std::io::{self, Read};
use std::mem::{MaybeUninit, size_of};
use std::net::TcpStream;
use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use windows_sys::Win32::Networking::WinSock::{
    FROM_PROTOCOL_INFO, INVALID_SOCKET, SOCKET, WSA_FLAG_OVERLAPPED, WSADATA, WSADuplicateSocketW,
    WSAGetLastError, WSAPROTOCOL_INFOW, WSASocketW, WSAStartup,
};

use super::SESSION_FD_ENV;

const INFO_LEN: usize = size_of::<WSAPROTOCOL_INFOW>();

/// Spawn `command` and hand it a duplicate of `stream` through its stdin.
pub async fn spawn_with_socket(mut command: Command, stream: &TcpStream) -> io::Result<Child> {
    command.env(SESSION_FD_ENV, "stdin").stdin(Stdio::piped());
    let mut child = command.spawn()?;
    let pid = child.id().ok_or_else(|| io::Error::other("session child exited before hand-off"))?;

    let mut info = MaybeUninit::<WSAPROTOCOL_INFOW>::zeroed();
    let socket = stream.as_raw_socket() as SOCKET;
    // SAFETY: live socket handle, output buffer sized for the struct.
    let rc = unsafe { WSADuplicateSocketW(socket, pid, info.as_mut_ptr()) };
    if rc != 0 {
        let err = wsa_error();
        let _ = child.start_kill();
        return Err(err);
    }
    // SAFETY: filled in by WSADuplicateSocketW; plain old data.
    let bytes = unsafe { std::slice::from_raw_parts(info.as_ptr().cast::<u8>(), INFO_LEN) };

    let mut stdin =
        child.stdin.take().ok_or_else(|| io::Error::other("session child has no stdin"))?;
    stdin.write_all(bytes).await?;
    drop(stdin);
    Ok(child)
}

/// Socket handed over by the parent, `None` outside a session child.
pub fn take_session_stream() -> io::Result<Option<TcpStream>> {
    if std::env::var_os(SESSION_FD_ENV).is_none() {
        return Ok(None);
    }
    wsa_startup()?;

    let mut buf = Vec::with_capacity(INFO_LEN);
    io::stdin().read_to_end(&mut buf)?;
    if buf.len() != INFO_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {INFO_LEN} bytes of protocol info, got {}", buf.len()),
        ));
    }
    let mut info = MaybeUninit::<WSAPROTOCOL_INFOW>::uninit();
    // SAFETY: exactly INFO_LEN bytes into a struct of that size.
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), info.as_mut_ptr().cast::<u8>(), INFO_LEN)
    };

    // SAFETY: protocol info produced by WSADuplicateSocketW for this process.
    let sock = unsafe {
        WSASocketW(
            FROM_PROTOCOL_INFO,
            FROM_PROTOCOL_INFO,
            FROM_PROTOCOL_INFO,
            info.as_ptr(),
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if sock == INVALID_SOCKET {
        return Err(wsa_error());
    }
    // SAFETY: freshly created socket owned by nobody else.
    Ok(Some(unsafe { TcpStream::from_raw_socket(sock as RawSocket) }))
}

fn wsa_startup() -> io::Result<()> {
    let mut data = MaybeUninit::<WSADATA>::zeroed();
    // SAFETY: output buffer sized for WSADATA.
    let rc = unsafe { WSAStartup(0x0202, data.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

fn wsa_error() -> io::Error {
    // SAFETY: reads thread-local error state.
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}
