//! Passing an accepted client socket to a session child process.
//!
//! Unix: the descriptor is inherited across `exec` and its number is passed
//! in [`SESSION_FD_ENV`]. Windows: the socket is duplicated for the child
//! with `WSADuplicateSocketW` and the protocol info is written to its stdin.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{spawn_with_socket, take_session_stream};
#[cfg(windows)]
pub use windows::{spawn_with_socket, take_session_stream};

/// Environment variable marking a process as a session child.
pub const SESSION_FD_ENV: &str = "TXC_SESSION_FD";
