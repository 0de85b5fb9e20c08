//! # txc-proxy
//!
//! TCP front end for the connector library: one connector instance per
//! client connection.
//!
//! - **Server** (`server`): control port listener and session isolation
//! - **Session** (`session`): command loop and callback forwarding
//! - **Framing** (`frame`): `\0`-terminated messages on both sockets
//! - **Hand-off** (`handoff`): passing sockets to session processes
//! - **Client** (`client`): client side of the protocol
//!
//! # Protocol
//!
//! ```text
//! client                          proxy
//!   ── connect control port ──►
//!   ◄── data port (u16 LE) ────
//!   ── connect data port ─────►
//!   ── command\0 ─────────────►   SendCommand
//!   ◄── reply\0 ───────────────
//!   ◄══ message\0 ═════════════   callback (data socket)
//! ```

pub mod client;
pub mod frame;
pub mod handoff;
pub mod loader;
pub mod server;
pub mod session;

pub use client::ProxyClient;
pub use loader::{ConnectorLoader, DylibLoader};
pub use server::{ProxyServer, SessionCommand, SessionMode, serve_inherited};
pub use session::{SessionSettings, run_session};
