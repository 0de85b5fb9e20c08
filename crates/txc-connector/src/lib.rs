//! # txc-connector
//!
//! Bindings to the TRANSAQ XML Connector library (`txmlconnector.dll`).
//!
//! - **Symbol table** (`ffi`): dynamic loading of the eight exports
//! - **Buffers** (`buffer`): connector-owned strings released with `FreeMemory`
//! - **Callbacks** (`callback`): closures behind `SetCallbackEx`
//! - **Streams** (`stream`): combinators over incoming messages
//! - **Connector** (`connector`): `TransaqConnector` lifecycle and `Sender`
//!
//! With the `mock` feature, `mock` provides an in-process connector that
//! exports the same functions, for tests without the real library.

pub mod buffer;
mod callback;
pub mod connector;
pub mod ffi;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod stream;

pub use buffer::{TCStr, parse_send_response, transaction_id, xml_attr};
pub use connector::{InitOptions, InputStream, Sender, TransaqConnector};
pub use ffi::{Api, resolve_library_path};
pub use stream::Stream;
pub use txc_core::LogLevel;
