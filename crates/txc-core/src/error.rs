//! Typed errors for everything that talks to the connector library.
//!
//! [`TxcError`] separates failures reported by the connector itself
//! (`InvalidCommand`, `Connector`) from local ones (loading, arguments, I/O),
//! so the proxy can forward the former to clients verbatim.

use thiserror::Error;

/// Errors produced while loading or driving the connector.
#[derive(Debug, Error)]
pub enum TxcError {
    /// The library could not be loaded or a mandatory export is missing.
    #[error("library load error: {0}")]
    Load(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Argument rejected before reaching the connector (interior NUL, missing
    /// log directory, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `<result success="false">` reply: the connector refused the command.
    /// Holds the full reply text.
    #[error("{0}")]
    InvalidCommand(String),

    /// `<error>` reply or error text from a lifecycle call.
    #[error("{0}")]
    Connector(String),

    /// A call that must return a buffer returned NULL.
    #[error("{0} returned a null pointer")]
    NullReply(&'static str),

    /// Reply that fits none of the known envelopes.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TxcError {
    /// Reply text produced by the connector itself, relayed to proxy
    /// clients as is.
    pub fn connector_text(&self) -> Option<&str> {
        match self {
            TxcError::InvalidCommand(text)
            | TxcError::Connector(text)
            | TxcError::UnexpectedResponse(text) => Some(text),
            _ => None,
        }
    }
}

pub type Result<T, E = TxcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_replies_display_verbatim() {
        let xml = "<error>Wrong XML</error>";
        assert_eq!(TxcError::Connector(xml.into()).to_string(), xml);
        assert_eq!(TxcError::InvalidCommand(xml.into()).connector_text(), Some(xml));
        let odd = TxcError::UnexpectedResponse("<x/>".into());
        assert_eq!(odd.to_string(), "unexpected response: <x/>");
        assert_eq!(odd.connector_text(), Some("<x/>"));
        assert_eq!(TxcError::InvalidArgument("x".into()).connector_text(), None);
        let null = TxcError::NullReply("SendCommand");
        assert_eq!(null.to_string(), "SendCommand returned a null pointer");
        assert_eq!(null.connector_text(), None);
    }
}
