use std::io;
use std::result;
use thiserror::Error as ThisError;

use crate::ServerId;

pub type Result<T> = result::Result<T, Error>;

/// Driver error type. Errors come in two flavors - those reported by a server
/// via a command reply (`Server`) and those raised inside the driver itself
/// (connectivity, framing, selection, authentication). The distinction
/// matters for connection lifecycle: network and protocol errors poison the
/// underlying connection, while server-reported command failures do not.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Internal IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Connect, send or receive failure, including timeouts. The affected
    /// node must be considered unusable.
    #[error("Network error talking to {address}: {message}")]
    Network { address: String, message: String },
    /// No topology member matched the request within the selection deadline.
    #[error("Server selection failed: {0}")]
    ServerSelection(String),
    /// The authentication handshake was rejected or malformed.
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },
    /// No live connection for the server id, and the caller forbade
    /// reconnecting.
    #[error("Not connected to server {0}")]
    NotConnected(ServerId),
    /// Malformed or unexpected reply shape; stream framing may be
    /// desynchronized, so the node must be dropped.
    #[error("Protocol error from {address}: {message}")]
    Protocol { address: String, message: String },
    /// Command failure reported by the server in an otherwise well-formed
    /// reply.
    #[error("Server error {code} ({code_name}): {message}")]
    Server {
        code: i32,
        code_name: String,
        message: String,
    },
    /// BSON encoding failure.
    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),
    /// BSON decoding failure.
    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),
    /// General error.
    #[error("General error: {0}")]
    General(String),
}

impl Error {
    /// Checks whether the error stems from transport-level I/O. Such errors
    /// always invalidate the node they occurred on.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Network { .. })
    }

    /// Checks whether the error leaves the connection in an indeterminate
    /// read position and therefore requires dropping the node.
    pub fn invalidates_node(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Network { .. } | Error::Protocol { .. }
        )
    }
}

impl From<String> for Error {
    fn from(err: String) -> Error {
        Error::General(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Error {
        Error::General(err.to_string())
    }
}
