//! Blocking transport boundary. A [`Transport`] moves whole wire messages;
//! a [`ConnectionManager`] opens transports. Everything above this module is
//! written against the traits, so tests script transports without sockets.
use bytes::{Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

use mongo_protocol::message::{DEFAULT_MAX_MSG_SIZE, HEADER_LEN};
use mongo_protocol::{Error, Result};

/// One established, message-oriented connection.
pub trait Transport {
    /// Writes the segments as one message. The segments are a scatter/gather
    /// view of a single frame.
    fn send(&mut self, segments: &[Bytes], deadline: Option<Instant>) -> Result<()>;

    /// Reads exactly one whole wire message, header included.
    fn receive(&mut self, deadline: Option<Instant>) -> Result<Bytes>;

    fn peer_address(&self) -> &str;
}

/// Opens transports to servers.
pub trait ConnectionManager {
    fn connect(&self, address: &str, deadline: Option<Instant>) -> Result<Box<dyn Transport>>;
}

/// Remaining time until `deadline`; an already-elapsed deadline is a network
/// timeout before any I/O happens.
pub(crate) fn deadline_timeout(
    deadline: Option<Instant>,
    address: &str,
) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                Err(network_error(address, "operation timed out"))
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

pub(crate) fn network_error(address: &str, message: impl ToString) -> Error {
    Error::Network {
        address: address.to_string(),
        message: message.to_string(),
    }
}

fn read_frame(stream: &mut impl Read, address: &str) -> Result<Bytes> {
    let mut length_bytes = [0u8; 4];
    stream
        .read_exact(&mut length_bytes)
        .map_err(|error| network_error(address, error))?;

    let length = i32::from_le_bytes(length_bytes);
    if length < HEADER_LEN as i32 || length > DEFAULT_MAX_MSG_SIZE {
        return Err(Error::Protocol {
            address: address.to_string(),
            message: format!("Frame length {} outside protocol bounds", length),
        });
    }

    let mut frame = BytesMut::zeroed(length as usize);
    frame[0..4].copy_from_slice(&length_bytes);
    stream
        .read_exact(&mut frame[4..])
        .map_err(|error| network_error(address, error))?;

    Ok(frame.freeze())
}

fn write_segments(stream: &mut impl Write, segments: &[Bytes], address: &str) -> Result<()> {
    for segment in segments {
        stream
            .write_all(segment)
            .map_err(|error| network_error(address, error))?;
    }
    stream.flush().map_err(|error| network_error(address, error))
}

/// Plain TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    address: String,
}

impl TcpTransport {
    fn apply_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let timeout = deadline_timeout(deadline, &self.address)?;
        self.stream
            .set_read_timeout(timeout)
            .map_err(|error| network_error(&self.address, error))?;
        self.stream
            .set_write_timeout(timeout)
            .map_err(|error| network_error(&self.address, error))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, segments: &[Bytes], deadline: Option<Instant>) -> Result<()> {
        self.apply_deadline(deadline)?;
        write_segments(&mut self.stream, segments, &self.address)
    }

    fn receive(&mut self, deadline: Option<Instant>) -> Result<Bytes> {
        self.apply_deadline(deadline)?;
        read_frame(&mut self.stream, &self.address)
    }

    fn peer_address(&self) -> &str {
        &self.address
    }
}

/// Opens plain TCP connections with `TCP_NODELAY` set.
#[derive(Debug, Default, Copy, Clone)]
pub struct TcpConnectionManager;

fn open_tcp_stream(address: &str, deadline: Option<Instant>) -> Result<TcpStream> {
    let socket_addr = address
        .to_socket_addrs()
        .map_err(|error| network_error(address, error))?
        .next()
        .ok_or_else(|| network_error(address, "address resolved to nothing"))?;

    let stream = match deadline_timeout(deadline, address)? {
        Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
        None => TcpStream::connect(socket_addr),
    }
    .map_err(|error| network_error(address, error))?;

    stream
        .set_nodelay(true)
        .map_err(|error| network_error(address, error))?;

    debug!(%address, "Connected");
    Ok(stream)
}

impl ConnectionManager for TcpConnectionManager {
    fn connect(&self, address: &str, deadline: Option<Instant>) -> Result<Box<dyn Transport>> {
        let stream = open_tcp_stream(address, deadline)?;
        Ok(Box::new(TcpTransport {
            stream,
            address: address.to_string(),
        }))
    }
}

#[cfg(feature = "rust-tls")]
pub use self::tls::RustlsConnectionManager;

#[cfg(feature = "rust-tls")]
mod tls {
    use super::*;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConnection, StreamOwned};
    use std::sync::Arc;

    /// TLS transport over rustls' synchronous stream adapter.
    pub struct RustlsTransport {
        stream: StreamOwned<ClientConnection, TcpStream>,
        address: String,
    }

    impl RustlsTransport {
        fn apply_deadline(&self, deadline: Option<Instant>) -> Result<()> {
            let timeout = deadline_timeout(deadline, &self.address)?;
            self.stream
                .sock
                .set_read_timeout(timeout)
                .map_err(|error| network_error(&self.address, error))?;
            self.stream
                .sock
                .set_write_timeout(timeout)
                .map_err(|error| network_error(&self.address, error))
        }
    }

    impl Transport for RustlsTransport {
        fn send(&mut self, segments: &[Bytes], deadline: Option<Instant>) -> Result<()> {
            self.apply_deadline(deadline)?;
            write_segments(&mut self.stream, segments, &self.address)
        }

        fn receive(&mut self, deadline: Option<Instant>) -> Result<Bytes> {
            self.apply_deadline(deadline)?;
            read_frame(&mut self.stream, &self.address)
        }

        fn peer_address(&self) -> &str {
            &self.address
        }
    }

    /// Opens TLS connections from a prepared rustls client configuration.
    #[derive(Clone)]
    pub struct RustlsConnectionManager {
        config: Arc<rustls::ClientConfig>,
    }

    impl RustlsConnectionManager {
        pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
            RustlsConnectionManager { config }
        }
    }

    impl ConnectionManager for RustlsConnectionManager {
        fn connect(&self, address: &str, deadline: Option<Instant>) -> Result<Box<dyn Transport>> {
            let stream = open_tcp_stream(address, deadline)?;

            let host = address.split(':').next().unwrap_or(address);
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|error| network_error(address, error))?;

            let connection = ClientConnection::new(self.config.clone(), server_name)
                .map_err(|error| network_error(address, error))?;

            Ok(Box::new(RustlsTransport {
                stream: StreamOwned::new(connection, stream),
                address: address.to_string(),
            }))
        }
    }
}
