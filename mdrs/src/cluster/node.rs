//! A connected node: one owned transport plus the parameters negotiated for
//! it at handshake time.
use std::time::{Duration, Instant};

use crate::cluster::wire::HelloReply;
use crate::transport::Transport;

/// Connection parameters negotiated during the `hello` handshake. The wire
/// version range is retained for callers sitting above command execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_bson_obj_size: i32,
    pub max_msg_size: i32,
    pub max_write_batch_size: i32,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl ConnectionLimits {
    pub(crate) fn from_hello(hello: &HelloReply) -> Self {
        ConnectionLimits {
            max_bson_obj_size: hello.max_bson_obj_size,
            max_msg_size: hello.max_msg_size,
            max_write_batch_size: hello.max_write_batch_size,
            min_wire_version: hello.min_wire_version,
            max_wire_version: hello.max_wire_version,
        }
    }
}

/// One live entry of the node table.
pub(crate) struct Node {
    transport: Box<dyn Transport>,
    address: String,
    generation: u32,
    limits: ConnectionLimits,
    last_used: Instant,
}

impl Node {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        address: String,
        generation: u32,
        limits: ConnectionLimits,
    ) -> Self {
        Node {
            transport,
            address,
            generation,
            limits,
            last_used: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }

    #[inline]
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub(crate) fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Time since the connection last carried traffic.
    #[inline]
    pub(crate) fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Marks the connection as just used.
    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}
