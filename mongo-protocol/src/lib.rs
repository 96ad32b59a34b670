//! Wire-level building blocks for a MongoDB driver: message framing
//! (`OP_MSG` and the legacy opcodes), the shared error type, cluster time,
//! read preference and the SCRAM challenge/response machinery.
//!
//! Nothing in this crate performs I/O; everything operates on byte buffers
//! and BSON documents so it can be driven by any transport.

pub mod cluster_time;
pub mod error;
pub mod message;
pub mod read_preference;
pub mod scram;

pub use error::{Error, Result};

/// Opaque identifier of one topology member, assigned by the topology
/// monitor. Ids are never reused within one client's lifetime.
pub type ServerId = u32;
