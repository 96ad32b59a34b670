//! **mdrs** is a synchronous MongoDB-wire cluster connection core: the node
//! table, server selection, connect-time handshake and authentication, and
//! the single command-execution choke point a higher-level driver builds on.
//!
//! The [`Cluster`](crate::cluster::Cluster) owns one blocking connection per
//! selected server and is intended to be driven from a single thread. Server
//! discovery lives elsewhere; an external monitor publishes topology
//! snapshots through a [`TopologyHandle`](crate::topology::TopologyHandle)
//! and the cluster only ever reads them.
//!
//! ```no_run
//! use mdrs::cluster::{Cluster, CommandParts};
//! use mdrs::config::ClientConfigBuilder;
//! use mdrs::topology::TopologyHandle;
//! use mdrs::transport::TcpConnectionManager;
//! use bson::doc;
//!
//! let config = ClientConfigBuilder::new()
//!     .with_app_name("example".into())
//!     .build();
//! let topology = TopologyHandle::default();
//! let mut cluster = Cluster::new(config, topology, Box::new(TcpConnectionManager));
//!
//! let stream = cluster.stream_for_writes(None).unwrap();
//! let parts = CommandParts::new("app", doc! { "ping": 1 });
//! let reply = cluster.run_command_monitored(&stream, parts, None).unwrap();
//! assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
//! ```

pub mod auth;
pub mod cluster;
pub mod config;
pub mod monitoring;
pub mod tls;
pub mod topology;
pub mod transport;

pub use mongo_protocol::cluster_time;
pub use mongo_protocol::error;
pub use mongo_protocol::message;
pub use mongo_protocol::read_preference;
pub use mongo_protocol::scram;
pub use mongo_protocol::{Error, Result, ServerId};
