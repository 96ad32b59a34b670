//! A server stream: the handle a caller holds while running commands
//! against one selected server. It snapshots everything selection decided -
//! topology type, server description, cluster time - and carries the
//! generation tag that lets the cluster detect staleness after
//! invalidation. Release is `Drop`; the connection itself stays in the node
//! table.
use mongo_protocol::cluster_time::ClusterTime;
use mongo_protocol::ServerId;

use crate::cluster::node::ConnectionLimits;
use crate::topology::{ServerDescription, TopologyType};

#[derive(Debug, Clone)]
pub struct ServerStream {
    topology_type: TopologyType,
    server_description: ServerDescription,
    cluster_time: Option<ClusterTime>,
    server_id: ServerId,
    generation: u32,
    limits: ConnectionLimits,
}

impl ServerStream {
    pub(crate) fn new(
        topology_type: TopologyType,
        server_description: ServerDescription,
        cluster_time: Option<ClusterTime>,
        generation: u32,
        limits: ConnectionLimits,
    ) -> Self {
        ServerStream {
            topology_type,
            server_id: server_description.id(),
            server_description,
            cluster_time,
            generation,
            limits,
        }
    }

    #[inline]
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    #[inline]
    pub fn server_description(&self) -> &ServerDescription {
        &self.server_description
    }

    #[inline]
    pub fn address(&self) -> &str {
        self.server_description.address()
    }

    /// Cluster time as of stream creation.
    #[inline]
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    #[inline]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn max_bson_obj_size(&self) -> i32 {
        self.limits.max_bson_obj_size
    }

    #[inline]
    pub fn max_msg_size(&self) -> i32 {
        self.limits.max_msg_size
    }

    #[inline]
    pub fn max_write_batch_size(&self) -> i32 {
        self.limits.max_write_batch_size
    }
}
