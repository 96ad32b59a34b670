//! Client sessions: the causal-consistency state threaded through command
//! execution. Sessions are plain data here; lifecycle commands
//! (`startSession`/`endSessions`) belong to the layer above.
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document, Timestamp};
use uuid::Uuid;

use mongo_protocol::cluster_time::{self, ClusterTime};
use mongo_protocol::ServerId;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    id: Uuid,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    pinned_server: Option<ServerId>,
}

impl ClientSession {
    pub fn new() -> Self {
        ClientSession {
            id: Uuid::new_v4(),
            cluster_time: None,
            operation_time: None,
            pinned_server: None,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The `lsid` document attached to commands run under this session.
    pub fn lsid(&self) -> Document {
        doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: self.id.as_bytes().to_vec(),
            }
        }
    }

    #[inline]
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Idempotent merge: the session only moves forward in cluster time.
    pub fn advance_cluster_time(&mut self, incoming: &ClusterTime) {
        cluster_time::merge(&mut self.cluster_time, incoming);
    }

    #[inline]
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    pub fn advance_operation_time(&mut self, incoming: Timestamp) {
        let later = match self.operation_time {
            Some(current) => {
                (incoming.time, incoming.increment) > (current.time, current.increment)
            }
            None => true,
        };
        if later {
            self.operation_time = Some(incoming);
        }
    }

    /// Pins subsequent selection to one server, as transactions on sharded
    /// deployments require.
    pub fn pin(&mut self, server_id: ServerId) {
        self.pinned_server = Some(server_id);
    }

    pub fn unpin(&mut self) {
        self.pinned_server = None;
    }

    #[inline]
    pub fn pinned_server(&self) -> Option<ServerId> {
        self.pinned_server
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
