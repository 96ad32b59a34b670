//! Command assembly: turns a caller-supplied command body plus execution
//! context into the exact wire-ready document. All commands funnel through
//! here, so session stamping and read-preference attachment happen in one
//! place.
use bson::Document;

use mongo_protocol::cluster_time::{self, ClusterTime};
use mongo_protocol::read_preference::ReadPreference;

use crate::cluster::session::ClientSession;
use crate::topology::{ServerType, TopologyType};

/// The pieces of one command before assembly.
#[derive(Debug, Clone)]
pub struct CommandParts {
    db: String,
    body: Document,
    read_preference: Option<ReadPreference>,
    write_concern: Option<Document>,
}

impl CommandParts {
    pub fn new(db: impl Into<String>, body: Document) -> Self {
        CommandParts {
            db: db.into(),
            body,
            read_preference: None,
            write_concern: None,
        }
    }

    #[must_use]
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    #[must_use]
    pub fn with_write_concern(mut self, write_concern: Document) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    #[inline]
    pub fn db(&self) -> &str {
        &self.db
    }

    #[inline]
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    /// First key of the body, which names the command on the wire.
    pub fn command_name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or("")
    }

    /// Produces the wire-ready body for one execution target.
    pub(crate) fn assemble(
        &self,
        topology_type: TopologyType,
        server_type: ServerType,
        session: Option<&ClientSession>,
        stream_cluster_time: Option<&ClusterTime>,
    ) -> Document {
        let mut body = self.body.clone();
        body.insert("$db", self.db.clone());

        if let Some(read_preference) = &self.read_preference {
            if !read_preference.is_primary()
                && needs_read_preference(topology_type, server_type)
                && !body.contains_key("$readPreference")
            {
                body.insert("$readPreference", read_preference.to_document());
            }
        }

        if let Some(write_concern) = &self.write_concern {
            if !body.contains_key("writeConcern") {
                body.insert("writeConcern", write_concern.clone());
            }
        }

        if let Some(session) = session {
            body.insert("lsid", session.lsid());
        }

        let session_time = session.and_then(ClientSession::cluster_time);
        if let Some(time) = cluster_time::later_of(session_time, stream_cluster_time) {
            body.insert("$clusterTime", time.to_document());
        }

        body
    }
}

/// Mongos applies forwarded read preferences; replica set members only need
/// one when addressed directly as secondaries.
fn needs_read_preference(topology_type: TopologyType, server_type: ServerType) -> bool {
    topology_type == TopologyType::Sharded || server_type == ServerType::RsSecondary
}
