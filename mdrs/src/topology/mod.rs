//! Topology data model. An external monitor discovers servers and publishes
//! immutable [`TopologyDescription`] snapshots through a [`TopologyHandle`];
//! the cluster only ever reads them. Server ids are assigned by the monitor
//! and stay stable for the lifetime of a server entry.
use arc_swap::ArcSwap;
use derive_more::Display;
use fxhash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mongo_protocol::cluster_time::ClusterTime;
use mongo_protocol::read_preference::TagSet;
use mongo_protocol::ServerId;

mod server_selection;

pub use server_selection::{select_for_reads, select_for_writes};

/// Shape of the deployment as a whole.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Default)]
pub enum TopologyType {
    Single,
    ReplicaSetWithPrimary,
    ReplicaSetNoPrimary,
    Sharded,
    #[default]
    Unknown,
}

/// Role of one server within the deployment.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Default)]
pub enum ServerType {
    Standalone,
    RsPrimary,
    RsSecondary,
    Mongos,
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether the server accepts writes.
    #[inline]
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ServerType::Standalone | ServerType::RsPrimary | ServerType::Mongos
        )
    }

    /// Whether the server holds data at all.
    #[inline]
    pub fn is_data_bearing(&self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// Monitor-observed state of one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    id: ServerId,
    address: String,
    server_type: ServerType,
    tags: TagSet,
    round_trip_time: Option<Duration>,
    min_wire_version: i32,
    max_wire_version: i32,
    last_updated: Instant,
}

impl ServerDescription {
    pub fn new(id: ServerId, address: String, server_type: ServerType) -> Self {
        ServerDescription {
            id,
            address,
            server_type,
            tags: TagSet::default(),
            round_trip_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            last_updated: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_round_trip_time(mut self, round_trip_time: Duration) -> Self {
        self.round_trip_time = Some(round_trip_time);
        self
    }

    #[must_use]
    pub fn with_wire_versions(mut self, min: i32, max: i32) -> Self {
        self.min_wire_version = min;
        self.max_wire_version = max;
        self
    }

    #[inline]
    pub fn id(&self) -> ServerId {
        self.id
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    #[inline]
    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    #[inline]
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    #[inline]
    pub fn min_wire_version(&self) -> i32 {
        self.min_wire_version
    }

    #[inline]
    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    /// Age of this observation.
    #[inline]
    pub fn staleness(&self) -> Duration {
        self.last_updated.elapsed()
    }

    /// Whether every pair of `tag_set` is present in this server's tags.
    pub fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}

/// One immutable snapshot of the whole deployment.
#[derive(Debug, Clone, Default)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    servers: FxHashMap<ServerId, ServerDescription>,
    cluster_time: Option<ClusterTime>,
}

impl TopologyDescription {
    pub fn new(topology_type: TopologyType) -> Self {
        TopologyDescription {
            topology_type,
            servers: Default::default(),
            cluster_time: None,
        }
    }

    #[must_use]
    pub fn with_server(mut self, server: ServerDescription) -> Self {
        self.servers.insert(server.id(), server);
        self
    }

    #[must_use]
    pub fn with_cluster_time(mut self, cluster_time: ClusterTime) -> Self {
        self.cluster_time = Some(cluster_time);
        self
    }

    #[inline]
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    #[inline]
    pub fn server(&self, id: ServerId) -> Option<&ServerDescription> {
        self.servers.get(&id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    #[inline]
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }
}

/// Shared handle to the latest topology snapshot. The monitor publishes,
/// everyone else snapshots; swaps are lock-free.
#[derive(Debug, Clone, Default)]
pub struct TopologyHandle {
    inner: Arc<ArcSwap<TopologyDescription>>,
}

impl TopologyHandle {
    pub fn new(topology: TopologyDescription) -> Self {
        TopologyHandle {
            inner: Arc::new(ArcSwap::from_pointee(topology)),
        }
    }

    /// Current snapshot; cheap, does not block publishers.
    #[inline]
    pub fn snapshot(&self) -> Arc<TopologyDescription> {
        self.inner.load_full()
    }

    /// Replaces the snapshot. Called by the external monitor.
    pub fn publish(&self, topology: TopologyDescription) {
        self.inner.store(Arc::new(topology));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_publishes_new_snapshots() {
        let handle = TopologyHandle::default();
        assert_eq!(handle.snapshot().topology_type(), TopologyType::Unknown);

        handle.publish(
            TopologyDescription::new(TopologyType::Single)
                .with_server(ServerDescription::new(1, "db:27017".into(), ServerType::Standalone)),
        );

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.topology_type(), TopologyType::Single);
        assert_eq!(snapshot.server(1).map(ServerDescription::id), Some(1));
    }

    #[test]
    fn tag_matching_requires_every_pair() {
        let tags: TagSet = [("dc".to_string(), "east".to_string())].into_iter().collect();
        let server = ServerDescription::new(1, "db:27017".into(), ServerType::RsSecondary)
            .with_tags(tags.clone());

        assert!(server.matches_tag_set(&tags));
        assert!(server.matches_tag_set(&TagSet::default()));

        let mismatched: TagSet = [
            ("dc".to_string(), "east".to_string()),
            ("rack".to_string(), "a".to_string()),
        ]
        .into_iter()
        .collect();
        assert!(!server.matches_tag_set(&mismatched));
    }
}
