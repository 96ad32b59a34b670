//! Logical cluster time, exchanged with servers to support causally
//! consistent reads across operations.
use bson::{doc, Bson, Document, Timestamp};
use derive_more::Constructor;
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// A `$clusterTime` value as gossiped by servers: a logical timestamp plus
/// the signature servers use to validate it. The signature is carried
/// verbatim and never inspected by the driver.
#[derive(Debug, Clone, Constructor, PartialEq)]
pub struct ClusterTime {
    timestamp: Timestamp,
    signature: Document,
}

impl Eq for ClusterTime {}

impl ClusterTime {
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Renders the `$clusterTime` document shape expected on the wire.
    pub fn to_document(&self) -> Document {
        doc! {
            "clusterTime": self.timestamp,
            "signature": self.signature.clone(),
        }
    }

    /// Parses a `$clusterTime` document received from a server.
    pub fn from_document(document: &Document) -> Result<ClusterTime> {
        let timestamp = match document.get("clusterTime") {
            Some(Bson::Timestamp(timestamp)) => *timestamp,
            _ => {
                return Err(Error::General(
                    "$clusterTime is missing the clusterTime timestamp".into(),
                ))
            }
        };

        let signature = match document.get("signature") {
            Some(Bson::Document(signature)) => signature.clone(),
            None => Document::new(),
            _ => return Err(Error::General("$clusterTime signature is not a document".into())),
        };

        Ok(ClusterTime {
            timestamp,
            signature,
        })
    }
}

impl PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp.time, self.timestamp.increment)
            .cmp(&(other.timestamp.time, other.timestamp.increment))
    }
}

/// Advances `current` to `incoming` only when `incoming` is strictly later.
/// The merge is idempotent - replaying the same time is a no-op.
pub fn merge(current: &mut Option<ClusterTime>, incoming: &ClusterTime) {
    match current {
        Some(time) if *incoming <= *time => {}
        _ => *current = Some(incoming.clone()),
    }
}

/// Returns the later of two optional cluster times.
pub fn later_of<'a>(
    left: Option<&'a ClusterTime>,
    right: Option<&'a ClusterTime>,
) -> Option<&'a ClusterTime> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.max(right)),
        (Some(left), None) => Some(left),
        (None, right) => right,
    }
}
