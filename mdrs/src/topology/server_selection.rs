//! Server selection over one topology snapshot. Selection is pure: it never
//! touches the node table, so a failed attempt has no side effects and the
//! cluster is free to re-snapshot and retry until its selection deadline.
use itertools::Itertools;
use std::time::Duration;

use mongo_protocol::read_preference::{ReadMode, ReadPreference, TagSet};
use mongo_protocol::{Error, Result, ServerId};

use super::{ServerDescription, ServerType, TopologyDescription, TopologyType};

/// Picks a server for a write. A session pin wins outright, but a pin to a
/// server that cannot take writes is a selection error, not a silent
/// redirect.
pub fn select_for_writes(
    topology: &TopologyDescription,
    pin: Option<ServerId>,
) -> Result<ServerId> {
    if let Some(id) = pin {
        let server = topology
            .server(id)
            .ok_or_else(|| pin_error(id, "is no longer known"))?;
        if !server.server_type().is_writable() {
            return Err(pin_error(id, "cannot take writes"));
        }
        return Ok(id);
    }

    nearest(topology.servers().filter(|server| server.server_type().is_writable()))
        .ok_or_else(|| Error::ServerSelection("No writable server available".into()))
}

/// Picks a server for a read under `read_preference`. A session pin wins
/// outright when the pinned server is still known.
pub fn select_for_reads(
    topology: &TopologyDescription,
    read_preference: &ReadPreference,
    pin: Option<ServerId>,
) -> Result<ServerId> {
    if let Some(id) = pin {
        return topology
            .server(id)
            .map(ServerDescription::id)
            .ok_or_else(|| pin_error(id, "is no longer known"));
    }

    if read_preference.mode() == ReadMode::Primary && !read_preference.tag_sets().is_empty() {
        return Err(Error::ServerSelection(
            "Tag sets cannot be combined with primary read preference".into(),
        ));
    }

    // Mongos applies the read preference itself; single deployments have
    // nothing to choose between.
    if matches!(
        topology.topology_type(),
        TopologyType::Sharded | TopologyType::Single
    ) {
        return nearest(topology.servers().filter(|server| server.server_type().is_data_bearing()))
            .ok_or_else(|| Error::ServerSelection("No server available".into()));
    }

    let primary = topology
        .servers()
        .find(|server| server.server_type() == ServerType::RsPrimary);

    let selected = match read_preference.mode() {
        ReadMode::Primary => primary.map(ServerDescription::id),
        ReadMode::PrimaryPreferred => primary
            .map(ServerDescription::id)
            .or_else(|| eligible_secondary(topology, read_preference)),
        ReadMode::Secondary => eligible_secondary(topology, read_preference),
        ReadMode::SecondaryPreferred => eligible_secondary(topology, read_preference)
            .or_else(|| primary.map(ServerDescription::id)),
        ReadMode::Nearest => {
            let candidates = topology
                .servers()
                .filter(|server| server.server_type().is_data_bearing())
                .filter(|server| fresh_enough(server, read_preference.max_staleness()))
                .collect::<Vec<_>>();
            first_matching_tag_set(&candidates, read_preference.tag_sets())
        }
    };

    selected.ok_or_else(|| {
        Error::ServerSelection(format!(
            "No server matches read preference {}",
            read_preference.mode()
        ))
    })
}

fn eligible_secondary(
    topology: &TopologyDescription,
    read_preference: &ReadPreference,
) -> Option<ServerId> {
    let candidates = topology
        .servers()
        .filter(|server| server.server_type() == ServerType::RsSecondary)
        .filter(|server| fresh_enough(server, read_preference.max_staleness()))
        .collect::<Vec<_>>();

    first_matching_tag_set(&candidates, read_preference.tag_sets())
}

/// Tag sets are ordered by preference: the first set with any matching
/// candidate decides, ties broken by round-trip time.
fn first_matching_tag_set(
    candidates: &[&ServerDescription],
    tag_sets: &[TagSet],
) -> Option<ServerId> {
    if tag_sets.is_empty() {
        return nearest(candidates.iter().copied());
    }

    tag_sets.iter().find_map(|tag_set| {
        nearest(
            candidates
                .iter()
                .copied()
                .filter(|server| server.matches_tag_set(tag_set)),
        )
    })
}

/// Staleness is estimated from the age of the monitor's last observation.
fn fresh_enough(server: &ServerDescription, max_staleness: Option<Duration>) -> bool {
    match max_staleness {
        Some(bound) => server.staleness() <= bound,
        None => true,
    }
}

fn nearest<'a>(candidates: impl Iterator<Item = &'a ServerDescription>) -> Option<ServerId> {
    candidates
        .sorted_by_key(|server| server.round_trip_time().unwrap_or(Duration::MAX))
        .map(ServerDescription::id)
        .next()
}

fn pin_error(id: ServerId, reason: &str) -> Error {
    Error::ServerSelection(format!("Pinned server {} {}", id, reason))
}
