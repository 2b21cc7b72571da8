//! Module: routing
//! Responsibility: consume the routing resolver and turn resolutions into
//! per-partition fragments of a requested range.
//! Does not own: topology persistence or caching; every call goes to the resolver.

use crate::{error::InternalError, range::PartitionRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

///
/// PartitionId
///

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PartitionId(pub String);

impl PartitionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

///
/// TopologyVersion
///
/// Resolver stamp of the routing map a fetch node was created from. A
/// differing stamp on resume means the node's range may have split or merged.
///

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct TopologyVersion(pub u64);

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

///
/// PartitionAssignment
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionAssignment {
    pub id: PartitionId,
    pub range: PartitionRange,
}

///
/// Resolution
///
/// Partitions overlapping one requested range, ordered by range start.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub version: TopologyVersion,
    pub partitions: Vec<PartitionAssignment>,
}

///
/// RoutingError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum RoutingError {
    #[error("routing map unavailable for {range}: {reason}")]
    Unavailable { range: String, reason: String },

    #[error(transparent)]
    Internal(#[from] InternalError),
}

///
/// RoutingResolver
///
/// Maps effective ranges to the partitions currently serving them. Shared
/// read-mostly across every fetch node of every pipeline.
///

#[async_trait]
pub trait RoutingResolver: Send + Sync {
    async fn resolve(&self, range: &PartitionRange) -> Result<Resolution, RoutingError>;

    /// Invalidate whatever the resolver holds for `range`; the next
    /// `resolve` must observe current topology.
    async fn force_refresh(&self, range: &PartitionRange) -> Result<(), RoutingError>;
}

///
/// Fragment
///
/// One partition tagged with the part of the requested range it serves.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub partition: PartitionId,
    pub range: PartitionRange,
}

///
/// Fragments
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragments {
    pub version: TopologyVersion,
    pub fragments: Vec<Fragment>,
}

/// Resolve `range` and fan it out into per-partition fragments.
pub async fn resolve_fragments(
    resolver: &dyn RoutingResolver,
    range: &PartitionRange,
) -> Result<Fragments, RoutingError> {
    let resolution = resolver.resolve(range).await?;

    fragments_of(&resolution, range)
}

/// Force-refresh, then resolve `range` into fragments.
pub async fn refresh_fragments(
    resolver: &dyn RoutingResolver,
    range: &PartitionRange,
) -> Result<Fragments, RoutingError> {
    resolver.force_refresh(range).await?;
    let fragments = resolve_fragments(resolver, range).await?;

    tracing::info!(
        range = %range,
        version = %fragments.version,
        partitions = fragments.fragments.len(),
        "routing refreshed"
    );

    Ok(fragments)
}

// Intersect each assignment with the requested range; assignments that do
// not overlap are dropped, overlapping fragments are a resolver bug.
fn fragments_of(
    resolution: &Resolution,
    range: &PartitionRange,
) -> Result<Fragments, RoutingError> {
    let mut fragments: Vec<Fragment> = resolution
        .partitions
        .iter()
        .filter_map(|assignment| {
            assignment.range.intersection(range).map(|fragment| Fragment {
                partition: assignment.id.clone(),
                range: fragment,
            })
        })
        .collect();
    fragments.sort_by(|a, b| a.range.cmp_start(&b.range));

    for pair in fragments.windows(2) {
        if pair[0].range.overlaps(&pair[1].range) {
            return Err(InternalError::routing_invariant(format!(
                "resolver returned overlapping partitions {} {} and {} {}",
                pair[0].partition, pair[0].range, pair[1].partition, pair[1].range
            ))
            .into());
        }
    }

    Ok(Fragments {
        version: resolution.version,
        fragments,
    })
}

///
/// TESTS
///
