//! Module: fetch
//! Responsibility: the per-partition transport contract and the fetch node
//! that drives it one page at a time.
//! Does not own: wire (de)serialization of partition responses.

mod node;


use crate::{range::PartitionRange, routing::PartitionId, row::Row};
use async_trait::async_trait;
use std::{fmt, time::Duration};
use thiserror::Error as ThisError;

// re-exports
pub use node::{FetchPhase, FetchState};
pub(crate) use node::{FetchPull, FetchScope, NodeFailure, PartitionFetchStage};

///
/// FetchRequest
///
/// One page request against one partition, scoped to the range fragment
/// the requesting node serves.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FetchRequest {
    pub partition: PartitionId,
    pub range: PartitionRange,
    pub cursor: Option<String>,
    pub page_size: u32,
    pub query: String,
}

///
/// FetchResponse
///
/// Rows must arrive sorted by the query's order (row id last). A missing
/// `cursor` marks the end of the partition.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchResponse {
    pub rows: Vec<Row>,
    pub cursor: Option<String>,
}

///
/// FetchErrorKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchErrorKind {
    Throttled,
    StaleRouting,
    PartitionGone,
    CursorRejected,
    Malformed,
    Unauthorized,
    Internal,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Throttled => "throttled",
            Self::StaleRouting => "stale_routing",
            Self::PartitionGone => "partition_gone",
            Self::CursorRejected => "cursor_rejected",
            Self::Malformed => "malformed",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

///
/// FetchError
///
/// Transport-reported failure of one fetch request.
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,

    /// Server-suggested delay before retrying, for throttling.
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FetchErrorKind::Throttled,
            message: "request rate too large".to_string(),
            retry_after,
        }
    }
}

///
/// PartitionFetcher
///
/// Transport collaborator: executes one page request against one partition.
///

#[async_trait]
pub trait PartitionFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}
