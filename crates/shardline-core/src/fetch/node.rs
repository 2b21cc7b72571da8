use crate::{
    cancel::CancelSignal,
    config::PipelineConfig,
    failure::{AbortCause, FailureClassifier, RecoveryAction},
    fetch::{FetchError, FetchRequest, FetchResponse, PartitionFetcher},
    range::PartitionRange,
    routing::{Fragment, Fragments, PartitionId, TopologyVersion},
    row::{OrderSpec, Row, RowKey},
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

///
/// FetchPhase
///
/// Observable lifecycle of one fetch node.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchPhase {
    NotStarted,
    Fetching,
    HasPage,
    Exhausted,
    Failed,
}

///
/// FetchState
///
/// Resumable position of one fetch node. `boundary` is the key of the
/// last row handed to the parent; while `replay` is set the node is
/// re-reading its range from the start and drops rows up to it.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FetchState {
    pub partition: PartitionId,
    pub range: PartitionRange,
    pub topology: TopologyVersion,
    pub cursor: Option<String>,
    pub boundary: Option<RowKey>,
    pub replay: bool,
    pub started: bool,
    pub exhausted: bool,
}

impl FetchState {
    #[must_use]
    pub const fn new(
        partition: PartitionId,
        range: PartitionRange,
        topology: TopologyVersion,
    ) -> Self {
        Self {
            partition,
            range,
            topology,
            cursor: None,
            boundary: None,
            replay: false,
            started: false,
            exhausted: false,
        }
    }

    /// States for the partitions now serving this node's range. Each
    /// successor resumes where this node stopped: the cursor is carried
    /// over when the server still honours it, and the boundary filters
    /// anything already delivered when it does not.
    #[must_use]
    pub fn successors(&self, fragments: &Fragments) -> Vec<Self> {
        fragments
            .fragments
            .iter()
            .map(|Fragment { partition, range }| Self {
                partition: partition.clone(),
                range: range.clone(),
                topology: fragments.version,
                cursor: self.cursor.clone(),
                boundary: self.boundary.clone(),
                replay: self.replay,
                started: self.started,
                exhausted: false,
            })
            .collect()
    }
}

///
/// FetchScope
///
/// Per-query inputs every fetch node of one merge shares.
///

#[derive(Clone, Copy)]
pub(crate) struct FetchScope<'a> {
    pub(crate) query: &'a str,
    pub(crate) order: &'a OrderSpec,
    pub(crate) fetcher: &'a dyn PartitionFetcher,
    pub(crate) config: &'a PipelineConfig,
    pub(crate) classifier: FailureClassifier,
    pub(crate) cancel: &'a CancelSignal,
}

///
/// FetchPull
///

#[derive(Debug)]
pub(crate) enum FetchPull {
    Page(Vec<Row>),
    Exhausted,
}

///
/// NodeFailure
///
/// Conditions a fetch node cannot recover from on its own.
///

#[derive(Debug)]
pub(crate) enum NodeFailure {
    Cancelled,

    /// The parent must refresh topology and replace this node.
    Topology { confirm_gone: bool, error: FetchError },

    Abort { cause: AbortCause, error: FetchError },
}

///
/// PartitionFetchStage
///
/// Leaf stage: pages through one partition's fragment of the query range.
///

#[derive(Debug)]
pub(crate) struct PartitionFetchStage {
    state: FetchState,
    phase: FetchPhase,
}

impl PartitionFetchStage {
    pub(crate) fn from_state(state: FetchState) -> Self {
        let phase = if state.exhausted {
            FetchPhase::Exhausted
        } else if state.started {
            FetchPhase::HasPage
        } else {
            FetchPhase::NotStarted
        };

        Self { state, phase }
    }

    pub(crate) const fn state(&self) -> &FetchState {
        &self.state
    }

    pub(crate) const fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub(crate) const fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    /// Mark the node finished without another request.
    pub(crate) const fn finish(&mut self) {
        self.state.exhausted = true;
        self.phase = FetchPhase::Exhausted;
    }

    /// Fetch the next non-empty page, or report exhaustion.
    pub(crate) async fn fetch_next(
        &mut self,
        scope: FetchScope<'_>,
    ) -> Result<FetchPull, NodeFailure> {
        let mut attempt = 0;

        loop {
            if self.state.exhausted {
                self.phase = FetchPhase::Exhausted;
                return Ok(FetchPull::Exhausted);
            }

            self.phase = FetchPhase::Fetching;
            let request = FetchRequest {
                partition: self.state.partition.clone(),
                range: self.state.range.clone(),
                cursor: self.state.cursor.clone(),
                page_size: scope.config.page_size.max(1),
                query: scope.query.to_string(),
            };
            tracing::debug!(
                partition = %request.partition,
                range = %request.range,
                resumed = request.cursor.is_some(),
                "partition fetch"
            );

            let Some(result) = scope.cancel.guard(scope.fetcher.fetch(request)).await else {
                return Err(NodeFailure::Cancelled);
            };

            let error = match result {
                Ok(response) => {
                    attempt = 0;
                    let rows = self.accept(response, scope.order);
                    if rows.is_empty() {
                        continue;
                    }
                    self.phase = FetchPhase::HasPage;

                    return Ok(FetchPull::Page(rows));
                }
                Err(error) => error,
            };

            attempt += 1;
            match scope.classifier.recovery(&error, attempt) {
                RecoveryAction::Retry { delay } => {
                    tracing::warn!(
                        partition = %self.state.partition,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "partition throttled, backing off"
                    );
                    if scope.cancel.guard(tokio::time::sleep(delay)).await.is_none() {
                        return Err(NodeFailure::Cancelled);
                    }
                }
                RecoveryAction::RestartFromRangeStart => {
                    tracing::info!(
                        partition = %self.state.partition,
                        range = %self.state.range,
                        "cursor rejected, replaying range"
                    );
                    self.state.cursor = None;
                    self.state.replay = self.state.boundary.is_some();
                }
                RecoveryAction::RefreshTopology { confirm_gone } => {
                    self.phase = FetchPhase::Failed;
                    return Err(NodeFailure::Topology {
                        confirm_gone,
                        error,
                    });
                }
                RecoveryAction::Abort { cause } => {
                    self.phase = FetchPhase::Failed;
                    return Err(NodeFailure::Abort { cause, error });
                }
            }
        }
    }

    // Advance the cursor past one response and return the rows the parent
    // has not seen yet.
    fn accept(&mut self, response: FetchResponse, order: &OrderSpec) -> Vec<Row> {
        let FetchResponse { mut rows, cursor } = response;
        self.state.started = true;

        if self.state.replay {
            if let Some(boundary) = &self.state.boundary {
                rows.retain(|row| {
                    order.compare_keys(&order.key_of(row), boundary) == Ordering::Greater
                });
            }
            if !rows.is_empty() {
                self.state.replay = false;
            }
        }
        if let Some(last) = rows.last() {
            self.state.boundary = Some(order.key_of(last));
        }

        self.state.exhausted = cursor.is_none();
        self.state.cursor = cursor;

        rows
    }
}
