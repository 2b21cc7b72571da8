//! Module: pipeline
//! Responsibility: compose stages into one lazily pulled operator tree,
//! commit a resumable snapshot after every page, and expose the caller
//! contract (`start`, `resume`, `pull_next`, `continuation`).
//! Does not own: partition transport, routing persistence, or token
//! framing (see `continuation`).

mod aggregate;
mod build;
mod distinct;
mod merge;
mod skip_take;
mod state;

#[cfg(test)]
mod tests;

use crate::{
    cancel::CancelSignal,
    config::PipelineConfig,
    continuation::{self, ContinuationError, ContinuationToken},
    error::InternalError,
    failure::{AbortCause, FailureClass, FailureClassifier},
    fetch::PartitionFetcher,
    plan::{PlanSignature, QueryPlan},
    range::PartitionRange,
    routing::{self, PartitionId, RoutingError, RoutingResolver},
    row::Row,
};
use async_trait::async_trait;
use derive_more::Deref;
use std::sync::Arc;
use thiserror::Error as ThisError;

// re-exports
pub use state::{DistinctSeen, MergeSlotState, MergeState, PipelineState, StageState};

///
/// Stage
///
/// One operator of the tree. A stage owns its input stage; `pull_next`
/// is its only suspension point and never yields an empty page.
///

#[async_trait]
pub(crate) trait Stage: Send {
    fn has_more_results(&self) -> bool;

    async fn pull_next(&mut self, cx: &PullContext<'_>) -> Result<Option<Vec<Row>>, PipelineError>;

    fn snapshot(&self) -> StageState;
}

///
/// PullContext
///
/// Collaborators lent to the stage tree for the duration of one pull.
///

pub(crate) struct PullContext<'a> {
    pub(crate) resolver: &'a dyn RoutingResolver,
    pub(crate) fetcher: &'a dyn PartitionFetcher,
    pub(crate) config: &'a PipelineConfig,
    pub(crate) classifier: FailureClassifier,
    pub(crate) cancel: &'a CancelSignal,
}

///
/// PipelineContext
///
/// Shared collaborators plus execution knobs. Cheap to clone; many
/// pipelines may share one resolver and one fetcher.
///

#[derive(Clone)]
pub struct PipelineContext {
    pub resolver: Arc<dyn RoutingResolver>,
    pub fetcher: Arc<dyn PartitionFetcher>,
    pub config: PipelineConfig,
}

impl PipelineContext {
    #[must_use]
    pub fn new(resolver: Arc<dyn RoutingResolver>, fetcher: Arc<dyn PartitionFetcher>) -> Self {
        Self {
            resolver,
            fetcher,
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }
}

///
/// ResultPage
///
/// One page of rows in final order, plus the token that resumes right
/// after it (`None` once nothing remains).
///

#[derive(Clone, Debug, Deref, PartialEq)]
pub struct ResultPage {
    #[deref]
    rows: Vec<Row>,
    continuation: Option<ContinuationToken>,
}

impl ResultPage {
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    #[must_use]
    pub const fn continuation(&self) -> Option<&ContinuationToken> {
        self.continuation.as_ref()
    }
}

impl IntoIterator for ResultPage {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultPage {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

///
/// PipelineError
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum PipelineError {
    #[error("pull cancelled")]
    Cancelled,

    #[error("partition {partition} {range} failed ({class}, {cause}): {message}")]
    Fatal {
        partition: PartitionId,
        range: PartitionRange,
        class: FailureClass,
        cause: AbortCause,
        message: String,
    },

    #[error(transparent)]
    Continuation(#[from] ContinuationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

///
/// Pipeline
///
/// Caller-facing handle over one query execution. Single consumer: pulls
/// are sequential. A failed or cancelled pull leaves the pipeline at the
/// last committed page, so it can be retried or resumed from its token.
///

pub struct Pipeline {
    plan: QueryPlan,
    signature: PlanSignature,
    context: PipelineContext,
    classifier: FailureClassifier,
    root: Box<dyn Stage>,
    committed: PipelineState,
    finished: bool,
}

impl Pipeline {
    /// Resolve the plan's range against current topology and build a
    /// fresh operator tree.
    pub async fn start(plan: QueryPlan, context: PipelineContext) -> Result<Self, PipelineError> {
        let range = plan.source().range.effective_range();
        let fragments = routing::resolve_fragments(context.resolver.as_ref(), &range).await?;
        tracing::info!(
            range = %range,
            version = %fragments.version,
            partitions = fragments.fragments.len(),
            "pipeline started"
        );

        let state = PipelineState {
            root: build::initial_state(plan.root(), &fragments),
        };

        Self::assemble(plan, context, state)
    }

    /// Rebuild the operator tree from `token`, remapping fetch nodes whose
    /// topology changed since the token was issued.
    pub async fn resume(
        plan: QueryPlan,
        context: PipelineContext,
        token: &str,
    ) -> Result<Self, PipelineError> {
        let mut state = continuation::decode(token, plan.signature())?;
        merge::remap_topology(state.merge_mut(), context.resolver.as_ref()).await?;
        tracing::info!(
            partitions = state.merge().slots.len(),
            "pipeline resumed"
        );

        Self::assemble(plan, context, state)
    }

    fn assemble(
        plan: QueryPlan,
        context: PipelineContext,
        state: PipelineState,
    ) -> Result<Self, PipelineError> {
        let root = build::build(plan.root(), state.root.clone())?;

        Ok(Self {
            signature: plan.signature(),
            classifier: FailureClassifier::new(context.config.retry),
            plan,
            context,
            root,
            committed: state,
            finished: false,
        })
    }

    /// Whether another pull can yield rows. Pure: repeated calls without an
    /// intervening pull agree.
    #[must_use]
    pub fn has_more_results(&self) -> bool {
        !self.finished && self.root.has_more_results()
    }

    pub async fn pull_next(&mut self) -> Result<Option<ResultPage>, PipelineError> {
        self.pull_next_cancellable(&CancelSignal::new()).await
    }

    /// Pull the next page. `Ok(None)` means exhausted and stays that way.
    pub async fn pull_next_cancellable(
        &mut self,
        cancel: &CancelSignal,
    ) -> Result<Option<ResultPage>, PipelineError> {
        if !self.has_more_results() {
            self.finished = true;
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let cx = PullContext {
            resolver: self.context.resolver.as_ref(),
            fetcher: self.context.fetcher.as_ref(),
            config: &self.context.config,
            classifier: self.classifier,
            cancel,
        };
        let outcome = match self.root.pull_next(&cx).await {
            Ok(Some(rows)) if rows.is_empty() => {
                Err(PipelineError::Internal(InternalError::pipeline_invariant(
                    "stage tree yielded an empty page",
                )))
            }
            other => other,
        };

        match outcome {
            Ok(rows) => {
                self.committed = PipelineState {
                    root: self.root.snapshot(),
                };
                let Some(rows) = rows else {
                    self.finished = true;
                    tracing::debug!("pipeline exhausted");
                    return Ok(None);
                };
                let continuation = self.continuation()?;
                tracing::debug!(
                    rows = rows.len(),
                    more = continuation.is_some(),
                    "page pulled"
                );

                Ok(Some(ResultPage { rows, continuation }))
            }
            Err(err) => {
                self.root = build::build(self.plan.root(), self.committed.root.clone())?;
                match &err {
                    PipelineError::Cancelled => tracing::debug!("pull cancelled, state restored"),
                    _ => tracing::warn!(error = %err, "pull failed, state restored"),
                }

                Err(err)
            }
        }
    }

    /// Token resuming after the last successfully pulled page, or `None`
    /// once nothing remains.
    pub fn continuation(&self) -> Result<Option<ContinuationToken>, PipelineError> {
        if !self.has_more_results() {
            return Ok(None);
        }

        Ok(Some(continuation::encode(&self.committed, self.signature)?))
    }

    /// The last committed snapshot.
    #[must_use]
    pub const fn state(&self) -> &PipelineState {
        &self.committed
    }
}
