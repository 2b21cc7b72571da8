//! Module: pipeline::merge
//! Responsibility: k-way merge of per-partition fetch nodes into one
//! ordered stream, including splicing replacement nodes after topology
//! changes.
//! Does not own: per-request retry (fetch nodes) or failure classification.

use crate::{
    failure::{AbortCause, FailureClassifier},
    fetch::{FetchError, FetchPull, FetchScope, NodeFailure, PartitionFetchStage},
    pipeline::{
        PipelineError, PullContext, Stage,
        state::{MergeSlotState, MergeState, StageState},
    },
    plan::SourcePlan,
    routing::{self, RoutingError, RoutingResolver},
    row::{OrderSpec, Row},
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::{collections::VecDeque, future::Future, pin::Pin};

// One in-flight slot refill, tagged with the slot index.
type SlotFetch<'a> =
    Pin<Box<dyn Future<Output = (usize, Result<FetchPull, NodeFailure>)> + Send + 'a>>;

///
/// MergeSlot
///
/// One child of the merge: its fetch node plus rows fetched but not yet
/// emitted. A slot is only refilled once its buffer is empty.
///

struct MergeSlot {
    node: PartitionFetchStage,
    buffered: VecDeque<Row>,
}

impl MergeSlot {
    fn from_state(state: MergeSlotState) -> Self {
        Self {
            node: PartitionFetchStage::from_state(state.fetch),
            buffered: state.buffered.into(),
        }
    }

    fn needs_refill(&self) -> bool {
        self.buffered.is_empty() && !self.node.is_exhausted()
    }

    fn is_drained(&self) -> bool {
        self.buffered.is_empty() && self.node.is_exhausted()
    }
}

///
/// MergeStage
///

pub(crate) struct MergeStage {
    query: String,
    order: OrderSpec,
    slots: Vec<MergeSlot>,
}

impl MergeStage {
    pub(crate) fn from_state(source: &SourcePlan, state: MergeState) -> Self {
        Self {
            query: source.query.clone(),
            order: source.order.clone(),
            slots: state.slots.into_iter().map(MergeSlot::from_state).collect(),
        }
    }

    // Slot holding the next row to emit. Only meaningful once every
    // non-drained slot has a head. Ties go to the lower slot index; an
    // unordered merge drains slots in range order.
    fn next_slot(&self) -> Option<usize> {
        let mut heads = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.buffered.front().map(|row| (index, row)));

        if self.order.terms.is_empty() {
            return heads.next().map(|(index, _)| index);
        }

        heads
            .min_by(|(_, left), (_, right)| self.order.compare_rows(left, right))
            .map(|(index, _)| index)
    }

    // Fetch for every slot with an empty buffer until none is left, then
    // splice replacements for slots that hit a topology change.
    async fn refill(
        &mut self,
        cx: &PullContext<'_>,
        refreshes: &mut u32,
    ) -> Result<(), PipelineError> {
        loop {
            if !self.slots.iter().any(MergeSlot::needs_refill) {
                return Ok(());
            }

            let scope = FetchScope {
                query: &self.query,
                order: &self.order,
                fetcher: cx.fetcher,
                config: cx.config,
                classifier: cx.classifier,
                cancel: cx.cancel,
            };
            // Materialized before awaiting to keep the pull future Send.
            let mut fetches: Vec<SlotFetch<'_>> = Vec::new();
            for (index, slot) in self.slots.iter_mut().enumerate() {
                if slot.needs_refill() {
                    fetches.push(Box::pin(async move {
                        (index, slot.node.fetch_next(scope).await)
                    }));
                }
            }
            let mut outcomes: Vec<(usize, Result<FetchPull, NodeFailure>)> = stream::iter(fetches)
                .buffer_unordered(cx.config.effective_parallelism())
                .collect()
                .await;
            outcomes.sort_by_key(|(index, _)| *index);

            let mut topology = Vec::new();
            for (index, outcome) in outcomes {
                match outcome {
                    Ok(FetchPull::Page(rows)) => self.slots[index].buffered.extend(rows),
                    Ok(FetchPull::Exhausted) => {}
                    Err(NodeFailure::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(NodeFailure::Abort { cause, error }) => {
                        return Err(self.fatal(index, cause, error));
                    }
                    Err(NodeFailure::Topology {
                        confirm_gone,
                        error,
                    }) => topology.push((index, confirm_gone, error)),
                }
            }

            // Highest index first so splicing keeps lower indices valid.
            for (index, confirm_gone, error) in topology.into_iter().rev() {
                *refreshes += 1;
                if *refreshes > cx.config.max_topology_refreshes {
                    let cause = AbortCause::TopologyRefreshBudgetExhausted {
                        refreshes: *refreshes - 1,
                    };
                    return Err(self.fatal(index, cause, error));
                }
                self.replace(index, confirm_gone, cx.resolver).await?;
            }
        }
    }

    // Swap slot `index` for the partitions now serving its range.
    async fn replace(
        &mut self,
        index: usize,
        confirm_gone: bool,
        resolver: &dyn RoutingResolver,
    ) -> Result<(), PipelineError> {
        let state = self.slots[index].node.state().clone();
        let fragments = routing::refresh_fragments(resolver, &state.range).await?;
        let mut successors = state.successors(&fragments).into_iter();

        let Some(first) = successors.next() else {
            if confirm_gone {
                tracing::info!(
                    partition = %state.partition,
                    range = %state.range,
                    "partition gone without successor, finishing node"
                );
                self.slots[index].node.finish();
                return Ok(());
            }

            return Err(RoutingError::Unavailable {
                range: state.range.to_string(),
                reason: format!("no partition serves the range after {}", state.partition),
            }
            .into());
        };

        tracing::info!(
            partition = %state.partition,
            range = %state.range,
            version = %fragments.version,
            successors = fragments.fragments.len(),
            "replacing fetch node"
        );
        let head = MergeSlot {
            node: PartitionFetchStage::from_state(first),
            buffered: std::mem::take(&mut self.slots[index].buffered),
        };
        let replacements: Vec<MergeSlot> = std::iter::once(head)
            .chain(successors.map(|fetch| MergeSlot {
                node: PartitionFetchStage::from_state(fetch),
                buffered: VecDeque::new(),
            }))
            .collect();
        self.slots.splice(index..=index, replacements);

        Ok(())
    }

    fn fatal(&self, index: usize, cause: AbortCause, error: FetchError) -> PipelineError {
        let state = self.slots[index].node.state();
        let class = FailureClassifier::classify(error.kind);
        tracing::warn!(
            partition = %state.partition,
            range = %state.range,
            class = %class,
            cause = %cause,
            "partition fetch aborted"
        );

        PipelineError::Fatal {
            partition: state.partition.clone(),
            range: state.range.clone(),
            class,
            cause,
            message: error.message,
        }
    }
}

#[async_trait]
impl Stage for MergeStage {
    fn has_more_results(&self) -> bool {
        self.slots.iter().any(|slot| !slot.is_drained())
    }

    async fn pull_next(&mut self, cx: &PullContext<'_>) -> Result<Option<Vec<Row>>, PipelineError> {
        let page_size = cx.config.effective_page_size();
        let mut page = Vec::with_capacity(page_size);
        let mut refreshes = 0;

        while page.len() < page_size {
            self.refill(cx, &mut refreshes).await?;

            // Emit until the page is full or the emitting slot runs dry.
            while page.len() < page_size {
                let Some(index) = self.next_slot() else {
                    break;
                };
                let slot = &mut self.slots[index];
                let Some(row) = slot.buffered.pop_front() else {
                    break;
                };
                page.push(row);
                if slot.needs_refill() {
                    break;
                }
            }

            if self.slots.iter().all(MergeSlot::is_drained) {
                break;
            }
        }
        self.slots.retain(|slot| !slot.is_drained());

        tracing::debug!(rows = page.len(), children = self.slots.len(), "merge pull");
        if page.is_empty() {
            return Ok(None);
        }

        Ok(Some(page))
    }

    fn snapshot(&self) -> StageState {
        StageState::Merge(MergeState {
            slots: self
                .slots
                .iter()
                .map(|slot| MergeSlotState {
                    fetch: slot.node.state().clone(),
                    buffered: slot.buffered.iter().cloned().collect(),
                })
                .collect(),
        })
    }
}

/// Re-resolve every live fetch node of a decoded merge state and remap the
/// ones whose topology changed since the token was issued.
pub(super) async fn remap_topology(
    merge: &mut MergeState,
    resolver: &dyn RoutingResolver,
) -> Result<(), RoutingError> {
    let mut slots = Vec::with_capacity(merge.slots.len());

    for slot in std::mem::take(&mut merge.slots) {
        if slot.fetch.exhausted {
            slots.push(slot);
            continue;
        }

        let fragments = routing::resolve_fragments(resolver, &slot.fetch.range).await?;
        if fragments.version == slot.fetch.topology {
            slots.push(slot);
            continue;
        }

        let mut successors = slot.fetch.successors(&fragments).into_iter();
        tracing::info!(
            partition = %slot.fetch.partition,
            from = %slot.fetch.topology,
            to = %fragments.version,
            successors = fragments.fragments.len(),
            "remapping resumed fetch node"
        );
        match successors.next() {
            Some(first) => {
                slots.push(MergeSlotState {
                    fetch: first,
                    buffered: slot.buffered,
                });
                slots.extend(successors.map(|fetch| MergeSlotState {
                    fetch,
                    buffered: Vec::new(),
                }));
            }
            // Nothing serves the range any more; keep rows already fetched.
            None if !slot.buffered.is_empty() => {
                let mut fetch = slot.fetch;
                fetch.exhausted = true;
                slots.push(MergeSlotState {
                    fetch,
                    buffered: slot.buffered,
                });
            }
            None => {}
        }
    }
    merge.slots = slots;

    Ok(())
}
