use crate::{
    continuation::ContinuationError,
    error::InternalError,
    fetch::FetchState,
    pipeline::{
        Stage,
        aggregate::{AggregateStage, Grouping},
        distinct::DistinctStage,
        merge::MergeStage,
        skip_take::SkipTakeStage,
        state::{DistinctSeen, MergeSlotState, MergeState, StageState},
    },
    plan::{DistinctMode, PlanNode},
    routing::Fragments,
};
use std::collections::BTreeSet;

/// Fresh state for `node` over freshly resolved fragments.
pub(super) fn initial_state(node: &PlanNode, fragments: &Fragments) -> StageState {
    match node {
        PlanNode::Merge(_) => StageState::Merge(MergeState {
            slots: fragments
                .fragments
                .iter()
                .map(|fragment| MergeSlotState {
                    fetch: FetchState::new(
                        fragment.partition.clone(),
                        fragment.range.clone(),
                        fragments.version,
                    ),
                    buffered: Vec::new(),
                })
                .collect(),
        }),
        PlanNode::Distinct { input, mode, .. } => StageState::Distinct {
            input: Box::new(initial_state(input, fragments)),
            seen: match mode {
                DistinctMode::Unordered => DistinctSeen::Unordered(BTreeSet::new()),
                DistinctMode::Ordered => DistinctSeen::Ordered(None),
            },
        },
        PlanNode::SkipTake { input, skip, take } => StageState::SkipTake {
            input: Box::new(initial_state(input, fragments)),
            skip_remaining: *skip,
            take_remaining: *take,
        },
        PlanNode::Aggregate { input, .. } => StageState::Aggregate {
            input: Box::new(initial_state(input, fragments)),
            done: false,
        },
        PlanNode::GroupBy { input, .. } => StageState::GroupBy {
            input: Box::new(initial_state(input, fragments)),
            done: false,
        },
    }
}

/// Build the stage tree for `node` positioned at `state`. The two trees
/// must have the same shape node for node.
pub(super) fn build(
    node: &PlanNode,
    state: StageState,
) -> Result<Box<dyn Stage>, ContinuationError> {
    match (node, state) {
        (PlanNode::Merge(source), StageState::Merge(merge)) => {
            Ok(Box::new(MergeStage::from_state(source, merge)))
        }
        (
            PlanNode::Distinct {
                input,
                mode,
                fields,
            },
            StageState::Distinct { input: upstream, seen },
        ) => {
            let matches_mode = matches!(
                (mode, &seen),
                (DistinctMode::Unordered, DistinctSeen::Unordered(_))
                    | (DistinctMode::Ordered, DistinctSeen::Ordered(_))
            );
            if !matches_mode {
                return Err(ContinuationError::Payload(
                    InternalError::continuation_corruption(format!(
                        "distinct state does not match {mode:?} distinct"
                    )),
                ));
            }

            Ok(Box::new(DistinctStage::new(
                build(input, *upstream)?,
                fields.clone(),
                seen,
            )))
        }
        (
            PlanNode::SkipTake { input, .. },
            StageState::SkipTake {
                input: upstream,
                skip_remaining,
                take_remaining,
            },
        ) => Ok(Box::new(SkipTakeStage::new(
            build(input, *upstream)?,
            skip_remaining,
            take_remaining,
        ))),
        (
            PlanNode::Aggregate { input, aggregates },
            StageState::Aggregate {
                input: upstream,
                done,
            },
        ) => Ok(Box::new(AggregateStage::new(
            build(input, *upstream)?,
            Grouping::Single,
            aggregates.clone(),
            done,
        ))),
        (
            PlanNode::GroupBy {
                input,
                fields,
                aggregates,
            },
            StageState::GroupBy {
                input: upstream,
                done,
            },
        ) => Ok(Box::new(AggregateStage::new(
            build(input, *upstream)?,
            Grouping::Fields(fields.clone()),
            aggregates.clone(),
            done,
        ))),
        (node, state) => Err(ContinuationError::Structure {
            expected: node.kind(),
            found: state.kind(),
        }),
    }
}
