use crate::{fetch::FetchState, plan::PlanKind, row::Row, value::Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

///
/// PipelineState
///
/// Serializable snapshot of a whole operator tree, taken between pulls.
/// Decoded against an unchanged topology it replays exactly the rows an
/// uninterrupted run would still have produced.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PipelineState {
    pub root: StageState,
}

impl PipelineState {
    /// The merge leaf's state.
    #[must_use]
    pub fn merge(&self) -> &MergeState {
        let mut stage = &self.root;
        loop {
            match stage {
                StageState::Merge(merge) => return merge,
                StageState::Distinct { input, .. }
                | StageState::SkipTake { input, .. }
                | StageState::Aggregate { input, .. }
                | StageState::GroupBy { input, .. } => stage = &**input,
            }
        }
    }

    pub(crate) fn merge_mut(&mut self) -> &mut MergeState {
        let mut stage = &mut self.root;
        loop {
            match stage {
                StageState::Merge(merge) => return merge,
                StageState::Distinct { input, .. }
                | StageState::SkipTake { input, .. }
                | StageState::Aggregate { input, .. }
                | StageState::GroupBy { input, .. } => stage = &mut **input,
            }
        }
    }
}

///
/// StageState
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StageState {
    Merge(MergeState),
    Distinct {
        input: Box<Self>,
        seen: DistinctSeen,
    },
    SkipTake {
        input: Box<Self>,
        skip_remaining: u64,
        take_remaining: Option<u64>,
    },
    Aggregate {
        input: Box<Self>,
        done: bool,
    },
    GroupBy {
        input: Box<Self>,
        done: bool,
    },
}

impl StageState {
    #[must_use]
    pub const fn kind(&self) -> PlanKind {
        match self {
            Self::Merge(_) => PlanKind::Merge,
            Self::Distinct { .. } => PlanKind::Distinct,
            Self::SkipTake { .. } => PlanKind::SkipTake,
            Self::Aggregate { .. } => PlanKind::Aggregate,
            Self::GroupBy { .. } => PlanKind::GroupBy,
        }
    }
}

///
/// MergeState
///
/// Children in merge order; drained children are dropped.
///

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MergeState {
    pub slots: Vec<MergeSlotState>,
}

///
/// MergeSlotState
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MergeSlotState {
    pub fetch: FetchState,

    /// Fetched from the partition but not yet emitted.
    pub buffered: Vec<Row>,
}

///
/// DistinctSeen
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DistinctSeen {
    Unordered(BTreeSet<Vec<Value>>),
    Ordered(Option<Vec<Value>>),
}
