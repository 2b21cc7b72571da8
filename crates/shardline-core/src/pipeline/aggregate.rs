//! Module: pipeline::aggregate
//! Responsibility: whole-input aggregation, optionally grouped, emitted as
//! one terminal page.
//! Does not own: resumption mid-accumulation; an interrupted drain restarts
//! from the committed upstream state.

use crate::{
    pipeline::{PipelineError, PullContext, Stage, state::StageState},
    plan::{AggregateFunction, AggregateSpec},
    row::Row,
    value::Value,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

const AGGREGATE_ROW_ID: &str = "aggregate";

///
/// Grouping
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Grouping {
    /// One output row over the whole input.
    Single,

    /// One output row per distinct value tuple of these fields.
    Fields(Vec<String>),
}

impl Grouping {
    fn key_of(&self, row: &Row) -> Vec<Value> {
        match self {
            Self::Single => Vec::new(),
            Self::Fields(fields) => fields.iter().map(|field| row.field(field).clone()).collect(),
        }
    }
}

///
/// AggregateStage
///

pub(crate) struct AggregateStage {
    input: Box<dyn Stage>,
    grouping: Grouping,
    aggregates: Vec<AggregateSpec>,
    done: bool,
}

impl AggregateStage {
    pub(crate) fn new(
        input: Box<dyn Stage>,
        grouping: Grouping,
        aggregates: Vec<AggregateSpec>,
        done: bool,
    ) -> Self {
        Self {
            input,
            grouping,
            aggregates,
            done,
        }
    }

    fn accumulators(aggregates: &[AggregateSpec]) -> Vec<Accumulator> {
        aggregates
            .iter()
            .map(|spec| Accumulator::new(spec.function))
            .collect()
    }

    fn output_row(&self, ordinal: usize, key: Vec<Value>, accumulators: Vec<Accumulator>) -> Row {
        let mut row = match &self.grouping {
            Grouping::Single => Row::new(AGGREGATE_ROW_ID),
            Grouping::Fields(fields) => {
                let mut row = Row::new(format!("group:{ordinal}"));
                row.fields.extend(fields.iter().cloned().zip(key));
                row
            }
        };
        row.fields.extend(
            self.aggregates
                .iter()
                .zip(accumulators)
                .map(|(spec, accumulator)| (spec.alias.clone(), accumulator.finish())),
        );

        row
    }
}

#[async_trait]
impl Stage for AggregateStage {
    fn has_more_results(&self) -> bool {
        !self.done
    }

    async fn pull_next(&mut self, cx: &PullContext<'_>) -> Result<Option<Vec<Row>>, PipelineError> {
        if self.done {
            return Ok(None);
        }

        let mut groups: BTreeMap<Vec<Value>, Vec<Accumulator>> = BTreeMap::new();
        if self.grouping == Grouping::Single {
            groups.insert(Vec::new(), Self::accumulators(&self.aggregates));
        }

        let mut consumed = 0usize;
        while let Some(page) = self.input.pull_next(cx).await? {
            consumed += page.len();
            for row in &page {
                let accumulators = groups
                    .entry(self.grouping.key_of(row))
                    .or_insert_with(|| Self::accumulators(&self.aggregates));
                for (accumulator, spec) in accumulators.iter_mut().zip(&self.aggregates) {
                    accumulator.update(spec, row);
                }
            }
        }
        self.done = true;

        let rows: Vec<Row> = groups
            .into_iter()
            .enumerate()
            .map(|(ordinal, (key, accumulators))| self.output_row(ordinal, key, accumulators))
            .collect();
        tracing::debug!(consumed, groups = rows.len(), "aggregation complete");

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(rows))
    }

    fn snapshot(&self) -> StageState {
        let input = Box::new(self.input.snapshot());

        match self.grouping {
            Grouping::Single => StageState::Aggregate {
                input,
                done: self.done,
            },
            Grouping::Fields(_) => StageState::GroupBy {
                input,
                done: self.done,
            },
        }
    }
}

///
/// Accumulator
///

#[derive(Debug)]
enum Accumulator {
    Count(u64),
    Sum(SumState),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { total: f64, count: u64 },
}

// Integer sums stay exact until they overflow or meet a float.
#[derive(Debug)]
struct SumState {
    seen: bool,
    exact: Option<i64>,
    total: f64,
}

impl Accumulator {
    const fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Count => Self::Count(0),
            AggregateFunction::Sum => Self::Sum(SumState {
                seen: false,
                exact: Some(0),
                total: 0.0,
            }),
            AggregateFunction::Min => Self::Min(None),
            AggregateFunction::Max => Self::Max(None),
            AggregateFunction::Avg => Self::Avg {
                total: 0.0,
                count: 0,
            },
        }
    }

    fn update(&mut self, spec: &AggregateSpec, row: &Row) {
        let Some(field) = &spec.field else {
            if let Self::Count(count) = self {
                *count += 1;
            }
            return;
        };
        let value = row.field(field);
        if value.is_null() {
            return;
        }

        match self {
            Self::Count(count) => *count += 1,
            Self::Sum(sum) => {
                let Some(number) = value.as_f64() else {
                    return;
                };
                sum.seen = true;
                sum.total += number;
                sum.exact = match (sum.exact, value) {
                    (Some(exact), Value::Int(int)) => exact.checked_add(*int),
                    _ => None,
                };
            }
            Self::Min(current) => {
                if current.as_ref().is_none_or(|min| value < min) {
                    *current = Some(value.clone());
                }
            }
            Self::Max(current) => {
                if current.as_ref().is_none_or(|max| value > max) {
                    *current = Some(value.clone());
                }
            }
            Self::Avg { total, count } => {
                if let Some(number) = value.as_f64() {
                    *total += number;
                    *count += 1;
                }
            }
        }
    }

    #[expect(clippy::cast_precision_loss)]
    fn finish(self) -> Value {
        match self {
            Self::Count(count) => Value::Int(i64::try_from(count).unwrap_or(i64::MAX)),
            Self::Sum(sum) if !sum.seen => Value::Null,
            Self::Sum(SumState {
                exact: Some(exact), ..
            }) => Value::Int(exact),
            Self::Sum(SumState { total, .. }) => Value::Float(total),
            Self::Min(value) | Self::Max(value) => value.unwrap_or_default(),
            Self::Avg { count: 0, .. } => Value::Null,
            Self::Avg { total, count } => Value::Float(total / count as f64),
        }
    }
}

///
/// TESTS
///
