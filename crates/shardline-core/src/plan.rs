//! Module: plan
//! Responsibility: the physical operator tree a compiled query arrives as,
//! and the shape fingerprint continuation tokens are bound to.
//! Does not own: query compilation or query-language semantics.
#![expect(clippy::cast_possible_truncation)]

use crate::{
    continuation::encode_hex,
    range::{FeedRange, PartitionRange},
    row::{OrderDirection, OrderSpec},
};
use sha2::{Digest, Sha256};
use std::fmt;

///
/// QueryPlan
///
/// A linear operator tree rooted at its outermost stage with exactly one
/// merge leaf.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueryPlan {
    root: PlanNode,
}

impl QueryPlan {
    /// Plan that merges every partition serving `range` under `order`.
    #[must_use]
    pub fn scan(range: FeedRange, query: impl Into<String>, order: OrderSpec) -> Self {
        Self {
            root: PlanNode::Merge(SourcePlan {
                range,
                query: query.into(),
                order,
            }),
        }
    }

    #[must_use]
    pub fn distinct(self, mode: DistinctMode, fields: Vec<String>) -> Self {
        self.wrap(|input| PlanNode::Distinct {
            input,
            mode,
            fields,
        })
    }

    #[must_use]
    pub fn skip_take(self, skip: u64, take: Option<u64>) -> Self {
        self.wrap(|input| PlanNode::SkipTake { input, skip, take })
    }

    #[must_use]
    pub fn aggregate(self, aggregates: Vec<AggregateSpec>) -> Self {
        self.wrap(|input| PlanNode::Aggregate { input, aggregates })
    }

    #[must_use]
    pub fn group_by(self, fields: Vec<String>, aggregates: Vec<AggregateSpec>) -> Self {
        self.wrap(|input| PlanNode::GroupBy {
            input,
            fields,
            aggregates,
        })
    }

    fn wrap(self, stage: impl FnOnce(Box<PlanNode>) -> PlanNode) -> Self {
        Self {
            root: stage(Box::new(self.root)),
        }
    }

    #[must_use]
    pub const fn root(&self) -> &PlanNode {
        &self.root
    }

    /// The merge leaf at the bottom of the tree.
    #[must_use]
    pub fn source(&self) -> &SourcePlan {
        let mut node = &self.root;
        loop {
            match node {
                PlanNode::Merge(source) => return source,
                PlanNode::Distinct { input, .. }
                | PlanNode::SkipTake { input, .. }
                | PlanNode::Aggregate { input, .. }
                | PlanNode::GroupBy { input, .. } => node = &**input,
            }
        }
    }

    /// Fingerprint of the plan shape.
    ///
    /// Included: operator kinds and nesting, range, query text, order,
    /// distinct mode and keys, grouping keys, aggregate terms, and the
    /// skip/take counts. A token only resumes the exact plan that issued it.
    #[must_use]
    pub fn signature(&self) -> PlanSignature {
        let mut hasher = Sha256::new();
        hasher.update(b"plansig:v1");
        hash_node(&mut hasher, &self.root);

        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);

        PlanSignature::from_bytes(out)
    }
}

///
/// PlanNode
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PlanNode {
    Merge(SourcePlan),
    Distinct {
        input: Box<Self>,
        mode: DistinctMode,
        fields: Vec<String>,
    },
    SkipTake {
        input: Box<Self>,
        skip: u64,
        take: Option<u64>,
    },
    Aggregate {
        input: Box<Self>,
        aggregates: Vec<AggregateSpec>,
    },
    GroupBy {
        input: Box<Self>,
        fields: Vec<String>,
        aggregates: Vec<AggregateSpec>,
    },
}

impl PlanNode {
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
/// PlanKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlanKind {
    Merge,
    Distinct,
    SkipTake,
    Aggregate,
    GroupBy,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Merge => "merge",
            Self::Distinct => "distinct",
            Self::SkipTake => "skip_take",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "group_by",
        };
        write!(f, "{label}")
    }
}

///
/// SourcePlan
///
/// What every partition is asked: the partition-local query text, the
/// range to cover, and the order partitions return rows in.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourcePlan {
    pub range: FeedRange,
    pub query: String,
    pub order: OrderSpec,
}

///
/// DistinctMode
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DistinctMode {
    /// Remembers every key seen; any input order.
    Unordered,

    /// Remembers only the last key; input must be sorted on the key.
    Ordered,
}

///
/// AggregateFunction
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

///
/// AggregateSpec
///
/// One output column of an aggregate or group-by stage. `Count` without a
/// field counts rows; every other function reads `field`.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    pub field: Option<String>,
    pub alias: String,
}

impl AggregateSpec {
    #[must_use]
    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            field: None,
            alias: alias.into(),
        }
    }

    #[must_use]
    pub fn over(
        function: AggregateFunction,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            function,
            field: Some(field.into()),
            alias: alias.into(),
        }
    }
}

///
/// PlanSignature
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PlanSignature([u8; 32]);

impl PlanSignature {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn into_bytes(self) -> [u8; 32] {
        self.0
    }

    #[must_use]
    pub fn as_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Display for PlanSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

fn hash_node(hasher: &mut Sha256, node: &PlanNode) {
    match node {
        PlanNode::Merge(source) => {
            write_tag(hasher, 0x10);
            hash_range(hasher, &source.range);
            write_str(hasher, &source.query);
            hash_order(hasher, &source.order);
        }
        PlanNode::Distinct {
            input,
            mode,
            fields,
        } => {
            write_tag(hasher, 0x20);
            write_tag(
                hasher,
                match mode {
                    DistinctMode::Unordered => 0x01,
                    DistinctMode::Ordered => 0x02,
                },
            );
            write_fields(hasher, fields);
            hash_node(hasher, input);
        }
        PlanNode::SkipTake { input, skip, take } => {
            write_tag(hasher, 0x30);
            write_u64(hasher, *skip);
            match take {
                Some(take) => {
                    write_tag(hasher, 0x01);
                    write_u64(hasher, *take);
                }
                None => write_tag(hasher, 0x00),
            }
            hash_node(hasher, input);
        }
        PlanNode::Aggregate { input, aggregates } => {
            write_tag(hasher, 0x40);
            hash_aggregates(hasher, aggregates);
            hash_node(hasher, input);
        }
        PlanNode::GroupBy {
            input,
            fields,
            aggregates,
        } => {
            write_tag(hasher, 0x50);
            write_fields(hasher, fields);
            hash_aggregates(hasher, aggregates);
            hash_node(hasher, input);
        }
    }
}

fn hash_range(hasher: &mut Sha256, range: &FeedRange) {
    match range {
        FeedRange::Effective(range) => {
            write_tag(hasher, 0x01);
            hash_partition_range(hasher, range);
        }
        FeedRange::PartitionKey(key) => {
            write_tag(hasher, 0x02);
            write_str(hasher, key);
        }
    }
}

fn hash_partition_range(hasher: &mut Sha256, range: &PartitionRange) {
    write_str(hasher, range.lower().as_str());
    write_str(hasher, range.upper().as_str());
    write_tag(hasher, u8::from(range.lower_inclusive()));
    write_tag(hasher, u8::from(range.upper_inclusive()));
}

fn hash_order(hasher: &mut Sha256, order: &OrderSpec) {
    write_u32(hasher, order.terms.len() as u32);
    for term in &order.terms {
        write_str(hasher, &term.field);
        write_tag(
            hasher,
            match term.direction {
                OrderDirection::Asc => 0x01,
                OrderDirection::Desc => 0x02,
            },
        );
    }
}

fn hash_aggregates(hasher: &mut Sha256, aggregates: &[AggregateSpec]) {
    write_u32(hasher, aggregates.len() as u32);
    for aggregate in aggregates {
        write_tag(
            hasher,
            match aggregate.function {
                AggregateFunction::Count => 0x01,
                AggregateFunction::Sum => 0x02,
                AggregateFunction::Min => 0x03,
                AggregateFunction::Max => 0x04,
                AggregateFunction::Avg => 0x05,
            },
        );
        match &aggregate.field {
            Some(field) => {
                write_tag(hasher, 0x01);
                write_str(hasher, field);
            }
            None => write_tag(hasher, 0x00),
        }
        write_str(hasher, &aggregate.alias);
    }
}

fn write_fields(hasher: &mut Sha256, fields: &[String]) {
    write_u32(hasher, fields.len() as u32);
    for field in fields {
        write_str(hasher, field);
    }
}

fn write_str(hasher: &mut Sha256, value: &str) {
    write_u32(hasher, value.len() as u32);
    hasher.update(value.as_bytes());
}

fn write_u32(hasher: &mut Sha256, value: u32) {
    hasher.update(value.to_be_bytes());
}

fn write_u64(hasher: &mut Sha256, value: u64) {
    hasher.update(value.to_be_bytes());
}

fn write_tag(hasher: &mut Sha256, tag: u8) {
    hasher.update([tag]);
}

///
/// TESTS
///
