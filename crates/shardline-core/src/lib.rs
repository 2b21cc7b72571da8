//! Cross-partition query pipeline for horizontally partitioned document
//! stores: routing fan-out, per-partition paging, ordered merge, transform
//! stages, and resumable continuation tokens.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod cancel;
pub mod config;
pub mod continuation;
pub mod crypto;
pub mod error;
pub mod failure;
pub mod fetch;
pub mod pipeline;
pub mod plan;
pub mod range;
pub mod routing;
pub mod row;
pub mod serialize;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_support;

///
/// Prelude
///
/// Vocabulary a caller needs to build a plan and drive a pipeline.
///

pub mod prelude {
    pub use crate::{
        cancel::CancelSignal,
        config::{PipelineConfig, RetryPolicy},
        pipeline::{Pipeline, PipelineContext, PipelineError, ResultPage},
        plan::{AggregateFunction, AggregateSpec, DistinctMode, QueryPlan},
        range::{FeedRange, PartitionRange},
        row::{OrderSpec, OrderTerm, Row},
        value::Value,
    };
}
