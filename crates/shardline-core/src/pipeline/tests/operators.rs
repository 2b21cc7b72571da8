use super::{
    QUERY, ascending, assert_resumes_at_every_page, config, drain, expected, ids, interleaved,
    interleaved_in, row, scan,
};
use crate::{
    continuation::ContinuationError,
    fetch::{FetchError, FetchRequest, FetchResponse, PartitionFetcher},
    pipeline::{Pipeline, PipelineContext, PipelineError},
    plan::{AggregateFunction, AggregateSpec, DistinctMode, QueryPlan},
    range::{FeedRange, PartitionRange},
    row::{OrderSpec, OrderTerm, Row},
    test_support::Cluster,
    value::Value,
};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

// Six rows over three partitions where `k = n / 2`, so equal keys are
// adjacent in `n` order: kept rows are r01, r02, r04, r06.
fn paired_keys() -> Cluster {
    let cluster = Cluster::even(ascending(), 3);
    for n in 1..=6 {
        cluster.insert(&format!("p{}", (n - 1) % 3), row(n).with("k", n / 2));
    }

    cluster
}

// Layout with nothing serving `[90, A0)`.
fn uncovered() -> (Cluster, FeedRange) {
    let cluster = Cluster::new(ascending(), &[("p0", "", "80")]);
    cluster.insert("p0", row(1));
    let range = PartitionRange::half_open("90", "A0").expect("range should be valid");

    (cluster, FeedRange::Effective(range))
}

// Fetcher that records how many requests were outstanding at once.
struct InFlightGauge {
    inner: Cluster,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl PartitionFetcher for InFlightGauge {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let response = self.inner.fetch(request).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        response
    }
}

///
/// MERGE
///

#[tokio::test]
async fn merge_interleaves_partitions_into_global_order() {
    let cluster = interleaved(2);
    let mut pipeline = Pipeline::start(scan(ascending()), cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    let mut pages = Vec::new();
    while let Some(page) = pipeline.pull_next().await.expect("pull should succeed") {
        pages.push((ids(&page), page.continuation().is_some()));
    }

    assert_eq!(
        pages,
        vec![
            (expected(1..=2), true),
            (expected(3..=4), true),
            (expected(5..=6), false),
        ]
    );
    assert!(!pipeline.has_more_results());
    assert!(
        pipeline
            .pull_next()
            .await
            .expect("exhausted pull should succeed")
            .is_none()
    );
    assert_eq!(pipeline.continuation().expect("token should encode"), None);
}

#[tokio::test]
async fn descending_order_is_preserved_across_partitions() {
    let cluster = interleaved_in(OrderSpec::new(vec![OrderTerm::desc("n")]), 2);
    let plan = scan(OrderSpec::new(vec![OrderTerm::desc("n")]));
    let mut pipeline = Pipeline::start(plan, cluster.context(config(4)))
        .await
        .expect("pipeline should start");

    let rows = drain(&mut pipeline).await.concat();

    assert_eq!(rows, ["r06", "r05", "r04", "r03", "r02", "r01"]);
}

#[tokio::test]
async fn concurrent_fetches_stay_within_the_parallelism_bound() {
    let cluster = Cluster::even(ascending(), 6);
    for i in 0..3 {
        for p in 0..6 {
            cluster.insert(&format!("p{p}"), row(6 * i + p + 1));
        }
    }
    let gauge = Arc::new(InFlightGauge {
        inner: cluster.clone(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let context = PipelineContext::new(Arc::new(cluster.clone()), gauge.clone())
        .with_config(config(4).with_max_degree_of_parallelism(2));
    let mut pipeline = Pipeline::start(scan(ascending()), context)
        .await
        .expect("pipeline should start");

    let rows = drain(&mut pipeline).await.concat();

    assert_eq!(rows, expected(1..=18));
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(cluster.requests().len(), 6);
}

#[tokio::test]
async fn a_range_no_partition_serves_yields_nothing() {
    let (cluster, range) = uncovered();
    let plan = QueryPlan::scan(range, QUERY, ascending());
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    assert!(!pipeline.has_more_results());
    assert!(
        pipeline
            .pull_next()
            .await
            .expect("empty pull should succeed")
            .is_none()
    );
    assert_eq!(pipeline.continuation().expect("token should encode"), None);
    assert!(cluster.requests().is_empty());
}

#[tokio::test]
async fn has_more_results_does_not_change_without_a_pull() {
    let cluster = interleaved(1);
    let mut pipeline = Pipeline::start(scan(ascending()), cluster.context(config(10)))
        .await
        .expect("pipeline should start");

    assert!(pipeline.has_more_results());
    assert!(pipeline.has_more_results());
    assert!(cluster.requests().is_empty());

    drain(&mut pipeline).await;

    assert!(!pipeline.has_more_results());
    assert!(!pipeline.has_more_results());
}

#[tokio::test]
async fn unordered_merge_drains_partitions_in_range_order() {
    let cluster = Cluster::even(OrderSpec::unordered(), 3);
    cluster.insert("p0", Row::new("z1"));
    cluster.insert("p0", Row::new("z2"));
    cluster.insert("p1", Row::new("a1"));
    cluster.insert("p2", Row::new("m1"));
    let mut pipeline = Pipeline::start(scan(OrderSpec::unordered()), cluster.context(config(10)))
        .await
        .expect("pipeline should start");

    let rows = drain(&mut pipeline).await.concat();

    assert_eq!(rows, ["z1", "z2", "a1", "m1"]);
}

#[tokio::test]
async fn partition_key_scans_only_touch_the_owning_partition() {
    let cluster = interleaved(2);
    let plan = QueryPlan::scan(FeedRange::PartitionKey("tenant-7".to_string()), QUERY, ascending());
    let mut pipeline = Pipeline::start(plan, cluster.context(config(10)))
        .await
        .expect("pipeline should start");

    drain(&mut pipeline).await;

    let requests = cluster.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range.lower(), requests[0].range.upper());
}

///
/// DISTINCT
///

#[tokio::test]
async fn distinct_keeps_the_first_row_of_each_key() {
    for mode in [DistinctMode::Ordered, DistinctMode::Unordered] {
        let cluster = paired_keys();
        let plan = scan(ascending()).distinct(mode, vec!["k".to_string()]);
        let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
            .await
            .expect("pipeline should start");

        let rows = drain(&mut pipeline).await.concat();

        assert_eq!(rows, ["r01", "r02", "r04", "r06"], "{mode:?}");
    }
}

#[tokio::test]
async fn distinct_without_fields_compares_whole_rows() {
    let cluster = Cluster::even(ascending(), 3);
    cluster.insert("p0", Row::new("a").with("n", 1));
    cluster.insert("p1", Row::new("b").with("n", 1));
    cluster.insert("p2", Row::new("c").with("n", 2));
    let plan = scan(ascending()).distinct(DistinctMode::Unordered, Vec::new());
    let mut pipeline = Pipeline::start(plan, cluster.context(config(10)))
        .await
        .expect("pipeline should start");

    let rows = drain(&mut pipeline).await.concat();

    assert_eq!(rows, ["a", "c"]);
}

///
/// SKIP / TAKE
///

#[tokio::test]
async fn skip_take_windows_the_merged_stream() {
    let cluster = interleaved(2);
    let plan = scan(ascending()).skip_take(2, Some(3));
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    let rows = drain(&mut pipeline).await.concat();

    assert_eq!(rows, expected(3..=5));
    assert_eq!(pipeline.continuation().expect("token should encode"), None);
}

#[tokio::test]
async fn take_zero_never_fetches() {
    let cluster = interleaved(2);
    let plan = scan(ascending()).skip_take(0, Some(0));
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    assert!(!pipeline.has_more_results());
    assert!(
        pipeline
            .pull_next()
            .await
            .expect("pull should succeed")
            .is_none()
    );
    assert!(cluster.requests().is_empty());
}

///
/// AGGREGATE
///

fn summary() -> Vec<AggregateSpec> {
    vec![
        AggregateSpec::count("count"),
        AggregateSpec::over(AggregateFunction::Sum, "n", "total"),
        AggregateSpec::over(AggregateFunction::Min, "n", "lo"),
        AggregateSpec::over(AggregateFunction::Max, "n", "hi"),
        AggregateSpec::over(AggregateFunction::Avg, "n", "mean"),
    ]
}

#[tokio::test]
async fn aggregate_folds_every_partition_into_one_row() {
    let cluster = interleaved(2);
    let plan = scan(ascending()).aggregate(summary());
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    let page = pipeline
        .pull_next()
        .await
        .expect("pull should succeed")
        .expect("aggregate should emit a row");

    assert_eq!(page.len(), 1);
    let row = &page[0];
    assert_eq!(row.id, "aggregate");
    assert_eq!(row.field("count"), &Value::Int(6));
    assert_eq!(row.field("total"), &Value::Int(21));
    assert_eq!(row.field("lo"), &Value::Int(1));
    assert_eq!(row.field("hi"), &Value::Int(6));
    assert_eq!(row.field("mean"), &Value::Float(3.5));
    assert!(page.continuation().is_none());
    assert!(
        pipeline
            .pull_next()
            .await
            .expect("pull should succeed")
            .is_none()
    );
}

#[tokio::test]
async fn aggregate_over_no_partitions_still_emits_a_row() {
    let (cluster, range) = uncovered();
    let plan = QueryPlan::scan(range, QUERY, ascending()).aggregate(summary());
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    let page = pipeline
        .pull_next()
        .await
        .expect("pull should succeed")
        .expect("aggregate should emit a row");

    assert_eq!(ids(&page), ["aggregate"]);
    assert_eq!(page[0].field("count"), &Value::Int(0));
    assert_eq!(page[0].field("total"), &Value::Null);
    assert_eq!(page[0].field("lo"), &Value::Null);
    assert_eq!(page[0].field("mean"), &Value::Null);
    assert!(cluster.requests().is_empty());
}

#[tokio::test]
async fn group_by_emits_one_row_per_key_in_key_order() {
    let cluster = Cluster::even(ascending(), 3);
    for (n, group) in [(1, "y"), (2, "x"), (3, "z"), (4, "y"), (5, "y"), (6, "x")] {
        cluster.insert(&format!("p{}", n % 3), row(n).with("g", group));
    }
    let plan = scan(ascending()).group_by(
        vec!["g".to_string()],
        vec![
            AggregateSpec::count("count"),
            AggregateSpec::over(AggregateFunction::Sum, "n", "total"),
        ],
    );
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");

    let page = pipeline
        .pull_next()
        .await
        .expect("pull should succeed")
        .expect("groups should be emitted");

    let groups: Vec<(Value, Value, Value)> = page
        .iter()
        .map(|row| {
            (
                row.field("g").clone(),
                row.field("count").clone(),
                row.field("total").clone(),
            )
        })
        .collect();
    assert_eq!(
        groups,
        vec![
            (Value::text("x"), Value::Int(2), Value::Int(8)),
            (Value::text("y"), Value::Int(3), Value::Int(10)),
            (Value::text("z"), Value::Int(1), Value::Int(3)),
        ]
    );
    assert_eq!(ids(&page), ["group:0", "group:1", "group:2"]);
}

///
/// RESUMPTION
///

#[tokio::test]
async fn every_page_boundary_resumes_to_the_same_result() {
    let desc = OrderSpec::new(vec![OrderTerm::desc("n")]);
    let cases = [
        (interleaved(3), scan(ascending())),
        (interleaved_in(desc.clone(), 3), scan(desc)),
        (
            paired_keys(),
            scan(ascending()).distinct(DistinctMode::Ordered, vec!["k".to_string()]),
        ),
        (
            paired_keys(),
            scan(ascending()).distinct(DistinctMode::Unordered, vec!["k".to_string()]),
        ),
        (interleaved(3), scan(ascending()).skip_take(1, Some(6))),
    ];

    for (cluster, plan) in cases {
        assert_resumes_at_every_page(&cluster, &plan, config(2)).await;
    }
}

#[tokio::test]
async fn tokens_are_rejected_by_a_different_plan() {
    let cluster = interleaved(2);
    let mut pipeline = Pipeline::start(scan(ascending()), cluster.context(config(2)))
        .await
        .expect("pipeline should start");
    let page = pipeline
        .pull_next()
        .await
        .expect("pull should succeed")
        .expect("first page should exist");
    let token = page.continuation().expect("first page should carry a token");

    let other = scan(ascending()).skip_take(1, None);
    let Err(err) = Pipeline::resume(other, cluster.context(config(2)), token.as_str()).await else {
        panic!("a token from another plan must be rejected");
    };

    assert!(matches!(
        err,
        PipelineError::Continuation(ContinuationError::ShapeMismatch { .. })
    ));
}

#[tokio::test]
async fn tokens_do_not_resume_under_different_skip_take_counts() {
    let cluster = interleaved(3);
    let plan = scan(ascending()).skip_take(1, Some(10));
    let mut pipeline = Pipeline::start(plan, cluster.context(config(2)))
        .await
        .expect("pipeline should start");
    let page = pipeline
        .pull_next()
        .await
        .expect("pull should succeed")
        .expect("first page should exist");
    let token = page.continuation().expect("first page should carry a token");

    let other = scan(ascending()).skip_take(5, None);
    let Err(err) = Pipeline::resume(other, cluster.context(config(2)), token.as_str()).await else {
        panic!("a token issued under other counts must be rejected");
    };

    assert!(matches!(
        err,
        PipelineError::Continuation(ContinuationError::ShapeMismatch { .. })
    ));
}
