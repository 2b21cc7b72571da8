mod operators;

use crate::{
    config::PipelineConfig,
    pipeline::Pipeline,
    plan::QueryPlan,
    range::FeedRange,
    row::{OrderSpec, OrderTerm, Row},
    test_support::Cluster,
};

pub(super) const QUERY: &str = "SELECT * FROM c";

pub(super) fn ascending() -> OrderSpec {
    OrderSpec::new(vec![OrderTerm::asc("n")])
}

pub(super) fn scan(order: OrderSpec) -> QueryPlan {
    QueryPlan::scan(FeedRange::full(), QUERY, order)
}

pub(super) fn config(page_size: u32) -> PipelineConfig {
    PipelineConfig::new().with_page_size(page_size)
}

pub(super) fn row(n: i64) -> Row {
    Row::new(format!("r{n:02}")).with("n", n)
}

/// Three partitions where partition `p` holds `n = 3i + p + 1`, so the
/// global order interleaves all three.
pub(super) fn interleaved(per_partition: i64) -> Cluster {
    interleaved_in(ascending(), per_partition)
}

pub(super) fn interleaved_in(order: OrderSpec, per_partition: i64) -> Cluster {
    let cluster = Cluster::even(order, 3);
    for i in 0..per_partition {
        for p in 0..3 {
            cluster.insert(&format!("p{p}"), row(3 * i + p + 1));
        }
    }

    cluster
}

/// `p0 = ["", "80")` with rows at keys either side of `"40"`, and
/// `p1 = ["80", "FF")`; odd values on `p0`, even on `p1`.
pub(super) fn splittable() -> Cluster {
    let cluster = Cluster::new(ascending(), &[("p0", "", "80"), ("p1", "80", "FF")]);
    for (key, n) in [("10", 1), ("20", 3), ("60", 5), ("70", 7)] {
        cluster.insert_at(key, row(n));
    }
    for (key, n) in [("90", 2), ("A0", 4), ("B0", 6), ("C0", 8)] {
        cluster.insert_at(key, row(n));
    }

    cluster
}

pub(super) fn ids(rows: &[Row]) -> Vec<String> {
    rows.iter().map(|row| row.id.clone()).collect()
}

pub(super) fn expected(range: std::ops::RangeInclusive<i64>) -> Vec<String> {
    range.map(|n| format!("r{n:02}")).collect()
}

/// Pull until exhausted, returning each page's row ids.
pub(super) async fn drain(pipeline: &mut Pipeline) -> Vec<Vec<String>> {
    let mut pages = Vec::new();
    while let Some(page) = pipeline.pull_next().await.expect("pull should succeed") {
        pages.push(ids(&page));
    }

    pages
}

/// Run `plan` once uninterrupted, then again stopping after every page
/// boundary and resuming a fresh pipeline from the token.
pub(super) async fn assert_resumes_at_every_page(
    cluster: &Cluster,
    plan: &QueryPlan,
    config: PipelineConfig,
) {
    let mut uninterrupted = Pipeline::start(plan.clone(), cluster.context(config))
        .await
        .expect("pipeline should start");
    let pages = drain(&mut uninterrupted).await;
    let all: Vec<String> = pages.concat();

    for stop in 1..pages.len() {
        let mut first = Pipeline::start(plan.clone(), cluster.context(config))
            .await
            .expect("pipeline should start");
        let mut seen = Vec::new();
        let mut token = None;
        for _ in 0..stop {
            let page = first
                .pull_next()
                .await
                .expect("pull should succeed")
                .expect("page should exist before the stop point");
            seen.extend(ids(&page));
            token = page.continuation().cloned();
        }
        let token = token.expect("a stopped pipeline should have a token");
        assert_eq!(
            first.continuation().expect("token should encode"),
            Some(token.clone())
        );

        let mut resumed = Pipeline::resume(plan.clone(), cluster.context(config), token.as_str())
            .await
            .expect("token should resume");
        seen.extend(drain(&mut resumed).await.concat());

        assert_eq!(seen, all, "resuming after page {stop} changed the result");
    }
}
