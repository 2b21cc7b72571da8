//! In-memory partitioned collection for tests. One `Cluster` serves as both
//! the routing resolver and the partition fetcher; topology changes made
//! through it are invisible to `resolve` until `force_refresh` or `publish`.

use crate::{
    cancel::CancelSignal,
    config::PipelineConfig,
    fetch::{FetchError, FetchErrorKind, FetchRequest, FetchResponse, PartitionFetcher},
    pipeline::PipelineContext,
    range::{EffectiveKey, PartitionRange},
    routing::{
        PartitionAssignment, PartitionId, Resolution, RoutingError, RoutingResolver,
        TopologyVersion,
    },
    row::{OrderSpec, Row},
};
use async_trait::async_trait;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

const CURSOR_PREFIX: &str = "after:";

///
/// Cluster
///

#[derive(Clone)]
pub(crate) struct Cluster {
    inner: Arc<Mutex<ClusterInner>>,
}

struct ClusterInner {
    order: OrderSpec,
    version: u64,
    partitions: BTreeMap<PartitionId, PartitionRange>,
    published: Resolution,
    rows: Vec<(EffectiveKey, Row)>,
    next_key: u32,
    gone: BTreeSet<PartitionId>,
    faults: HashMap<PartitionId, VecDeque<FetchError>>,
    cursor_rejections: HashMap<PartitionId, u32>,
    hang: Option<(PartitionId, CancelSignal)>,
    requests: Vec<FetchRequest>,
    refreshes: u32,
}

impl ClusterInner {
    fn current(&self) -> Resolution {
        let mut partitions: Vec<PartitionAssignment> = self
            .partitions
            .iter()
            .map(|(id, range)| PartitionAssignment {
                id: id.clone(),
                range: range.clone(),
            })
            .collect();
        partitions.sort_by(|a, b| a.range.cmp_start(&b.range));

        Resolution {
            version: TopologyVersion(self.version),
            partitions,
        }
    }

    fn serve(&mut self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if let Some(error) = self
            .faults
            .get_mut(&request.partition)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if self.gone.contains(&request.partition) {
            return Err(FetchError::new(
                FetchErrorKind::PartitionGone,
                format!("partition {} was removed", request.partition),
            ));
        }
        let Some(live) = self.partitions.get(&request.partition) else {
            return Err(FetchError::new(
                FetchErrorKind::StaleRouting,
                format!("partition {} no longer exists", request.partition),
            ));
        };
        if live.intersection(&request.range).as_ref() != Some(&request.range) {
            return Err(FetchError::new(
                FetchErrorKind::StaleRouting,
                format!("{} is not served by {}", request.range, request.partition),
            ));
        }
        if request.cursor.is_some()
            && let Some(remaining) = self.cursor_rejections.get_mut(&request.partition)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(FetchError::new(
                FetchErrorKind::CursorRejected,
                "continuation no longer valid",
            ));
        }

        let after = match &request.cursor {
            None => None,
            Some(cursor) => Some(self.row_after(cursor)?),
        };
        let order = &self.order;
        let mut rows: Vec<&Row> = self
            .rows
            .iter()
            .filter(|(key, _)| request.range.contains(key))
            .map(|(_, row)| row)
            .filter(|row| {
                after.as_ref().is_none_or(|after| {
                    order.compare_keys(&order.key_of(row), &order.key_of(after))
                        == Ordering::Greater
                })
            })
            .collect();
        rows.sort_by(|a, b| order.compare_rows(a, b));

        let page_size = usize::try_from(request.page_size).unwrap_or(usize::MAX);
        let more = rows.len() > page_size;
        let page: Vec<Row> = rows.into_iter().take(page_size).cloned().collect();
        let cursor = match page.last() {
            Some(last) if more => Some(format!("{CURSOR_PREFIX}{}", last.id)),
            _ => None,
        };

        Ok(FetchResponse { rows: page, cursor })
    }

    fn row_after(&self, cursor: &str) -> Result<Row, FetchError> {
        let id = cursor.strip_prefix(CURSOR_PREFIX).ok_or_else(|| {
            FetchError::new(FetchErrorKind::Malformed, format!("bad cursor {cursor}"))
        })?;

        self.rows
            .iter()
            .find(|(_, row)| row.id == id)
            .map(|(_, row)| row.clone())
            .ok_or_else(|| FetchError::new(FetchErrorKind::Malformed, format!("unknown row {id}")))
    }
}

impl Cluster {
    /// Partitions given as `(id, lower, upper)` half-open ranges.
    pub(crate) fn new(order: OrderSpec, layout: &[(&str, &str, &str)]) -> Self {
        let partitions: BTreeMap<PartitionId, PartitionRange> = layout
            .iter()
            .map(|(id, lower, upper)| {
                (
                    PartitionId::new(*id),
                    PartitionRange::half_open(*lower, *upper)
                        .expect("test partition range should be valid"),
                )
            })
            .collect();
        let mut inner = ClusterInner {
            order,
            version: 1,
            partitions,
            published: Resolution {
                version: TopologyVersion(0),
                partitions: Vec::new(),
            },
            rows: Vec::new(),
            next_key: 0,
            gone: BTreeSet::new(),
            faults: HashMap::new(),
            cursor_rejections: HashMap::new(),
            hang: None,
            requests: Vec::new(),
            refreshes: 0,
        };
        inner.published = inner.current();

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// `count` equal partitions `p0..` covering the full key space.
    pub(crate) fn even(order: OrderSpec, count: usize) -> Self {
        let bound = |i: usize| match i {
            0 => String::new(),
            i if i == count => "FF".to_string(),
            i => format!("{:02X}", i * 256 / count),
        };
        let layout: Vec<(String, String, String)> = (0..count)
            .map(|i| (format!("p{i}"), bound(i), bound(i + 1)))
            .collect();
        let borrowed: Vec<(&str, &str, &str)> = layout
            .iter()
            .map(|(id, lower, upper)| (id.as_str(), lower.as_str(), upper.as_str()))
            .collect();

        Self::new(order, &borrowed)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterInner> {
        self.inner.lock().expect("cluster lock should not be poisoned")
    }

    pub(crate) fn context(&self, config: PipelineConfig) -> PipelineContext {
        PipelineContext::new(Arc::new(self.clone()), Arc::new(self.clone())).with_config(config)
    }

    /// Store `row` at an explicit effective key.
    pub(crate) fn insert_at(&self, key: &str, row: Row) {
        self.lock().rows.push((EffectiveKey::new(key), row));
    }

    /// Store `row` somewhere inside `partition`'s current range.
    pub(crate) fn insert(&self, partition: &str, row: Row) {
        let mut inner = self.lock();
        let range = inner
            .partitions
            .get(&PartitionId::new(partition))
            .expect("test partition should exist")
            .clone();
        inner.next_key += 1;
        let key = EffectiveKey::new(format!("{}{:06X}", range.lower(), inner.next_key));
        assert!(range.contains(&key), "generated key must fall inside {range}");
        inner.rows.push((key, row));
    }

    /// Split `partition` at `at` into `{partition}a` and `{partition}b`.
    /// The resolver keeps serving the old map until refreshed.
    pub(crate) fn split(&self, partition: &str, at: &str) -> (PartitionId, PartitionId) {
        let mut inner = self.lock();
        let id = PartitionId::new(partition);
        let range = inner
            .partitions
            .remove(&id)
            .expect("split partition should exist");
        let left = PartitionId::new(format!("{partition}a"));
        let right = PartitionId::new(format!("{partition}b"));
        let lower = PartitionRange::half_open(range.lower().as_str(), at)
            .expect("split point should be above lower bound");
        let upper = PartitionRange::half_open(at, range.upper().as_str())
            .expect("split point should be below upper bound");
        inner.partitions.insert(left.clone(), lower);
        inner.partitions.insert(right.clone(), upper);
        inner.version += 1;

        (left, right)
    }

    /// Remove `partition` without a successor; its fetches report it gone.
    pub(crate) fn retire(&self, partition: &str) {
        let mut inner = self.lock();
        let id = PartitionId::new(partition);
        inner.partitions.remove(&id);
        inner.gone.insert(id);
        inner.version += 1;
    }

    /// Make the current topology visible to `resolve`.
    pub(crate) fn publish(&self) {
        let mut inner = self.lock();
        inner.published = inner.current();
    }

    pub(crate) fn fail_next(&self, partition: &str, error: FetchError) {
        self.lock()
            .faults
            .entry(PartitionId::new(partition))
            .or_default()
            .push_back(error);
    }

    pub(crate) fn reject_cursors(&self, partition: &str, times: u32) {
        self.lock()
            .cursor_rejections
            .insert(PartitionId::new(partition), times);
    }

    /// The next fetch against `partition` trips `signal` and never completes.
    pub(crate) fn hang_and_cancel(&self, partition: &str, signal: CancelSignal) {
        self.lock().hang = Some((PartitionId::new(partition), signal));
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.lock().requests.clone()
    }

    pub(crate) fn refreshes(&self) -> u32 {
        self.lock().refreshes
    }
}

#[async_trait]
impl RoutingResolver for Cluster {
    async fn resolve(&self, range: &PartitionRange) -> Result<Resolution, RoutingError> {
        let inner = self.lock();

        Ok(Resolution {
            version: inner.published.version,
            partitions: inner
                .published
                .partitions
                .iter()
                .filter(|assignment| assignment.range.overlaps(range))
                .cloned()
                .collect(),
        })
    }

    async fn force_refresh(&self, _range: &PartitionRange) -> Result<(), RoutingError> {
        let mut inner = self.lock();
        inner.refreshes += 1;
        inner.published = inner.current();

        Ok(())
    }
}

#[async_trait]
impl PartitionFetcher for Cluster {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let hang = {
            let mut inner = self.lock();
            inner.requests.push(request.clone());
            match inner.hang.take() {
                Some((partition, signal)) if partition == request.partition => Some(signal),
                other => {
                    inner.hang = other;
                    None
                }
            }
        };
        if let Some(signal) = hang {
            signal.cancel();
            std::future::pending::<()>().await;
        }

        self.lock().serve(&request)
    }
}
