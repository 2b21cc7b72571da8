use std::time::Duration;

///
/// RetryPolicy
///
/// Attempt budget and exponential backoff curve for per-partition retries.
/// Delay of attempt `n` (1-based) is `initial_backoff * multiplier^(n-1)`,
/// capped at `max_backoff`.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
    pub const DEFAULT_MULTIPLIER: u32 = 2;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            multiplier: Self::DEFAULT_MULTIPLIER,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);

        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

///
/// PipelineConfig
///
/// Execution knobs handed to the pipeline by the embedding client.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelineConfig {
    /// Maximum rows per page surfaced by the merge stage and requested per fetch.
    pub page_size: u32,

    /// Maximum concurrent partition fetches within one pull.
    pub max_degree_of_parallelism: usize,

    /// Topology refreshes allowed within one pull before it fails.
    pub max_topology_refreshes: u32,

    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub const DEFAULT_PAGE_SIZE: u32 = 100;
    pub const DEFAULT_MAX_DEGREE_OF_PARALLELISM: usize = 8;
    pub const DEFAULT_MAX_TOPOLOGY_REFRESHES: u32 = 8;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_degree_of_parallelism: Self::DEFAULT_MAX_DEGREE_OF_PARALLELISM,
            max_topology_refreshes: Self::DEFAULT_MAX_TOPOLOGY_REFRESHES,
            retry: RetryPolicy::new(),
        }
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_max_degree_of_parallelism(mut self, dop: usize) -> Self {
        self.max_degree_of_parallelism = dop;
        self
    }

    #[must_use]
    pub const fn with_max_topology_refreshes(mut self, refreshes: u32) -> Self {
        self.max_topology_refreshes = refreshes;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // Zero would stall the pipeline; clamp to one.
    pub(crate) fn effective_page_size(&self) -> usize {
        usize::try_from(self.page_size.max(1)).unwrap_or(usize::MAX)
    }

    pub(crate) fn effective_parallelism(&self) -> usize {
        self.max_degree_of_parallelism.max(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

///
/// TESTS
///
