//! Module: failure
//! Responsibility: classify per-partition fetch errors and choose recovery.
//! Does not own: executing the recovery; fetch nodes retry, merge stages
//! splice replacement nodes.

use crate::{
    config::RetryPolicy,
    fetch::{FetchError, FetchErrorKind},
};
use std::{fmt, time::Duration};

///
/// FailureClass
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Retry the same request after a backoff; topology unchanged.
    Throttled,

    /// The partition is no longer addressable as requested; re-resolve.
    StaleRouting,

    /// The partition is gone; finished only if nothing replaces it.
    PartitionGone,

    /// The partition-local cursor is not accepted; replay from range start.
    CursorRejected,

    /// Aborts the whole pull.
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Throttled => "throttled",
            Self::StaleRouting => "stale_routing",
            Self::PartitionGone => "partition_gone",
            Self::CursorRejected => "cursor_rejected",
            Self::Fatal => "fatal",
        };
        write!(f, "{label}")
    }
}

///
/// RecoveryAction
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryAction {
    Retry { delay: Duration },
    RestartFromRangeStart,
    RefreshTopology { confirm_gone: bool },
    Abort { cause: AbortCause },
}

///
/// AbortCause
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortCause {
    Fatal,
    RetryBudgetExhausted { class: FailureClass, attempts: u32 },
    TopologyRefreshBudgetExhausted { refreshes: u32 },
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => f.write_str("fatal"),
            Self::RetryBudgetExhausted { class, attempts } => {
                write!(f, "retry budget exhausted after {attempts} attempts ({class})")
            }
            Self::TopologyRefreshBudgetExhausted { refreshes } => {
                write!(f, "topology refreshed {refreshes} times within one pull")
            }
        }
    }
}

///
/// FailureClassifier
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FailureClassifier {
    policy: RetryPolicy,
}

impl FailureClassifier {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn classify(kind: FetchErrorKind) -> FailureClass {
        match kind {
            FetchErrorKind::Throttled => FailureClass::Throttled,
            FetchErrorKind::StaleRouting => FailureClass::StaleRouting,
            FetchErrorKind::PartitionGone => FailureClass::PartitionGone,
            FetchErrorKind::CursorRejected => FailureClass::CursorRejected,
            FetchErrorKind::Malformed | FetchErrorKind::Unauthorized | FetchErrorKind::Internal => {
                FailureClass::Fatal
            }
        }
    }

    /// Choose recovery for the `attempt`-th consecutive failure (1-based)
    /// of one fetch.
    #[must_use]
    pub fn recovery(&self, error: &FetchError, attempt: u32) -> RecoveryAction {
        let class = Self::classify(error.kind);
        if class == FailureClass::Fatal {
            return RecoveryAction::Abort {
                cause: AbortCause::Fatal,
            };
        }
        if attempt >= self.policy.max_attempts {
            return RecoveryAction::Abort {
                cause: AbortCause::RetryBudgetExhausted {
                    class,
                    attempts: attempt,
                },
            };
        }

        match class {
            FailureClass::Throttled => {
                let delay = error
                    .retry_after
                    .unwrap_or_else(|| self.policy.backoff_for(attempt))
                    .min(self.policy.max_backoff);

                RecoveryAction::Retry { delay }
            }
            FailureClass::CursorRejected => RecoveryAction::RestartFromRangeStart,
            FailureClass::StaleRouting => RecoveryAction::RefreshTopology {
                confirm_gone: false,
            },
            FailureClass::PartitionGone => RecoveryAction::RefreshTopology { confirm_gone: true },
            FailureClass::Fatal => RecoveryAction::Abort {
                cause: AbortCause::Fatal,
            },
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

///
/// TESTS
///
