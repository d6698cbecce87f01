//! Error taxonomy. §7.
//!
//! Most outcomes in this crate are expected control flow, not defects —
//! `FailedNoMerges`, `FailedMalloc`, `Cancelled` and friends are branched on
//! by the coordinator every search step, so they live in
//! [`crate::minimiser::MinimiseOutcome`] rather than here. This enum covers
//! the handful of truly exceptional, process-terminating conditions.

use thiserror::Error;

/// Stable error codes, mirrored on [`SorterError`] variants, for host-side
/// diagnostics and the exit status word (§6 Outputs item b).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SorterErrorCode {
    WorkerUnresponsive = 1,
    RouterAllocFailed = 2,
    BaselineFailed = 3,
    InternalInvariantViolated = 4,
}

impl SorterErrorCode {
    pub const fn name(self) -> &'static str {
        match self {
            SorterErrorCode::WorkerUnresponsive => "WorkerUnresponsive",
            SorterErrorCode::RouterAllocFailed => "RouterAllocFailed",
            SorterErrorCode::BaselineFailed => "BaselineFailed",
            SorterErrorCode::InternalInvariantViolated => "InternalInvariantViolated",
        }
    }
}

/// Fatal (process-terminating) coordinator errors. Anything else is
/// resolved internally inside the search loop.
#[derive(Debug, Error)]
pub enum SorterError {
    #[error("worker slot {slot} did not reach Prepared before the bootstrap timeout")]
    WorkerUnresponsive { slot: usize },

    #[error("router rejected the final table install ({requested} entries, capacity {capacity})")]
    RouterAllocFailed { requested: usize, capacity: usize },

    #[error("baseline attempt (N=0) failed; chip cannot route without bit-fields")]
    BaselineFailed,

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(String),
}

impl SorterError {
    pub const fn code(&self) -> SorterErrorCode {
        match self {
            SorterError::WorkerUnresponsive { .. } => SorterErrorCode::WorkerUnresponsive,
            SorterError::RouterAllocFailed { .. } => SorterErrorCode::RouterAllocFailed,
            SorterError::BaselineFailed => SorterErrorCode::BaselineFailed,
            SorterError::InternalInvariantViolated(_) => {
                SorterErrorCode::InternalInvariantViolated
            }
        }
    }
}

/// Exit status word published to the host (§6 Outputs item b).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitStatus {
    ExitedCleanly,
    ExitMalloc,
    ExitFail,
    SwErr,
}

impl From<&SorterError> for ExitStatus {
    fn from(err: &SorterError) -> Self {
        match err {
            SorterError::InternalInvariantViolated(_) => ExitStatus::SwErr,
            _ => ExitStatus::ExitFail,
        }
    }
}

pub type SorterResult<T> = Result<T, SorterError>;
