use std::time::Duration;

use thiserror::Error;

use crate::runtime::{suspend::Unsuitable, threads::ThreadId};

/// Failures of the suspension machinery.
///
/// Most of these are fatal once they escape a `try_*` entry point: the plain
/// entry points hand them to [`fatal`](crate::runtime::fatal).
#[derive(Debug, Error)]
pub enum SafepointError {
    #[error("too many retries ({attempts}) for {cause}: {reason}")]
    RetryLimitExceeded {
        cause: &'static str,
        attempts: u32,
        reason: Unsuitable,
    },
    #[error("timed out after {waited:?} waiting for threads to suspend for {cause}: {}", format_ids(.unsuspended))]
    BarrierTimeout {
        cause: &'static str,
        waited: Duration,
        unsuspended: Vec<ThreadId>,
    },
    #[error("timed out after {waited:?} acquiring the mutator lock exclusively for {cause}")]
    MutatorLockTimeout { cause: &'static str, waited: Duration },
    #[error("empty checkpoint timeout after {waited:?}, unresponsive threads: {}", format_ids(.unresponsive))]
    EmptyCheckpointTimeout {
        waited: Duration,
        unresponsive: Vec<ThreadId>,
    },
    #[error("no thread with id {0}")]
    NoSuchThread(ThreadId),
    #[error("thread {0} is not suspended")]
    NotSuspended(ThreadId),
    #[error("out of thread ids")]
    ThreadIdsExhausted,
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

fn format_ids(ids: &[ThreadId]) -> String {
    if ids.is_empty() {
        return "<none>".to_owned();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = SafepointError> = std::result::Result<T, E>;
