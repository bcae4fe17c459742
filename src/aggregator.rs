use std::backtrace::BacktraceStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use itertools::Itertools;

/// Signature used for absent errors.
pub const NULL_SIGNATURE: &str = "null";

/// Normalised identity of an accepted error.
///
/// Errors are aggregated by exact signature: two errors carrying the same
/// message but captured at different call sites stay separate records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Prefers the captured backtrace, falling back to the full cause chain.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let backtrace = err.backtrace();
        match backtrace.status() {
            BacktraceStatus::Captured => ErrorSignature(format!("{err:#}\n{backtrace}")),
            _ => ErrorSignature(format!("{err:#}")),
        }
    }

    /// Display form of `err` followed by each of its sources.
    #[must_use]
    pub fn from_std_error(err: &(dyn std::error::Error + 'static)) -> Self {
        ErrorSignature(std::iter::successors(Some(err), |err| err.source()).join(": "))
    }

    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        ErrorSignature(message.into())
    }

    #[must_use]
    pub fn null() -> Self {
        ErrorSignature(NULL_SIGNATURE.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&anyhow::Error> for ErrorSignature {
    fn from(err: &anyhow::Error) -> Self {
        ErrorSignature::from_error(err)
    }
}

impl From<anyhow::Error> for ErrorSignature {
    fn from(err: anyhow::Error) -> Self {
        ErrorSignature::from_error(&err)
    }
}

impl From<&(dyn std::error::Error + 'static)> for ErrorSignature {
    fn from(err: &(dyn std::error::Error + 'static)) -> Self {
        ErrorSignature::from_std_error(err)
    }
}

impl From<&str> for ErrorSignature {
    fn from(message: &str) -> Self {
        ErrorSignature::from_message(message)
    }
}

impl From<String> for ErrorSignature {
    fn from(message: String) -> Self {
        ErrorSignature::from_message(message)
    }
}

impl<E> From<Option<E>> for ErrorSignature
where
    E: Into<ErrorSignature>,
{
    fn from(err: Option<E>) -> Self {
        err.map_or_else(ErrorSignature::null, Into::into)
    }
}

/// One distinct signature and how often it was seen in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorRecord {
    pub(crate) signature: ErrorSignature,
    pub(crate) count: u64,
}

/// Deduplicates accepted errors until the next flush takes them.
#[derive(Debug, Default)]
pub(crate) struct ErrorAggregator {
    pending: Mutex<HashMap<ErrorSignature, u64>>,
    latched: AtomicBool,
}

impl ErrorAggregator {
    /// Counts `signature`.
    ///
    /// Returns `true` for the first error since the latch was last reset; the
    /// caller uses this to trigger an immediate flush.
    pub(crate) fn accept(&self, signature: ErrorSignature) -> bool {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.entry(signature) {
                Entry::Occupied(entry) => {
                    let count = entry.into_mut();
                    *count = count.saturating_add(1);
                }
                Entry::Vacant(entry) => {
                    entry.insert(1);
                }
            }
        }

        !self.latched.swap(true, Ordering::AcqRel)
    }

    /// Takes every pending record, leaving an empty batch behind.
    pub(crate) fn take_batch(&self) -> Vec<ErrorRecord> {
        let pending =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        pending.into_iter().map(|(signature, count)| ErrorRecord { signature, count }).collect()
    }

    pub(crate) fn reset_latch(&self) {
        self.latched.store(false, Ordering::Release);
    }
}
