use std::fmt;
use std::time::Duration;

use crate::report::ReportKind;

/// The periodic reporting activities run by the agent.
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    VersionCheck,
    ReportError,
    ReportCounters,
    ReportMetrics,
}

impl JobKind {
    pub const ALL: [JobKind; 4] =
        [JobKind::VersionCheck, JobKind::ReportError, JobKind::ReportCounters, JobKind::ReportMetrics];

    /// Interval used when no valid override is configured.
    #[must_use]
    pub const fn default_interval(self) -> Duration {
        match self {
            JobKind::ReportError => Duration::from_secs(60),
            JobKind::VersionCheck | JobKind::ReportCounters | JobKind::ReportMetrics => {
                Duration::from_secs(3600)
            }
        }
    }

    /// Jobs that execute once straight after `init` instead of waiting a full
    /// interval.
    #[must_use]
    pub const fn runs_on_init(self) -> bool {
        matches!(self, JobKind::VersionCheck)
    }

    /// Environment variable stem, e.g. `VERSION_CHECK`.
    #[must_use]
    pub const fn env_stem(self) -> &'static str {
        match self {
            JobKind::VersionCheck => "VERSION_CHECK",
            JobKind::ReportError => "ERROR_REPORT",
            JobKind::ReportCounters => "COUNTERS_REPORT",
            JobKind::ReportMetrics => "METRICS_REPORT",
        }
    }

    /// Collector endpoint this job reports to.
    #[must_use]
    pub const fn report_kind(self) -> ReportKind {
        match self {
            JobKind::VersionCheck => ReportKind::Version,
            JobKind::ReportError => ReportKind::Error,
            JobKind::ReportCounters => ReportKind::Counters,
            JobKind::ReportMetrics => ReportKind::Metrics,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::VersionCheck => "version-check",
            JobKind::ReportError => "report-error",
            JobKind::ReportCounters => "report-counters",
            JobKind::ReportMetrics => "report-metrics",
        })
    }
}

/// Fixed-size map with one slot per [`JobKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTable<T>([T; 4]);

impl<T> JobTable<T> {
    pub fn from_fn(f: impl FnMut(JobKind) -> T) -> Self {
        JobTable(JobKind::ALL.map(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobKind, &T)> {
        JobKind::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (JobKind, &mut T)> {
        JobKind::ALL.into_iter().zip(self.0.iter_mut())
    }
}

impl<T> std::ops::Index<JobKind> for JobTable<T> {
    type Output = T;

    fn index(&self, kind: JobKind) -> &T {
        &self.0[kind.index()]
    }
}

impl<T> std::ops::IndexMut<JobKind> for JobTable<T> {
    fn index_mut(&mut self, kind: JobKind) -> &mut T {
        &mut self.0[kind.index()]
    }
}
