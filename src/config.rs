use std::time::Duration;

use tracing::warn;

use crate::job::{JobKind, JobTable};

/// Prefix shared by every environment variable read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "PHONE_HOME_";

/// Transport timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Who is reporting; fixed for the lifetime of an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub process: String,
    pub version: String,
}

/// Scheduling settings of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobConfig {
    /// Delay between the end of one run and the start of the next.
    pub interval: Duration,
    pub disabled: bool,
}

/// Agent configuration, resolved once before the agent is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Identity token; reporting is disabled without it.
    pub id: Option<String>,
    /// Collector base URL (e.g., `https://telemetry.example.com`); reporting
    /// is disabled without it.
    pub base_url: Option<String>,
    /// Name of the host process.
    pub process: String,
    /// Version of the host process.
    pub version: String,
    pub jobs: JobTable<JobConfig>,
    /// Upper bound for every request to the collector.
    pub request_timeout: Duration,
}

impl Config {
    /// Default configuration; reporting stays disabled until both `id` and
    /// `base_url` are set.
    pub fn new(process: impl Into<String>, version: impl Into<String>) -> Self {
        Config {
            id: None,
            base_url: None,
            process: process.into(),
            version: version.into(),
            jobs: JobTable::from_fn(|kind| JobConfig {
                interval: kind.default_interval(),
                disabled: false,
            }),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Resolves the configuration from the process environment.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `PHONE_HOME_ID` | identity token |
    /// | `PHONE_HOME_URL` | collector base URL |
    /// | `PHONE_HOME_<JOB>_INTERVAL` | interval override in seconds |
    /// | `PHONE_HOME_<JOB>_DISABLED` | `1`/`true`/`yes`/`on` disables the job |
    /// | `PHONE_HOME_REQUEST_TIMEOUT` | transport timeout in seconds |
    ///
    /// `<JOB>` is one of `VERSION_CHECK`, `ERROR_REPORT`, `COUNTERS_REPORT`,
    /// `METRICS_REPORT`.
    pub fn from_env(process: impl Into<String>, version: impl Into<String>) -> Self {
        Self::from_lookup(process, version, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] but reads variables through `lookup`.
    ///
    /// Malformed values never fail: they are logged and replaced by defaults.
    pub fn from_lookup<F>(process: impl Into<String>, version: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Config::new(process, version);
        config.id = var("ID");
        config.base_url = var("URL");
        for (kind, job) in config.jobs.iter_mut() {
            let stem = kind.env_stem();
            job.interval = parse_seconds(
                &format!("{ENV_PREFIX}{stem}_INTERVAL"),
                var(&format!("{stem}_INTERVAL")),
                kind.default_interval(),
            );
            job.disabled = var(&format!("{stem}_DISABLED")).is_some_and(|raw| parse_flag(&raw));
        }
        config.request_timeout = parse_seconds(
            &format!("{ENV_PREFIX}REQUEST_TIMEOUT"),
            var("REQUEST_TIMEOUT"),
            DEFAULT_REQUEST_TIMEOUT,
        );

        config
    }

    #[must_use]
    pub fn with_collector(mut self, id: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_interval(mut self, kind: JobKind, interval: Duration) -> Self {
        self.jobs[kind].interval = interval;
        self
    }

    #[must_use]
    pub fn with_disabled(mut self, kind: JobKind) -> Self {
        self.jobs[kind].disabled = true;
        self
    }

    /// Reporting requires both an identity and a collector address.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.identity().is_some() && self.collector_url().is_some()
    }

    /// Whether `kind` may ever run for an agent built from this config.
    #[must_use]
    pub fn job_enabled(&self, kind: JobKind) -> bool {
        self.enabled() && !self.jobs[kind].disabled
    }

    #[must_use]
    pub fn job(&self, kind: JobKind) -> JobConfig {
        self.jobs[kind]
    }

    /// Identity reported with every request, if an id is configured.
    #[must_use]
    pub fn identity(&self) -> Option<ClientIdentity> {
        let id = self.id.as_deref().filter(|id| !id.is_empty())?;

        Some(ClientIdentity {
            id: id.to_string(),
            process: self.process.clone(),
            version: self.version.clone(),
        })
    }

    pub(crate) fn collector_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|url| !url.is_empty())
    }
}

fn parse_seconds(name: &str, raw: Option<String>, default: Duration) -> Duration {
    let Some(raw) = raw else {
        return default;
    };

    match raw.parse::<u64>() {
        Ok(0) => {
            warn!(variable = name, ?default, "Zero interval configured, using default");
            default
        }
        Ok(secs) => Duration::from_secs(secs),
        Err(err) => {
            warn!(variable = name, %raw, %err, ?default, "Invalid interval configured, using default");
            default
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    ["1", "true", "yes", "on"].iter().any(|truthy| raw.eq_ignore_ascii_case(truthy))
}
