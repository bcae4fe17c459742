use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{FutureExt, TryFutureExt};
use itertools::Itertools;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{ErrorAggregator, ErrorSignature};
use crate::config::{ClientIdentity, Config};
use crate::job::{JobKind, JobTable};
use crate::notification::{ListenerError, Notification, NotificationHub};
use crate::report::{
    CountersReport, ErrorReport, FeedbackReport, MetricsReport, ReportKind, VersionCheck,
    VersionCheckResponse,
};
use crate::reporter::{encode, post, HttpReporter, ReportError, Reporter};
use crate::scheduler::{JobDescriptor, JobFuture, PreArmHook, Scheduler};
use crate::snapshot::SnapshotStore;
use crate::InstallError;

/// Self-reporting agent embedded in a host process.
///
/// Build it once, [`init`](Agent::init) it once and [`close`](Agent::close)
/// it at shutdown. Nothing here ever returns background failures to the host:
/// transport and listener errors are logged and swallowed.
pub struct Agent {
    cxl: CancellationToken,
    config: Config,
    shared: Arc<Shared>,
    scheduler: Arc<Scheduler>,
    initialized: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// State read and written by the job bodies.
struct Shared {
    uplink: Option<Uplink>,
    errors: ErrorAggregator,
    snapshots: SnapshotStore,
    notifications: NotificationHub,
}

/// Present only when reporting is enabled.
struct Uplink {
    identity: ClientIdentity,
    reporter: Arc<dyn Reporter>,
}

impl Agent {
    /// Builds an agent reporting over HTTP to `config.base_url`.
    ///
    /// Cancelling `cxl` has the same effect as [`Agent::close`], minus
    /// waiting for the worker thread.
    ///
    /// # Errors
    ///
    /// Errors if the HTTP client cannot be built.
    pub fn new(cxl: CancellationToken, config: Config) -> Result<Self, InstallError> {
        let reporter = match config.collector_url() {
            Some(base_url) if config.enabled() => {
                let reporter: Arc<dyn Reporter> =
                    Arc::new(HttpReporter::new(base_url, config.request_timeout)?);
                Some(reporter)
            }
            _ => None,
        };

        Ok(Agent::build(cxl, config, reporter))
    }

    /// Builds an agent delivering reports through `reporter`.
    ///
    /// The identity and base URL in `config` still gate whether anything is
    /// reported at all.
    pub fn with_reporter(cxl: CancellationToken, config: Config, reporter: Arc<dyn Reporter>) -> Self {
        Agent::build(cxl, config, Some(reporter))
    }

    fn build(cxl: CancellationToken, config: Config, reporter: Option<Arc<dyn Reporter>>) -> Self {
        let uplink = match (config.enabled(), config.identity(), reporter) {
            (true, Some(identity), Some(reporter)) => Some(Uplink { identity, reporter }),
            _ => {
                warn!(process = %config.process, "Reporting disabled, identity or collector URL missing");
                None
            }
        };
        let shared = Arc::new(Shared {
            uplink,
            errors: ErrorAggregator::default(),
            snapshots: SnapshotStore::default(),
            notifications: NotificationHub::default(),
        });
        let jobs = JobTable::from_fn(|kind| {
            match shared.uplink.is_some() && config.job_enabled(kind) {
                true => Shared::describe(&shared, kind, &config),
                false => JobDescriptor::disabled(),
            }
        });

        Agent {
            cxl: cxl.child_token(),
            config,
            shared,
            scheduler: Arc::new(Scheduler::new(jobs)),
            initialized: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Starts the jobs on a dedicated `PhoneHome` thread.
    ///
    /// The version check runs immediately, every other job after its first
    /// interval. A disabled agent starts no thread.
    ///
    /// # Errors
    ///
    /// Errors if called twice or if the runtime thread cannot be spawned.
    pub fn init(&self) -> Result<(), InstallError> {
        if !self.begin_init()? {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let cxl = self.cxl.clone();
        let scheduler = Arc::clone(&self.scheduler);

        let worker = std::thread::Builder::new()
            .name("PhoneHome".to_string())
            .spawn(move || runtime.block_on(run_until_cancelled(cxl, scheduler)))?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);

        self.start(handle);

        Ok(())
    }

    /// Starts the jobs on a runtime owned by the host.
    ///
    /// # Errors
    ///
    /// Errors if the agent was already initialized.
    pub fn init_on(&self, runtime: &Handle) -> Result<(), InstallError> {
        if !self.begin_init()? {
            return Ok(());
        }

        runtime.spawn(run_until_cancelled(self.cxl.clone(), Arc::clone(&self.scheduler)));
        self.start(runtime.clone());

        Ok(())
    }

    /// Stops all jobs. No report starts after this returns; reports already
    /// in flight are allowed to complete.
    pub fn close(&self) {
        self.cxl.cancel();
        self.scheduler.close();

        let Some(worker) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        // Closing from a listener runs on the worker itself.
        if worker.thread().id() == std::thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("PhoneHome thread panicked");
        }
    }

    /// Records an error occurrence.
    ///
    /// The first error since the last scheduled flush triggers an immediate
    /// flush; later ones are counted into the next batch.
    pub fn accept_error(&self, err: impl Into<ErrorSignature>) {
        if self.shared.uplink.is_none()
            || !self.config.job_enabled(JobKind::ReportError)
            || self.cxl.is_cancelled()
        {
            return;
        }

        if self.shared.errors.accept(err.into()) {
            self.scheduler.run_now(JobKind::ReportError);
        }
    }

    /// Replaces the counters sent by the next counters report.
    pub fn accept_counters(&self, counters: Value) {
        self.shared.snapshots.accept_counters(counters);
    }

    /// Replaces the metrics sent by the next metrics report.
    pub fn accept_metrics(&self, metrics: Value) {
        self.shared.snapshots.accept_metrics(metrics);
    }

    /// Registers `listener` for notification changes.
    ///
    /// The listener is called right away with the current notifications
    /// (possibly none), then again after every successful version check.
    pub fn on_notifications_changed<F>(&self, listener: F)
    where
        F: Fn(&[Notification]) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.notifications.subscribe(listener);
    }

    /// Notifications returned by the latest successful version check.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.notifications.current()
    }

    /// Sends the answers to a [`FeedbackRequest`](crate::FeedbackRequest) in
    /// the background.
    pub fn send_feedback(&self, feedback_id: impl Into<String>, answers: Value) {
        let feedback_id = feedback_id.into();
        let Some(uplink) = &self.shared.uplink else {
            debug!(%feedback_id, "Reporting disabled, dropping feedback");
            return;
        };

        let body = encode(&FeedbackReport {
            id: &uplink.identity.id,
            feedback_id: &feedback_id,
            answers: &answers,
        });
        let reporter = Arc::clone(&uplink.reporter);
        let task = async move {
            match futures::future::ready(body).and_then(|body| reporter.report(ReportKind::Feedback, body)).await {
                Ok(_) => debug!(%feedback_id, "Feedback sent"),
                Err(err) => warn!(%feedback_id, %err, "Feedback report failed"),
            }
        };

        if !self.scheduler.spawn(task) {
            debug!("Agent not running, dropping feedback");
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `false` when there is nothing to start.
    fn begin_init(&self) -> Result<bool, InstallError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(InstallError::AlreadyInitialized);
        }
        if self.shared.uplink.is_none() {
            info!("Reporting disabled, no jobs scheduled");

            return Ok(false);
        }

        Ok(!self.cxl.is_cancelled())
    }

    fn start(&self, runtime: Handle) {
        let enabled = JobKind::ALL.into_iter().filter(|kind| self.config.job_enabled(*kind)).join(",");
        info!(%enabled, "Starting reporting jobs");

        self.scheduler.start(runtime);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.cxl.cancel();
    }
}

async fn run_until_cancelled(cxl: CancellationToken, scheduler: Arc<Scheduler>) {
    cxl.cancelled().await;

    scheduler.close();
    scheduler.wait().await;
    debug!("Reporting jobs stopped");
}

impl Shared {
    fn describe(shared: &Arc<Self>, kind: JobKind, config: &Config) -> JobDescriptor {
        let pre_arm: Option<PreArmHook> = match kind {
            JobKind::ReportError => {
                let shared = Arc::clone(shared);
                Some(Box::new(move || shared.errors.reset_latch()))
            }
            JobKind::VersionCheck | JobKind::ReportCounters | JobKind::ReportMetrics => None,
        };
        let body_shared = Arc::clone(shared);
        let interval = match config.job(kind).interval {
            Duration::ZERO => {
                let default = kind.default_interval();
                warn!(job = %kind, ?default, "Zero interval configured, using default");
                default
            }
            interval => interval,
        };

        JobDescriptor {
            interval,
            enabled: true,
            run_on_init: kind.runs_on_init(),
            body: Box::new(move || body_shared.run(kind)),
            pre_arm,
        }
    }

    fn run(self: &Arc<Self>, kind: JobKind) -> JobFuture {
        let Some(uplink) = &self.uplink else {
            return futures::future::ok(()).boxed();
        };

        match kind {
            JobKind::VersionCheck => self.check_version(uplink),
            JobKind::ReportError => self.report_errors(uplink),
            JobKind::ReportCounters => self.report_counters(uplink),
            JobKind::ReportMetrics => self.report_metrics(uplink),
        }
    }

    fn check_version(self: &Arc<Self>, uplink: &Uplink) -> JobFuture {
        let ClientIdentity { id, process, version } = &uplink.identity;
        let request = post(&*uplink.reporter, ReportKind::Version, &VersionCheck { id, process, version });
        let shared = Arc::clone(self);

        async move {
            let VersionCheckResponse { notifications } =
                serde_json::from_value(request.await?).map_err(ReportError::Decode)?;
            debug!(notifications = notifications.len(), "Version check completed");

            shared.notifications.replace(notifications);

            Ok(())
        }
        .boxed()
    }

    /// Takes the pending batch before anything is sent, then sends one record
    /// at a time. A failed send loses only that record's count.
    fn report_errors(&self, uplink: &Uplink) -> JobFuture {
        let batch = self.errors.take_batch();
        if batch.is_empty() {
            return futures::future::ok(()).boxed();
        }

        let ClientIdentity { id, process, version } = &uplink.identity;
        let bodies = batch
            .iter()
            .map(|record| {
                encode(&ErrorReport {
                    id,
                    process,
                    version,
                    error: record.signature.as_str(),
                    count: record.count,
                })
            })
            .collect::<Result<Vec<_>, _>>();
        debug!(
            signatures = batch.len(),
            occurrences = batch.iter().fold(0u64, |total, record| total.saturating_add(record.count)),
            "Flushing errors"
        );
        let reporter = Arc::clone(&uplink.reporter);

        async move {
            for body in bodies? {
                if let Err(err) = reporter.report(ReportKind::Error, body).await {
                    warn!(%err, "Error report failed, dropping its count");
                }
            }

            Ok(())
        }
        .boxed()
    }

    fn report_counters(&self, uplink: &Uplink) -> JobFuture {
        let Some(counters) = self.snapshots.counters() else {
            debug!("No counters accepted yet, skipping report");
            return futures::future::ok(()).boxed();
        };

        let ClientIdentity { id, process, .. } = &uplink.identity;
        post(&*uplink.reporter, ReportKind::Counters, &CountersReport { id, process, counters: &counters })
            .map_ok(|_| ())
            .boxed()
    }

    fn report_metrics(&self, uplink: &Uplink) -> JobFuture {
        let Some(metrics) = self.snapshots.metrics() else {
            debug!("No metrics accepted yet, skipping report");
            return futures::future::ok(()).boxed();
        };

        let ClientIdentity { id, process, .. } = &uplink.identity;
        post(&*uplink.reporter, ReportKind::Metrics, &MetricsReport { id, process, metrics: &metrics })
            .map_ok(|_| ())
            .boxed()
    }
}
