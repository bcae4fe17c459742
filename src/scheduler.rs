//! Fixed-delay scheduler for the reporting jobs.
//!
//! Each job is `Idle`, `Scheduled` (a timer task is pending) or `Running`.
//! Executions are started either by a timer firing or by [`Scheduler::run_now`],
//! and every execution re-arms its job for a full interval once it finishes,
//! so the next run starts `interval` after the previous one *ended*.
//!
//! A job body is invoked synchronously by whoever starts the execution; only
//! the future it returns is polled on the runtime. Bodies therefore capture
//! the state they report at the instant the execution starts.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::job::{JobKind, JobTable};
use crate::reporter::ReportError;

pub(crate) type JobFuture = BoxFuture<'static, Result<(), ReportError>>;
pub(crate) type JobBody = Box<dyn Fn() -> JobFuture + Send + Sync>;
pub(crate) type PreArmHook = Box<dyn Fn() + Send + Sync>;

/// Static description of a job, fixed at construction.
pub(crate) struct JobDescriptor {
    pub(crate) interval: Duration,
    pub(crate) enabled: bool,
    pub(crate) run_on_init: bool,
    /// Must not call back into the scheduler.
    pub(crate) body: JobBody,
    /// Called right before a fresh timer is armed, never before an immediate run.
    pub(crate) pre_arm: Option<PreArmHook>,
}

impl JobDescriptor {
    pub(crate) fn disabled() -> Self {
        JobDescriptor {
            interval: Duration::MAX,
            enabled: false,
            run_on_init: false,
            body: Box::new(|| futures::future::ok(()).boxed()),
            pre_arm: None,
        }
    }
}

pub(crate) struct Scheduler {
    jobs: JobTable<JobDescriptor>,
    state: Mutex<SchedulerState>,
    runtime: OnceLock<Handle>,
    tracker: TaskTracker,
}

#[derive(Default)]
struct SchedulerState {
    closed: bool,
    next_timer_id: u64,
    jobs: JobTable<JobState>,
}

#[derive(Default)]
struct JobState {
    running: bool,
    timer: Option<PendingTimer>,
}

struct PendingTimer {
    id: u64,
    handle: AbortHandle,
}

impl Scheduler {
    pub(crate) fn new(jobs: JobTable<JobDescriptor>) -> Self {
        Scheduler {
            jobs,
            state: Mutex::default(),
            runtime: OnceLock::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Arms every enabled job on `runtime`, running `run_on_init` jobs at once.
    ///
    /// Returns `false` if the scheduler was already started.
    pub(crate) fn start(self: &Arc<Self>, runtime: Handle) -> bool {
        if self.runtime.set(runtime).is_err() {
            return false;
        }

        let mut state = self.lock();
        for (kind, job) in self.jobs.iter() {
            match (job.enabled, job.run_on_init) {
                (false, _) => debug!(job = %kind, "Job disabled"),
                (true, true) => self.run_locked(kind, &mut state),
                (true, false) => self.arm_locked(kind, &mut state),
            }
        }

        true
    }

    /// Cancels any pending timer of `kind` and executes it immediately.
    ///
    /// If `kind` is already running the request only re-arms the job; the
    /// execution for this trigger is skipped, not queued.
    pub(crate) fn run_now(self: &Arc<Self>, kind: JobKind) {
        let mut state = self.lock();
        self.run_locked(kind, &mut state);
    }

    /// Stops all timers; no execution starts afterwards.
    ///
    /// In-flight executions are left to finish, see [`Scheduler::wait`].
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.closed = true;
        for (_, job) in state.jobs.iter_mut() {
            if let Some(timer) = job.timer.take() {
                timer.handle.abort();
            }
        }
        self.tracker.close();
    }

    /// Runs a one-off `task` alongside the jobs; refused once closed or before
    /// the scheduler is started.
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.lock();
        match (self.runtime.get(), state.closed) {
            (Some(runtime), false) => {
                self.tracker.spawn_on(task, runtime);
                true
            }
            _ => false,
        }
    }

    /// Resolves once the scheduler is closed and no execution is in flight.
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self, kind: JobKind) -> bool {
        self.lock().jobs[kind].timer.is_some()
    }

    fn run_locked(self: &Arc<Self>, kind: JobKind, state: &mut SchedulerState) {
        if state.closed || !self.jobs[kind].enabled {
            return;
        }

        if let Some(timer) = state.jobs[kind].timer.take() {
            timer.handle.abort();
        }

        match state.jobs[kind].running {
            true => {
                debug!(job = %kind, "Job already running, deferring to next interval");
                self.arm_locked(kind, state);
            }
            false => self.execute_locked(kind, state),
        }
    }

    fn fire(self: &Arc<Self>, kind: JobKind, timer_id: u64) {
        let mut state = self.lock();

        // Ignore timers that were cancelled after they had already woken up.
        if !state.jobs[kind].timer.as_ref().is_some_and(|timer| timer.id == timer_id) {
            return;
        }
        state.jobs[kind].timer = None;

        self.run_locked(kind, &mut state);
    }

    fn execute_locked(self: &Arc<Self>, kind: JobKind, state: &mut SchedulerState) {
        let Some(runtime) = self.runtime.get() else {
            return;
        };

        let job = &self.jobs[kind];
        let body = match catch_unwind(AssertUnwindSafe(|| (job.body)())) {
            Ok(body) => body,
            Err(_) => {
                error!(job = %kind, "Job panicked while starting");
                self.arm_locked(kind, state);

                return;
            }
        };

        state.jobs[kind].running = true;
        debug!(job = %kind, "Job started");

        let scheduler = Arc::clone(self);
        self.tracker.spawn_on(
            async move {
                match AssertUnwindSafe(body).catch_unwind().await {
                    Ok(Ok(())) => debug!(job = %kind, "Job finished"),
                    Ok(Err(err)) => warn!(job = %kind, %err, "Job failed"),
                    Err(_) => error!(job = %kind, "Job panicked"),
                }

                scheduler.finish(kind);
            },
            runtime,
        );
    }

    fn finish(self: &Arc<Self>, kind: JobKind) {
        let mut state = self.lock();
        state.jobs[kind].running = false;

        self.arm_locked(kind, &mut state);
    }

    fn arm_locked(self: &Arc<Self>, kind: JobKind, state: &mut SchedulerState) {
        let job = &self.jobs[kind];
        if state.closed || !job.enabled {
            return;
        }
        let Some(runtime) = self.runtime.get() else {
            return;
        };

        if let Some(timer) = state.jobs[kind].timer.take() {
            timer.handle.abort();
        }
        if let Some(pre_arm) = &job.pre_arm {
            pre_arm();
        }

        let id = state.next_timer_id;
        state.next_timer_id = id.wrapping_add(1);

        let scheduler = Arc::clone(self);
        let interval = job.interval;
        let handle = runtime
            .spawn(async move {
                tokio::time::sleep(interval).await;
                scheduler.fire(kind, id);
            })
            .abort_handle();
        state.jobs[kind].timer = Some(PendingTimer { id, handle });
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        Fail,
        Panic,
    }

    struct Probe {
        scheduler: Arc<Scheduler>,
        starts: Arc<Mutex<Vec<u64>>>,
        pre_arms: Arc<AtomicUsize>,
    }

    impl Probe {
        fn starts(&self) -> Vec<u64> {
            self.starts.lock().unwrap().clone()
        }
    }

    /// Only `ReportCounters` is enabled; its body records the second it started
    /// at and then takes `work` to finish.
    fn probe(interval: u64, work: u64, run_on_init: bool, outcome: Outcome) -> Probe {
        let origin = Instant::now();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let pre_arms = Arc::new(AtomicUsize::new(0));

        let jobs = JobTable::from_fn(|kind| match kind {
            JobKind::ReportCounters => {
                let starts = Arc::clone(&starts);
                let pre_arms = Arc::clone(&pre_arms);

                JobDescriptor {
                    interval: Duration::from_secs(interval),
                    enabled: true,
                    run_on_init,
                    body: Box::new(move || {
                        starts.lock().unwrap().push(origin.elapsed().as_secs());

                        async move {
                            tokio::time::sleep(Duration::from_secs(work)).await;
                            match outcome {
                                Outcome::Succeed => Ok(()),
                                Outcome::Fail => Err(ReportError::Status {
                                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                                    body: String::new(),
                                }),
                                Outcome::Panic => panic!("job exploded"),
                            }
                        }
                        .boxed()
                    }),
                    pre_arm: Some(Box::new(move || {
                        pre_arms.fetch_add(1, Ordering::Relaxed);
                    })),
                }
            }
            _ => JobDescriptor::disabled(),
        });

        let scheduler = Arc::new(Scheduler::new(jobs));
        assert!(scheduler.start(Handle::current()));

        Probe { scheduler, starts, pre_arms }
    }

    async fn advance_to(origin: Instant, secs: u64) {
        tokio::time::sleep_until(origin + Duration::from_millis(secs * 1000 + 500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reruns_a_fixed_delay_after_completion() {
        let origin = Instant::now();
        let probe = probe(10, 3, true, Outcome::Succeed);

        advance_to(origin, 30).await;

        assert_eq!(probe.starts(), vec![0, 13, 26]);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_job_waits_a_full_interval() {
        let origin = Instant::now();
        let probe = probe(5, 0, false, Outcome::Succeed);
        assert!(probe.scheduler.is_scheduled(JobKind::ReportCounters));

        advance_to(origin, 4).await;
        assert!(probe.starts().is_empty());

        advance_to(origin, 11).await;
        assert_eq!(probe.starts(), vec![5, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_preempts_pending_timer() {
        let origin = Instant::now();
        let probe = probe(10, 0, false, Outcome::Succeed);

        tokio::time::sleep_until(origin + Duration::from_secs(4)).await;
        probe.scheduler.run_now(JobKind::ReportCounters);

        advance_to(origin, 25).await;
        assert_eq!(probe.starts(), vec![4, 14, 24]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_while_running_only_rearms() {
        let origin = Instant::now();
        let probe = probe(10, 5, true, Outcome::Succeed);

        tokio::time::sleep_until(origin + Duration::from_secs(1)).await;
        probe.scheduler.run_now(JobKind::ReportCounters);
        probe.scheduler.run_now(JobKind::ReportCounters);

        // Completion at 5s replaces the timer armed by the skipped triggers.
        advance_to(origin, 20).await;
        assert_eq!(probe.starts(), vec![0, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_keep_the_schedule() {
        let origin = Instant::now();
        let failing = probe(10, 1, true, Outcome::Fail);
        let panicking = probe(10, 1, true, Outcome::Panic);

        advance_to(origin, 25).await;

        assert_eq!(failing.starts(), vec![0, 11, 22]);
        assert_eq!(panicking.starts(), vec![0, 11, 22]);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_arm_hook_runs_before_each_timer_only() {
        let origin = Instant::now();
        let probe = probe(10, 0, true, Outcome::Succeed);

        // The initial run is immediate, so only its completion armed a timer.
        advance_to(origin, 5).await;
        assert_eq!(probe.pre_arms.load(Ordering::Relaxed), 1);

        advance_to(origin, 15).await;
        assert_eq!(probe.starts(), vec![0, 10]);
        assert_eq!(probe.pre_arms.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_jobs_never_run() {
        let origin = Instant::now();
        let probe = probe(10, 0, false, Outcome::Succeed);

        for kind in [JobKind::VersionCheck, JobKind::ReportError, JobKind::ReportMetrics] {
            probe.scheduler.run_now(kind);
            assert!(!probe.scheduler.is_scheduled(kind));
        }

        advance_to(origin, 1).await;
        assert!(probe.starts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_timers_and_immediate_runs() {
        let origin = Instant::now();
        let probe = probe(10, 0, true, Outcome::Succeed);

        advance_to(origin, 1).await;
        probe.scheduler.close();
        assert!(!probe.scheduler.is_scheduled(JobKind::ReportCounters));

        probe.scheduler.run_now(JobKind::ReportCounters);
        advance_to(origin, 100).await;

        assert_eq!(probe.starts(), vec![0]);
        probe.scheduler.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_lets_in_flight_run_finish_without_rearm() {
        let origin = Instant::now();
        let probe = probe(10, 3, true, Outcome::Succeed);

        advance_to(origin, 1).await;
        probe.scheduler.close();
        probe.scheduler.wait().await;

        assert!(origin.elapsed() >= Duration::from_secs(3));
        assert!(!probe.scheduler.is_scheduled(JobKind::ReportCounters));

        advance_to(origin, 50).await;
        assert_eq!(probe.starts(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_only_honoured_once() {
        let probe = probe(10, 0, true, Outcome::Succeed);

        assert!(!probe.scheduler.start(Handle::current()));
    }
}
