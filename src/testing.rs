use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::report::ReportKind;
use crate::reporter::{ReportError, Reporter};

/// A report as seen by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub(crate) kind: ReportKind,
    pub(crate) body: Value,
    /// Time since the reporter was created.
    pub(crate) at: Duration,
}

/// In-memory collector that records every report and answers from a script.
pub(crate) struct RecordingReporter {
    origin: Instant,
    latency: Duration,
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    scripted: HashMap<ReportKind, VecDeque<Result<Value, StatusCode>>>,
}

impl RecordingReporter {
    pub(crate) fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub(crate) fn with_latency(latency: Duration) -> Self {
        RecordingReporter { origin: Instant::now(), latency, inner: Mutex::default() }
    }

    /// Queues the response for the next report of `kind`.
    pub(crate) fn respond(&self, kind: ReportKind, response: Result<Value, StatusCode>) {
        self.inner.lock().unwrap().scripted.entry(kind).or_default().push_back(response);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub(crate) fn calls_of(&self, kind: ReportKind) -> Vec<Call> {
        self.calls().into_iter().filter(|call| call.kind == kind).collect()
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, kind: ReportKind, body: Value) -> BoxFuture<'static, Result<Value, ReportError>> {
        let response = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call { kind, body, at: self.origin.elapsed() });

            inner.scripted.get_mut(&kind).and_then(VecDeque::pop_front).unwrap_or_else(|| {
                Ok(match kind {
                    ReportKind::Version => json!({ "notifications": [] }),
                    _ => json!({}),
                })
            })
        };
        let latency = self.latency;

        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            response.map_err(|status| ReportError::Status { status, body: String::new() })
        }
        .boxed()
    }
}
