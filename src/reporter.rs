use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::report::ReportKind;

/// Transport used to deliver reports to the collector.
///
/// Implementations send `body` as JSON to the endpoint for `kind` and return
/// the parsed response (an empty object when the collector sent no body).
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, kind: ReportKind, body: Value) -> BoxFuture<'static, Result<Value, ReportError>>;
}

/// Possible failure while delivering a report.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Failed to serialize the request body.
    #[error("Encode body; err={0}")]
    Encode(#[source] serde_json::Error),
    /// Failed to build the client or send the request.
    #[error("Send request; err={0}")]
    Request(#[from] reqwest::Error),
    /// Collector answered with a non-success status.
    #[error("Collector rejected report; status={status}; body={body}")]
    Status { status: StatusCode, body: String },
    /// Collector answered with a body that is not valid for the endpoint.
    #[error("Decode response; err={0}")]
    Decode(#[source] serde_json::Error),
}

pub(crate) fn encode<T: Serialize>(body: &T) -> Result<Value, ReportError> {
    serde_json::to_value(body).map_err(ReportError::Encode)
}

/// Serializes `body` up front so the returned future owns everything it needs.
pub(crate) fn post<R, T>(
    reporter: &R,
    kind: ReportKind,
    body: &T,
) -> BoxFuture<'static, Result<Value, ReportError>>
where
    R: Reporter + ?Sized,
    T: Serialize,
{
    match encode(body) {
        Ok(body) => reporter.report(kind, body),
        Err(err) => futures::future::ready(Err(err)).boxed(),
    }
}

/// [`Reporter`] posting JSON over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: Client,
    base_url: String,
}

impl HttpReporter {
    /// # Errors
    ///
    /// Errors if the underlying HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ReportError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(HttpReporter { client, base_url: base_url.into() })
    }

    fn endpoint(&self, kind: ReportKind) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), kind.path())
    }
}

impl Reporter for HttpReporter {
    fn report(&self, kind: ReportKind, body: Value) -> BoxFuture<'static, Result<Value, ReportError>> {
        let request = self.client.post(self.endpoint(kind)).json(&body);

        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();

                return Err(ReportError::Status { status, body });
            }

            let bytes = response.bytes().await?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Value::Object(Map::new()));
            }

            serde_json::from_slice(&bytes).map_err(ReportError::Decode)
        }
        .boxed()
    }
}
