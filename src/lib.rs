//! Embeddable self-reporting agent.
//!
//! A host process builds an [`Agent`], feeds it errors, counters and metrics,
//! and the agent periodically reports them to a collector over HTTP. The
//! collector's answer to the version check is surfaced as [`Notification`]s.
//!
//! ```no_run
//! use phone_home::CancellationToken;
//!
//! let cxl = CancellationToken::new();
//! let agent = phone_home::install(cxl.clone(), "editor", "1.2.3").unwrap();
//!
//! agent.accept_counters(serde_json::json!({ "files_opened": 3 }));
//! agent.on_notifications_changed(|notifications| {
//!     println!("{notifications:?}");
//!     Ok(())
//! });
//!
//! agent.close();
//! ```

mod agent;
mod aggregator;
mod config;
mod job;
mod notification;
mod report;
mod reporter;
mod scheduler;
mod snapshot;
#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use aggregator::{ErrorSignature, NULL_SIGNATURE};
pub use config::{ClientIdentity, Config, JobConfig, DEFAULT_REQUEST_TIMEOUT, ENV_PREFIX};
pub use job::{JobKind, JobTable};
pub use notification::{FeedbackRequest, ListenerError, NewVersion, Notification, Question};
pub use report::{ReportKind, VersionCheckResponse};
pub use reporter::{HttpReporter, ReportError, Reporter};
use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

/// Builds an agent from the `PHONE_HOME_*` environment and starts it on its
/// own thread.
///
/// # Errors
///
/// Errors if the HTTP client or the worker thread cannot be created.
pub fn install(
    cxl: CancellationToken,
    process: impl Into<String>,
    version: impl Into<String>,
) -> Result<Agent, InstallError> {
    let agent = Agent::new(cxl, Config::from_env(process, version))?;
    agent.init()?;

    Ok(agent)
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Build HTTP client; err={0}")]
    HttpClient(#[from] ReportError),
    #[error("Spawn thread; err={0}")]
    SpawnThread(#[from] std::io::Error),
    #[error("Agent already initialized")]
    AlreadyInitialized,
}
