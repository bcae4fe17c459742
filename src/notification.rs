use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

/// Error a listener may hand back; it is logged and otherwise ignored.
pub type ListenerError = anyhow::Error;

pub(crate) type Listener = Arc<dyn Fn(&[Notification]) -> Result<(), ListenerError> + Send + Sync>;

/// Item returned by the collector in response to a version check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notification {
    NewVersion(NewVersion),
    FeedbackRequest(FeedbackRequest),
}

/// A newer release of the host application is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVersion {
    pub name: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// The collector would like the user to answer a few questions.
///
/// Answers are submitted with [`Agent::send_feedback`](crate::Agent::send_feedback)
/// using [`FeedbackRequest::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub id: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// Collector defined question; its structure is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Question(pub Value);

/// Holds the latest notifications and fans changes out to listeners.
#[derive(Default)]
pub(crate) struct NotificationHub {
    inner: Mutex<HubState>,
}

struct HubState {
    current: Arc<[Notification]>,
    listeners: Vec<Listener>,
}

impl Default for HubState {
    fn default() -> Self {
        HubState { current: Arc::from(Vec::new()), listeners: Vec::new() }
    }
}

impl NotificationHub {
    /// Registers `listener` and immediately calls it with the current state.
    pub(crate) fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&[Notification]) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let current = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.push(Arc::clone(&listener));

            Arc::clone(&inner.current)
        };

        deliver(&listener, &current);
    }

    /// Replaces the held notifications and notifies every listener.
    pub(crate) fn replace(&self, notifications: Vec<Notification>) {
        for notification in &notifications {
            match notification {
                Notification::NewVersion(NewVersion { name, version, .. }) => {
                    debug!(%name, %version, "New version available");
                }
                Notification::FeedbackRequest(FeedbackRequest { id, questions }) => {
                    debug!(%id, questions = questions.len(), "Feedback requested");
                }
            }
        }

        let (current, listeners) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.current = notifications.into();

            (Arc::clone(&inner.current), inner.listeners.clone())
        };

        for listener in &listeners {
            deliver(listener, &current);
        }
    }

    pub(crate) fn current(&self) -> Vec<Notification> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).current.to_vec()
    }
}

fn deliver(listener: &Listener, notifications: &[Notification]) {
    match catch_unwind(AssertUnwindSafe(|| listener(notifications))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?err, "Notification listener failed"),
        Err(_) => error!("Notification listener panicked"),
    }
}
