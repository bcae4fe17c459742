//! Wire contract with the collector.
//!
//! Every report is a JSON `POST` to `{base_url}/report/{kind}`. Requests are
//! serialized from the borrowed types below; only the version check expects
//! a meaningful response body.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notification::Notification;

/// Collector endpoint a report is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Version,
    Error,
    Counters,
    Metrics,
    Feedback,
}

impl ReportKind {
    /// Path relative to the collector base URL.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            ReportKind::Version => "report/version",
            ReportKind::Error => "report/error",
            ReportKind::Counters => "report/counters",
            ReportKind::Metrics => "report/metrics",
            ReportKind::Feedback => "report/feedback",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReportKind::Version => "version",
            ReportKind::Error => "error",
            ReportKind::Counters => "counters",
            ReportKind::Metrics => "metrics",
            ReportKind::Feedback => "feedback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct VersionCheck<'a> {
    pub(crate) id: &'a str,
    pub(crate) process: &'a str,
    pub(crate) version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ErrorReport<'a> {
    pub(crate) id: &'a str,
    pub(crate) process: &'a str,
    pub(crate) version: &'a str,
    pub(crate) error: &'a str,
    pub(crate) count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct CountersReport<'a> {
    pub(crate) id: &'a str,
    pub(crate) process: &'a str,
    pub(crate) counters: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct MetricsReport<'a> {
    pub(crate) id: &'a str,
    pub(crate) process: &'a str,
    pub(crate) metrics: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct FeedbackReport<'a> {
    pub(crate) id: &'a str,
    #[serde(rename = "feedbackId")]
    pub(crate) feedback_id: &'a str,
    pub(crate) answers: &'a Value,
}

/// Body returned by the `version` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionCheckResponse {
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

#[cfg(test)]
mod tests {
    use expect_test::expect;
    use serde_json::json;

    use super::*;

    #[test]
    fn serialize_version_check() {
        let body = VersionCheck { id: "abc", process: "editor", version: "1.2.3" };

        expect![[r#"
            {
              "id": "abc",
              "process": "editor",
              "version": "1.2.3"
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&body).unwrap());
    }

    #[test]
    fn serialize_error_report() {
        let body = ErrorReport {
            id: "abc",
            process: "editor",
            version: "1.2.3",
            error: "boom\n   0: editor::main",
            count: 9,
        };

        expect![[r#"
            {
              "id": "abc",
              "process": "editor",
              "version": "1.2.3",
              "error": "boom\n   0: editor::main",
              "count": 9
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&body).unwrap());
    }

    #[test]
    fn serialize_counters_report() {
        let counters = json!({ "foo1": "bar1" });
        let body = CountersReport { id: "abc", process: "editor", counters: &counters };

        expect![[r#"
            {
              "id": "abc",
              "process": "editor",
              "counters": {
                "foo1": "bar1"
              }
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&body).unwrap());
    }

    #[test]
    fn serialize_feedback_report() {
        let answers = json!([1, "yes"]);
        let body = FeedbackReport { id: "abc", feedback_id: "survey-7", answers: &answers };

        expect![[r#"
            {
              "id": "abc",
              "feedbackId": "survey-7",
              "answers": [
                1,
                "yes"
              ]
            }"#]]
        .assert_eq(&serde_json::to_string_pretty(&body).unwrap());
    }

    #[test]
    fn empty_version_response() {
        let response: VersionCheckResponse = serde_json::from_str("{}").unwrap();

        assert!(response.notifications.is_empty());
    }

    #[test]
    fn report_paths() {
        expect!["report/version report/error report/counters report/metrics report/feedback"]
            .assert_eq(
                &[
                    ReportKind::Version,
                    ReportKind::Error,
                    ReportKind::Counters,
                    ReportKind::Metrics,
                    ReportKind::Feedback,
                ]
                .map(ReportKind::path)
                .join(" "),
            );
        expect!["version error counters metrics feedback"].assert_eq(
            &[
                ReportKind::Version,
                ReportKind::Error,
                ReportKind::Counters,
                ReportKind::Metrics,
                ReportKind::Feedback,
            ]
            .map(|kind| kind.to_string())
            .join(" "),
        );
    }
}
