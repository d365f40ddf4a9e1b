use crate::language::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Test case id used for the synthetic verdict of a failed compile step
pub const COMPILE_TEST_CASE_ID: &str = "compile";

/// Test Case Definition (Immutable Input)
/// Supplied by the question store; the judge never mutates it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    pub expected_output: String,
    /// Falls back to the language default when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub is_hidden: bool,
}

/// What the question collaborator hands back for a question id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Question {
    pub test_cases: Vec<TestCase>,
    /// Starter code keyed by language
    #[serde(default)]
    pub language_snippets: HashMap<String, String>,
}

/// Submission State Machine
///
/// pending -> running -> completed | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Completed | SubmissionStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Error => "error",
        }
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        matches!(
            (self, next),
            (SubmissionStatus::Pending, SubmissionStatus::Running)
                | (SubmissionStatus::Running, SubmissionStatus::Completed)
                | (SubmissionStatus::Running, SubmissionStatus::Error)
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one test case
///
/// Always complete: a success record, or a failure record carrying `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    pub test_case_id: String,
    pub passed: bool,
    pub execution_time_ms: u64,
    pub memory_used_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
}

impl TestVerdict {
    /// The single verdict that replaces all test cases when compilation fails
    pub fn compile_failure(diagnostic: impl Into<String>) -> Self {
        Self {
            test_case_id: COMPILE_TEST_CASE_ID.to_string(),
            passed: false,
            execution_time_ms: 0,
            memory_used_mb: 0.0,
            output: None,
            error: Some(diagnostic.into()),
            is_hidden: false,
        }
    }

    /// A failure that happened before the program produced anything
    pub fn infrastructure_failure(test_case: &TestCase, error: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case.id.clone(),
            passed: false,
            execution_time_ms: 0,
            memory_used_mb: 0.0,
            output: None,
            error: Some(error.into()),
            is_hidden: test_case.is_hidden,
        }
    }
}

/// Persisted submission record, owned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: String,
    pub question_id: String,
    pub language: Language,
    pub source_code: String,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub results: Vec<TestVerdict>,
    pub total_passed: u32,
    pub total_tests: u32,
    /// Sum of per-test wall times, meaningful once terminal
    pub execution_time_ms: u64,
    /// Peak across tests, meaningful once terminal
    pub memory_used_mb: f64,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Submission {
    pub fn new(
        user_id: impl Into<String>,
        question_id: impl Into<String>,
        language: Language,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            question_id: question_id.into(),
            language,
            source_code: source_code.into(),
            status: SubmissionStatus::Pending,
            results: Vec::new(),
            total_passed: 0,
            total_tests: 0,
            execution_time_ms: 0,
            memory_used_mb: 0.0,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }
}

/// Synchronous reply to an enqueue; the terminal status arrives later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub submission_id: Uuid,
    pub status: String,
}

impl SubmissionReceipt {
    pub fn queued(submission_id: Uuid) -> Self {
        Self {
            submission_id,
            status: "queued".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SubmissionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");

        let status: SubmissionStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(status, SubmissionStatus::Error);
    }

    #[test]
    fn test_status_transitions_are_monotone() {
        use SubmissionStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Error.can_transition_to(Completed));

        assert!(Completed.is_terminal());
        assert!(Error.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_test_case_defaults() {
        let json = r#"{"id": "1", "input": "1 2", "expected_output": "3"}"#;
        let case: TestCase = serde_json::from_str(json).unwrap();

        assert_eq!(case.timeout_ms, None);
        assert_eq!(case.memory_limit_mb, None);
        assert!(!case.is_hidden);
    }

    #[test]
    fn test_hidden_verdict_omits_output_field() {
        let verdict = TestVerdict {
            test_case_id: "7".to_string(),
            passed: true,
            execution_time_ms: 12,
            memory_used_mb: 3.5,
            output: None,
            error: None,
            is_hidden: true,
        };

        let json = serde_json::to_value(&verdict).unwrap();
        assert!(json.get("output").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["is_hidden"], true);
    }

    #[test]
    fn test_compile_failure_verdict() {
        let verdict = TestVerdict::compile_failure("main.cpp:1: error");

        assert_eq!(verdict.test_case_id, COMPILE_TEST_CASE_ID);
        assert!(!verdict.passed);
        assert_eq!(verdict.execution_time_ms, 0);
        assert_eq!(verdict.memory_used_mb, 0.0);
        assert_eq!(verdict.error.as_deref(), Some("main.cpp:1: error"));
    }

    #[test]
    fn test_new_submission_is_pending() {
        let submission = Submission::new("user-1", "two-sum", Language::Python, "print(1)");

        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert!(submission.results.is_empty());
        assert!(submission.completed_at.is_none());
        assert!(submission.started_at.is_none());
    }

    #[test]
    fn test_receipt_is_queued() {
        let id = Uuid::new_v4();
        let receipt = SubmissionReceipt::queued(id);
        assert_eq!(receipt.status, "queued");
        assert_eq!(receipt.submission_id, id);
    }
}
