use arbiter_common::{SubmissionStatus, TestVerdict};

/// Submission-level totals folded from per-test verdicts
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub total_tests: u32,
    pub total_passed: u32,
    /// Sum of per-test wall times, even when tests overlapped
    pub execution_time_ms: u64,
    /// Peak across tests, 0 when there are none
    pub memory_used_mb: f64,
    pub final_status: SubmissionStatus,
}

/// Fold verdicts into totals
///
/// A submission that ran is `Completed` however many tests failed; `Error`
/// belongs to pipeline failures and is never produced here.
pub fn aggregate(verdicts: &[TestVerdict]) -> Aggregate {
    Aggregate {
        total_tests: verdicts.len() as u32,
        total_passed: verdicts.iter().filter(|v| v.passed).count() as u32,
        execution_time_ms: verdicts.iter().map(|v| v.execution_time_ms).sum(),
        memory_used_mb: verdicts
            .iter()
            .map(|v| v.memory_used_mb)
            .fold(0.0, f64::max),
        final_status: SubmissionStatus::Completed,
    }
}
