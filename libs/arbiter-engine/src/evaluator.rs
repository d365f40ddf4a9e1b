/// Test Evaluator - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Drive the sandbox across every test case of one submission and turn each
/// raw run into exactly one verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or the remote judge (only the `Sandbox` trait)
/// - Knows nothing about persistence
/// - Output order always matches test case order
/// - One case's failure never stops the others
///
/// **Verdict Rules:**
/// - Exit code 0 and `trim(stdout) == trim(expected)` → passed
/// - A backend that judges output itself overrides the comparison
/// - Timeout, memory kill, non-zero exit, sandbox failure → failed with `error`
/// - Hidden cases never carry `output`
use crate::sandbox::{Artifact, ExitStatus, RunLimits, RunRequest, RunResult, Sandbox};
use arbiter_common::{LanguageProfile, TestCase, TestVerdict};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const WRONG_ANSWER: &str = "Wrong answer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationSettings {
    /// Ceiling applied to every per-case timeout
    pub max_timeout_ms: u64,
    /// Cases in flight at once; 1 runs them sequentially
    pub max_parallel_tests: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            max_timeout_ms: 30_000,
            max_parallel_tests: 1,
        }
    }
}

/// Judged outcome of one case before short-circuit handling
#[derive(Debug, Clone, PartialEq)]
enum CaseOutcome {
    Verdict(TestVerdict),
    /// Reported by backends that compile as part of each run
    CompileError(String),
    /// Not run because an earlier case already reported a compile error
    Skipped,
}

/// Effective limits for a case: its own values, else the language defaults
pub fn limits_for(
    case: &TestCase,
    profile: &LanguageProfile,
    settings: &EvaluationSettings,
) -> RunLimits {
    let timeout_ms = case
        .timeout_ms
        .unwrap_or(profile.timeout_ms)
        .min(settings.max_timeout_ms)
        .max(1);
    let memory_limit_mb = case.memory_limit_mb.unwrap_or(profile.memory_limit_mb).max(1);

    RunLimits {
        timeout_ms,
        memory_limit_mb,
    }
}

/// Evaluate all test cases and produce one verdict per case, in order
///
/// When the backend reports a compile error, the whole evaluation collapses
/// into the single synthetic `compile` verdict.
pub async fn evaluate(
    sandbox: &dyn Sandbox,
    profile: &LanguageProfile,
    artifact: &Artifact,
    test_cases: &[TestCase],
    settings: &EvaluationSettings,
) -> Vec<TestVerdict> {
    debug!(
        language = %profile.language,
        test_cases = test_cases.len(),
        parallelism = settings.max_parallel_tests,
        "Evaluating test cases"
    );

    let compile_failed = AtomicBool::new(false);
    let compile_failed = &compile_failed;

    // Cases are never cancelled once started: a dropped run could leave
    // its sandbox behind. Later cases check the flag and skip instead.
    let runs: Vec<BoxFuture<'_, CaseOutcome>> = test_cases
        .iter()
        .map(|case| {
            async move {
                if compile_failed.load(Ordering::SeqCst) {
                    return CaseOutcome::Skipped;
                }
                let outcome = run_case(sandbox, profile, artifact, case, settings).await;
                if matches!(outcome, CaseOutcome::CompileError(_)) {
                    compile_failed.store(true, Ordering::SeqCst);
                }
                outcome
            }
            .boxed()
        })
        .collect();

    let outcomes: Vec<CaseOutcome> = stream::iter(runs)
        .buffered(settings.max_parallel_tests.max(1))
        .collect()
        .await;

    let mut verdicts = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            CaseOutcome::Verdict(verdict) => verdicts.push(verdict),
            CaseOutcome::CompileError(diagnostic) => {
                return vec![TestVerdict::compile_failure(format!(
                    "Compilation error:\n{}",
                    diagnostic
                ))];
            }
            CaseOutcome::Skipped => {}
        }
    }
    verdicts
}

async fn run_case(
    sandbox: &dyn Sandbox,
    profile: &LanguageProfile,
    artifact: &Artifact,
    case: &TestCase,
    settings: &EvaluationSettings,
) -> CaseOutcome {
    let limits = limits_for(case, profile, settings);
    let request = RunRequest {
        stdin: &case.input,
        expected_output: &case.expected_output,
        limits,
    };

    match sandbox.run(profile, artifact, &request).await {
        Ok(result) => judge(case, &limits, result),
        Err(e) => {
            warn!(test_case_id = %case.id, error = %e, "Sandbox failed to run test case");
            CaseOutcome::Verdict(TestVerdict::infrastructure_failure(
                case,
                format!("Sandbox failure: {}", e),
            ))
        }
    }
}

/// Turn one raw run into a verdict
fn judge(case: &TestCase, limits: &RunLimits, result: RunResult) -> CaseOutcome {
    let (passed, error) = match result.exit_status {
        ExitStatus::CompileError => return CaseOutcome::CompileError(result.stderr),
        ExitStatus::TimedOut => (
            false,
            Some(format!("Time limit exceeded ({}ms)", limits.timeout_ms)),
        ),
        ExitStatus::MemoryLimitExceeded => (
            false,
            Some(format!("Memory limit exceeded ({}MB)", limits.memory_limit_mb)),
        ),
        ExitStatus::Exited(0) => {
            let passed = result
                .judge_accepted
                .unwrap_or_else(|| outputs_match(&result.stdout, &case.expected_output));
            (passed, (!passed).then(|| WRONG_ANSWER.to_string()))
        }
        ExitStatus::Exited(code) => {
            let stderr = result.stderr.trim();
            let error = if stderr.is_empty() {
                format!("Runtime error (exit code {})", code)
            } else {
                format!("Runtime error (exit code {}):\n{}", code, stderr)
            };
            (false, Some(error))
        }
    };

    debug!(
        test_case_id = %case.id,
        passed,
        execution_time_ms = result.wall_time_ms,
        memory_used_mb = result.peak_memory_mb,
        "Test case judged"
    );

    CaseOutcome::Verdict(TestVerdict {
        test_case_id: case.id.clone(),
        passed,
        execution_time_ms: result.wall_time_ms,
        memory_used_mb: result.peak_memory_mb,
        output: (!case.is_hidden).then_some(result.stdout),
        error,
        is_hidden: case.is_hidden,
    })
}

/// Whitespace-insensitive at the edges only
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}
