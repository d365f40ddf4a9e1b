/// Sandbox Runner - Abstraction for Untrusted Code Execution
///
/// **Core Responsibility:**
/// Run one program against one input under hard limits and report what
/// happened: exit status, raw stdout/stderr, wall time and peak memory.
///
/// **Critical Architectural Boundary:**
/// - A sandbox knows HOW to execute (local containers, remote judge)
/// - A sandbox does NOT know test-case semantics or scoring
/// - The evaluator depends only on this trait, never on a backend
///
/// Every implementation must tear its environment down on every exit path
/// and must never block longer than the limits it was handed.
use arbiter_common::LanguageProfile;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod docker;
pub mod remote;

#[cfg(test)]
pub(crate) mod scripted;

pub use docker::DockerSandbox;
pub use remote::RemoteJudge;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("remote judge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote judge error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Per-run resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process ran to completion with this exit code
    Exited(i64),
    /// Killed by the wall-clock timeout (or the poll budget ran out)
    TimedOut,
    /// Killed by the memory cap
    MemoryLimitExceeded,
    /// Only reported by backends that compile as part of a run
    CompileError,
}

/// Raw result of a single run; judging happens elsewhere
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub wall_time_ms: u64,
    pub peak_memory_mb: f64,
    /// Accepted/rejected verdict of a backend that judges output itself
    pub judge_accepted: Option<bool>,
}

impl RunResult {
    pub fn exited(
        code: i64,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        wall_time_ms: u64,
        peak_memory_mb: f64,
    ) -> Self {
        Self {
            exit_status: ExitStatus::Exited(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            wall_time_ms,
            peak_memory_mb,
            judge_accepted: None,
        }
    }

    pub fn timed_out(wall_time_ms: u64) -> Self {
        Self {
            exit_status: ExitStatus::TimedOut,
            stdout: String::new(),
            stderr: String::new(),
            wall_time_ms,
            peak_memory_mb: 0.0,
            judge_accepted: None,
        }
    }
}

/// Outcome of a compile step inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    pub success: bool,
    pub diagnostics: String,
}

impl CompileOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            diagnostics: String::new(),
        }
    }

    pub fn failure(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// The program under test: its source and the directory holding it (and,
/// after compilation, the compiled output)
#[derive(Debug, Clone)]
pub struct Artifact {
    pub dir: PathBuf,
    pub source_file: String,
    pub source_code: String,
}

/// One invocation of the program
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub stdin: &'a str,
    /// Only forwarded to backends that judge output themselves
    pub expected_output: &'a str,
    pub limits: RunLimits,
}

/// Execution backend
///
/// Any implementation must guarantee:
/// 1. No network access and only the artifact visible to the program
/// 2. Hard memory cap and bounded CPU share
/// 3. Forced termination at the timeout, reported as `TimedOut`
/// 4. Teardown of everything it created, whatever the outcome
/// 5. Time in milliseconds, memory in MB
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Get the backend ready for `profile` (pull its image, warm a pool)
    ///
    /// Runs before the compile step and outside its time budget.
    async fn prepare(&self, _profile: &LanguageProfile) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Build the artifact in place; `timeout` bounds the whole step
    async fn compile(
        &self,
        profile: &LanguageProfile,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<CompileOutput, SandboxError>;

    async fn run(
        &self,
        profile: &LanguageProfile,
        artifact: &Artifact,
        request: &RunRequest<'_>,
    ) -> Result<RunResult, SandboxError>;
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(1024 * 1024), 1.0);
        assert_eq!(bytes_to_mb(256 * 1024 * 1024), 256.0);
    }

    #[test]
    fn test_timed_out_result() {
        let result = RunResult::timed_out(2000);
        assert_eq!(result.exit_status, ExitStatus::TimedOut);
        assert_eq!(result.wall_time_ms, 2000);
        assert!(result.stdout.is_empty());
    }
}
