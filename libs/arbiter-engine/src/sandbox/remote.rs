/// Remote judge delegation (Judge0-compatible HTTP API)
///
/// A run is one remote submission: POST it, receive a token, then poll the
/// token at a fixed interval until the judge leaves its queued/processing
/// states. The poll count is capped independently of the remote service's
/// own limits because the service itself can stall; an exhausted budget is
/// reported as `TimedOut`.
///
/// The remote service compiles as part of every run, so `compile` is a
/// no-op here and compile errors surface as `ExitStatus::CompileError`.
use super::{
    Artifact, CompileOutput, ExitStatus, RunRequest, RunResult, Sandbox, SandboxError,
};
use arbiter_common::LanguageProfile;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const AUTH_HEADER: &str = "X-Auth-Token";
const RESULT_FIELDS: &str = "status,stdout,stderr,compile_output,message,time,wall_time,memory,exit_code";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct CreateSubmission {
    source_code: String,
    language_id: u32,
    stdin: String,
    expected_output: String,
    cpu_time_limit: f64,
    wall_time_limit: f64,
    /// Kilobytes
    memory_limit: u64,
}

#[derive(Debug, Deserialize)]
struct CreatedSubmission {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RemoteStatus {
    id: u32,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RemoteSubmission {
    status: RemoteStatus,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    compile_output: Option<String>,
    #[serde(default)]
    message: Option<String>,
    /// Seconds, as a decimal string
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    wall_time: Option<String>,
    /// Kilobytes
    #[serde(default)]
    memory: Option<u64>,
    #[serde(default)]
    exit_code: Option<i64>,
}

/// Remote status ids collapsed to what the evaluator cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteOutcome {
    Pending,
    Accepted,
    WrongAnswer,
    TimedOut,
    CompileError,
    RuntimeError,
    InternalError,
}

fn classify(status_id: u32) -> RemoteOutcome {
    match status_id {
        1 | 2 => RemoteOutcome::Pending,
        3 => RemoteOutcome::Accepted,
        4 => RemoteOutcome::WrongAnswer,
        5 => RemoteOutcome::TimedOut,
        6 => RemoteOutcome::CompileError,
        7..=12 => RemoteOutcome::RuntimeError,
        _ => RemoteOutcome::InternalError,
    }
}

pub struct RemoteJudge {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl RemoteJudge {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        poll_interval: Duration,
        max_polls: u32,
    ) -> Result<Self, SandboxError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
            poll_interval,
            max_polls: max_polls.max(1),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(AUTH_HEADER, token),
            None => request,
        }
    }

    async fn create(&self, body: &CreateSubmission) -> Result<String, SandboxError> {
        let url = format!("{}/submissions", self.base_url);
        let created: CreatedSubmission = self
            .authorize(self.client.post(url))
            .query(&[("base64_encoded", "true"), ("wait", "false")])
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.token)
    }

    async fn fetch(&self, token: &str) -> Result<RemoteSubmission, SandboxError> {
        let url = format!("{}/submissions/{}", self.base_url, token);
        let submission = self
            .authorize(self.client.get(url))
            .query(&[("base64_encoded", "true"), ("fields", RESULT_FIELDS)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(submission)
    }
}

#[async_trait]
impl Sandbox for RemoteJudge {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn compile(
        &self,
        _profile: &LanguageProfile,
        _artifact: &Artifact,
        _timeout: Duration,
    ) -> Result<CompileOutput, SandboxError> {
        Ok(CompileOutput::success())
    }

    async fn run(
        &self,
        profile: &LanguageProfile,
        artifact: &Artifact,
        request: &RunRequest<'_>,
    ) -> Result<RunResult, SandboxError> {
        let seconds = request.limits.timeout_ms as f64 / 1000.0;
        let body = CreateSubmission {
            source_code: general_purpose::STANDARD.encode(&artifact.source_code),
            language_id: profile.remote_language_id,
            stdin: general_purpose::STANDARD.encode(request.stdin),
            expected_output: general_purpose::STANDARD.encode(request.expected_output),
            cpu_time_limit: seconds,
            wall_time_limit: seconds,
            memory_limit: request.limits.memory_limit_mb * 1024,
        };

        let token = self.create(&body).await?;
        debug!(token = %token, language = %profile.language, "Submitted to remote judge");

        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let submission = self.fetch(&token).await?;
            let outcome = classify(submission.status.id);
            if outcome == RemoteOutcome::Pending {
                debug!(token = %token, attempt, "Remote judge still processing");
                continue;
            }
            return into_run_result(outcome, submission);
        }

        warn!(
            token = %token,
            max_polls = self.max_polls,
            "Remote judge poll budget exhausted"
        );
        Ok(RunResult::timed_out(request.limits.timeout_ms))
    }
}

fn into_run_result(
    outcome: RemoteOutcome,
    submission: RemoteSubmission,
) -> Result<RunResult, SandboxError> {
    let stdout = decode(submission.stdout.as_deref())?;
    let mut stderr = decode(submission.stderr.as_deref())?;
    let compile_output = decode(submission.compile_output.as_deref())?;
    let message = decode(submission.message.as_deref())?;

    let (exit_status, judge_accepted) = match outcome {
        RemoteOutcome::Accepted => (ExitStatus::Exited(0), Some(true)),
        RemoteOutcome::WrongAnswer => (ExitStatus::Exited(0), Some(false)),
        RemoteOutcome::TimedOut => (ExitStatus::TimedOut, None),
        RemoteOutcome::CompileError => {
            stderr = compile_output;
            (ExitStatus::CompileError, None)
        }
        RemoteOutcome::RuntimeError => {
            if stderr.trim().is_empty() {
                stderr = format!("{} {}", submission.status.description, message)
                    .trim()
                    .to_string();
            }
            let code = submission.exit_code.filter(|c| *c != 0).unwrap_or(1);
            (ExitStatus::Exited(code), None)
        }
        RemoteOutcome::InternalError | RemoteOutcome::Pending => {
            return Err(SandboxError::Remote(
                format!("{} {}", submission.status.description, message)
                    .trim()
                    .to_string(),
            ))
        }
    };

    let seconds = submission
        .wall_time
        .as_deref()
        .or(submission.time.as_deref())
        .and_then(|t| t.trim().parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(RunResult {
        exit_status,
        stdout,
        stderr,
        wall_time_ms: (seconds * 1000.0).round() as u64,
        peak_memory_mb: submission.memory.unwrap_or(0) as f64 / 1024.0,
        judge_accepted,
    })
}

/// Base64 fields may arrive wrapped across lines
fn decode(field: Option<&str>) -> Result<String, SandboxError> {
    let Some(encoded) = field else {
        return Ok(String::new());
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| SandboxError::Remote(format!("invalid base64 in response: {}", e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
