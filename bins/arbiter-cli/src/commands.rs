// CLI commands for running and inspecting submissions
use anyhow::{bail, Context, Result};
use arbiter_common::redis::IntakeQueue;
use arbiter_common::{
    Config, ExecutionBackend, LanguageRegistry, Submission, SubmissionReceipt, TestVerdict,
};
use arbiter_engine::{
    admit, DockerSandbox, ExecutionSettings, MemoryStore, Orchestrator, QuestionDirectory,
    RedisStore, RemoteJudge, Sandbox, StaticQuestions, SubmissionStore,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Question id used for one-shot local judging
const LOCAL_QUESTION_ID: &str = "local";
const LOCAL_USER_ID: &str = "cli";

fn load_registry(config: &Config, override_path: Option<&Path>) -> Result<LanguageRegistry> {
    match override_path.or(config.language_config_path.as_deref()) {
        Some(path) => LanguageRegistry::load_from_file(path)
            .with_context(|| format!("Failed to load language profiles from {}", path.display())),
        None => Ok(LanguageRegistry::builtin()),
    }
}

fn build_sandbox(config: &Config) -> Result<Arc<dyn Sandbox>> {
    Ok(match config.backend {
        ExecutionBackend::Local => Arc::new(
            DockerSandbox::connect(&config.workdir_root).context("Failed to create Docker client")?,
        ),
        ExecutionBackend::Remote => Arc::new(
            RemoteJudge::new(
                config.remote_judge_url.clone(),
                config.remote_judge_token.clone(),
                Duration::from_millis(config.remote_poll_interval_ms),
                config.remote_max_polls,
            )
            .context("Failed to create remote judge client")?,
        ),
    })
}

/// List language profiles
pub fn list_languages(override_path: Option<&Path>) -> Result<()> {
    let config = Config::from_env()?;
    let registry = load_registry(&config, override_path)?;
    let enabled = registry.enabled_languages();

    println!(
        "{:<12} {:<24} {:<10} {:<10} {:<10} {:<8}",
        "Language", "Image", "Compiled", "Memory", "Timeout", "CPU"
    );
    println!("{}", "─".repeat(78));

    for language in &enabled {
        let profile = registry.get(*language)?;
        println!(
            "{:<12} {:<24} {:<10} {:<10} {:<10} {:<8}",
            language.to_string(),
            profile.image,
            if profile.compile_needed() { "yes" } else { "no" },
            format!("{} MB", profile.memory_limit_mb),
            format!("{} ms", profile.timeout_ms),
            format!("{:.2}", profile.cpu_share),
        );
    }

    println!("\nTotal: {} language(s) enabled", enabled.len());
    Ok(())
}

/// Run a source file against a question file and print the submission
pub async fn judge(question_path: &Path, language: &str, source_path: &Path) -> Result<()> {
    let config = Config::from_env()?;
    let registry = load_registry(&config, None)?;

    let question = QuestionDirectory::load_file(question_path).await?;
    let source = tokio::fs::read_to_string(source_path)
        .await
        .with_context(|| format!("Failed to read {}", source_path.display()))?;

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        build_sandbox(&config)?,
        Arc::new(MemoryStore::new()),
        Arc::new(StaticQuestions::new().with(LOCAL_QUESTION_ID, question)),
        ExecutionSettings::from_config(&config),
        1,
    );

    let handle = orchestrator
        .enqueue(LOCAL_USER_ID, LOCAL_QUESTION_ID, language, &source)
        .await?;
    let id = handle.submission_id();
    if let Err(e) = handle.wait().await {
        eprintln!("Execution failed: {}", e);
    }

    let submission = orchestrator.get_status(&id).await?;
    eprintln!("{}", summary_line(&submission));
    for verdict in &submission.results {
        eprintln!("  {}", verdict_line(verdict));
    }
    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}

/// Admit a submission and hand its id to the worker queue
///
/// Unsupported languages and unknown questions fail here, before anything
/// is stored. Prints the receipt as JSON.
pub async fn submit(user: &str, question: &str, language: &str, source_path: &Path) -> Result<()> {
    let config = Config::from_env()?;
    let registry = load_registry(&config, None)?;
    let source_code = tokio::fs::read_to_string(source_path)
        .await
        .with_context(|| format!("Failed to read {}", source_path.display()))?;

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    let questions = QuestionDirectory::new(&config.questions_dir);

    let admitted = admit(
        &registry,
        &questions,
        &store,
        user,
        question,
        language,
        &source_code,
    )
    .await;
    let submission = match admitted {
        Ok(submission) => submission,
        Err(e) if e.is_rejection() => bail!("Submission rejected: {}", e),
        Err(e) => return Err(e.into()),
    };

    // A failed push leaves a pending record; the worker's startup sweep requeues it
    let mut queue = IntakeQueue::connect(&config.redis_url).await?;
    queue
        .push(&submission.id)
        .await
        .with_context(|| format!("Submission {} stored but not queued", submission.id))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&SubmissionReceipt::queued(submission.id))?
    );
    Ok(())
}

/// Print a persisted submission as JSON
pub async fn show_status(id: &Uuid) -> Result<()> {
    let config = Config::from_env()?;
    let store = RedisStore::connect(&config.redis_url).await?;

    let Some(submission) = store.get(id).await? else {
        bail!("Submission {} not found", id);
    };

    eprintln!("{}", summary_line(&submission));
    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}

/// Print a user's recent submissions
pub async fn show_history(user: &str, question: Option<&str>, limit: usize) -> Result<()> {
    let config = Config::from_env()?;
    let store = RedisStore::connect(&config.redis_url).await?;

    let submissions = store.list_for_user(user, question, limit).await?;
    if submissions.is_empty() {
        println!("No submissions for {}", user);
        return Ok(());
    }

    for submission in &submissions {
        println!(
            "{}  {}  {}",
            submission.submitted_at.format("%Y-%m-%d %H:%M:%S"),
            submission.question_id,
            summary_line(submission)
        );
    }
    Ok(())
}

/// Run the stale-execution sweep once
pub async fn reconcile(max_age_secs: Option<u64>) -> Result<()> {
    let config = Config::from_env()?;
    let registry = load_registry(&config, None)?;
    let store = RedisStore::connect(&config.redis_url).await?;

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        build_sandbox(&config)?,
        Arc::new(store),
        Arc::new(QuestionDirectory::new(&config.questions_dir)),
        ExecutionSettings::from_config(&config),
        1,
    );

    let max_age = Duration::from_secs(max_age_secs.unwrap_or(config.stale_running_secs));
    let reconciled = orchestrator.reconcile_stale(max_age).await?;
    for id in &reconciled {
        println!("{}", id);
    }
    println!("Reconciled {} submission(s)", reconciled.len());

    let stranded = orchestrator.stale_pending(max_age).await?;
    if !stranded.is_empty() {
        let mut queue = IntakeQueue::connect(&config.redis_url).await?;
        for id in &stranded {
            queue.push(id).await?;
            println!("{}", id);
        }
    }
    println!("Requeued {} pending submission(s)", stranded.len());
    Ok(())
}

fn summary_line(submission: &Submission) -> String {
    let mut line = format!(
        "{} [{}] {} {}/{} passed, {} ms, {:.1} MB",
        submission.id,
        submission.language,
        submission.status,
        submission.total_passed,
        submission.total_tests,
        submission.execution_time_ms,
        submission.memory_used_mb
    );
    if let Some(reason) = &submission.failure_reason {
        line.push_str(&format!(" ({})", reason));
    }
    line
}

fn verdict_line(verdict: &TestVerdict) -> String {
    let mark = if verdict.passed { "PASS" } else { "FAIL" };
    let mut line = format!(
        "{} {} {} ms {:.1} MB",
        mark, verdict.test_case_id, verdict.execution_time_ms, verdict.memory_used_mb
    );
    if let Some(error) = &verdict.error {
        let first = error.lines().next().unwrap_or_default();
        line.push_str(&format!(" - {}", first));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::{Language, SubmissionStatus};

    #[test]
    fn test_summary_line_includes_failure_reason() {
        let mut submission = Submission::new("u1", "q1", Language::Cpp, "");
        submission.status = SubmissionStatus::Error;
        submission.failure_reason = Some("execution abandoned".to_string());

        let line = summary_line(&submission);
        assert!(line.contains("[cpp] error 0/0 passed"));
        assert!(line.ends_with("(execution abandoned)"));
    }

    #[test]
    fn test_verdict_line_uses_first_error_line() {
        let verdict = TestVerdict::compile_failure("Compilation error:\nmain.cpp:1: error");
        assert_eq!(verdict_line(&verdict), "FAIL compile 0 ms 0.0 MB - Compilation error:");
    }
}
