/// Test Executor
///
/// Runs one submission's code end to end: prepare the backend → workspace →
/// compile (if the language needs it) → evaluate. Produces verdicts only; persisting them is
/// the orchestrator's job.
///
/// ## Failure Rules
/// - Compile failure: one synthetic `compile` verdict, no test case runs
/// - Per-test failures: folded into that test's verdict by the evaluator
/// - Backend or workspace setup failure: pipeline error, the submission ends
///   in `error`
use crate::compiler::{self, CompileResult};
use crate::evaluator::{self, EvaluationSettings};
use crate::sandbox::Sandbox;
use crate::workspace::Workspace;
use arbiter_common::{Config, JudgeError, LanguageProfile, Result, TestCase, TestVerdict};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub compile_timeout: Duration,
    pub evaluation: EvaluationSettings,
    pub workdir_root: PathBuf,
}

impl ExecutionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            compile_timeout: Duration::from_millis(config.compile_timeout_ms),
            evaluation: EvaluationSettings {
                max_timeout_ms: config.max_timeout_ms,
                max_parallel_tests: config.max_parallel_tests,
            },
            workdir_root: config.workdir_root.clone(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub async fn execute(
    sandbox: &dyn Sandbox,
    profile: &LanguageProfile,
    submission_id: &Uuid,
    source_code: &str,
    test_cases: &[TestCase],
    settings: &ExecutionSettings,
) -> Result<Vec<TestVerdict>> {
    // Image pulls and similar warm-up stay outside the compile budget
    sandbox
        .prepare(profile)
        .await
        .map_err(|e| JudgeError::Pipeline(format!("failed to prepare sandbox: {}", e)))?;

    let workspace = Workspace::create(&settings.workdir_root, submission_id, profile, source_code)
        .await
        .map_err(|e| JudgeError::Pipeline(format!("failed to prepare workspace: {}", e)))?;

    debug!(
        submission_id = %submission_id,
        workspace = %workspace.path().display(),
        backend = sandbox.name(),
        "Workspace ready"
    );

    if let CompileResult::Failed(diagnostic) =
        compiler::compile(sandbox, profile, workspace.artifact(), settings.compile_timeout).await
    {
        info!(submission_id = %submission_id, "Compilation failed, skipping test cases");
        return Ok(vec![TestVerdict::compile_failure(diagnostic)]);
    }

    let verdicts = evaluator::evaluate(
        sandbox,
        profile,
        workspace.artifact(),
        test_cases,
        &settings.evaluation,
    )
    .await;

    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::ScriptedSandbox;
    use crate::sandbox::{CompileOutput, SandboxError};
    use arbiter_common::types::COMPILE_TEST_CASE_ID;
    use arbiter_common::{Language, LanguageRegistry};

    fn case(id: &str, input: &str, expected: &str) -> TestCase {
        TestCase {
            id: id.to_string(),
            input: input.to_string(),
            expected_output: expected.to_string(),
            timeout_ms: None,
            memory_limit_mb: None,
            is_hidden: false,
        }
    }

    fn settings(root: &std::path::Path) -> ExecutionSettings {
        ExecutionSettings {
            workdir_root: root.to_path_buf(),
            ..ExecutionSettings::default()
        }
    }

    #[tokio::test]
    async fn test_partial_pass() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::echo();
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Java).unwrap();
        let cases = vec![case("1", "42", "42"), case("2", "wrong", "different")];

        let verdicts = execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "class Main {}",
            &cases,
            &settings(root.path()),
        )
        .await
        .unwrap();

        assert_eq!(sandbox.compile_calls(), 1);
        assert_eq!(sandbox.calls()[..2], ["prepare", "compile"]);
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
    }

    #[tokio::test]
    async fn test_compile_failure_short_circuits() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::echo()
            .with_compile(|_| Ok(CompileOutput::failure("main.cpp:1:1: error: expected ';'")));
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Cpp).unwrap();
        let cases = vec![case("1", "a", "a"), case("2", "b", "b")];

        let verdicts = execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "int main() {",
            &cases,
            &settings(root.path()),
        )
        .await
        .unwrap();

        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].test_case_id, COMPILE_TEST_CASE_ID);
        assert!(!verdicts[0].passed);
        assert_eq!(verdicts[0].memory_used_mb, 0.0);
        assert!(verdicts[0].error.as_deref().unwrap().contains("expected ';'"));
        assert_eq!(sandbox.run_calls(), 0);
    }

    #[tokio::test]
    async fn test_compiler_sees_the_source() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::echo().with_compile(|artifact| {
            let source = std::fs::read_to_string(artifact.dir.join(&artifact.source_file))?;
            assert_eq!(source, "int main() { return 0; }");
            Ok(CompileOutput::success())
        });
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Cpp).unwrap();

        let verdicts = execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "int main() { return 0; }",
            &[case("1", "x", "x")],
            &settings(root.path()),
        )
        .await
        .unwrap();

        assert!(verdicts[0].passed);
    }

    #[tokio::test]
    async fn test_workspace_is_removed_afterwards() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::echo();
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Python).unwrap();

        execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "print(input())",
            &[case("1", "x", "x")],
            &settings(root.path()),
        )
        .await
        .unwrap();

        let leftover = std::fs::read_dir(root.path()).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_unusable_workdir_is_pipeline_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let sandbox = ScriptedSandbox::echo();
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Python).unwrap();

        let err = execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "print(1)",
            &[case("1", "x", "x")],
            &settings(&blocker),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, JudgeError::Pipeline(_)));
        assert_eq!(sandbox.run_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_prepare_is_pipeline_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = ScriptedSandbox::echo()
            .with_prepare(|_| Err(SandboxError::Unavailable("image pull denied".to_string())));
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Cpp).unwrap();

        let err = execute(
            &sandbox,
            profile,
            &Uuid::new_v4(),
            "int main() {}",
            &[case("1", "x", "x")],
            &settings(root.path()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, JudgeError::Pipeline(ref msg) if msg.contains("image pull denied")));
        assert_eq!(sandbox.calls(), vec!["prepare"]);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
