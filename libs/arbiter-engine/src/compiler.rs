/// Compiler Stage
///
/// Turns a workspace into a runnable artifact for compiled languages, or
/// into the diagnostic text that replaces every test verdict. Never fails:
/// a timeout or a broken sandbox is itself a compile failure.
///
/// The outer timeout drops the sandbox future when it fires; backends must
/// clean up on drop. Image pulls happen in `Sandbox::prepare` beforehand, so
/// the budget covers compilation only.
use crate::sandbox::{Artifact, Sandbox};
use arbiter_common::LanguageProfile;
use std::time::Duration;
use tracing::{debug, warn};

/// Slack on top of the compile timeout for backends that overrun their own
const COMPILE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileResult {
    Ready,
    Failed(String),
}

pub async fn compile(
    sandbox: &dyn Sandbox,
    profile: &LanguageProfile,
    artifact: &Artifact,
    timeout: Duration,
) -> CompileResult {
    if !profile.compile_needed() {
        return CompileResult::Ready;
    }

    debug!(
        language = %profile.language,
        timeout_ms = timeout.as_millis() as u64,
        "Compiling submission"
    );

    let outcome = tokio::time::timeout(
        timeout + COMPILE_GRACE,
        sandbox.compile(profile, artifact, timeout),
    )
    .await;

    match outcome {
        Ok(Ok(output)) if output.success => CompileResult::Ready,
        Ok(Ok(output)) => {
            debug!(language = %profile.language, "Compilation rejected");
            CompileResult::Failed(format!("Compilation error:\n{}", output.diagnostics))
        }
        Ok(Err(e)) => {
            warn!(language = %profile.language, error = %e, "Compile step failed");
            CompileResult::Failed(format!("Compilation failed: {}", e))
        }
        Err(_) => {
            warn!(language = %profile.language, "Compile step overran its timeout");
            CompileResult::Failed(format!(
                "Compilation failed: timed out after {}ms",
                timeout.as_millis()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::scripted::ScriptedSandbox;
    use crate::sandbox::{CompileOutput, SandboxError};
    use arbiter_common::{Language, LanguageRegistry};
    use std::path::PathBuf;

    fn artifact() -> Artifact {
        Artifact {
            dir: PathBuf::from("/nonexistent"),
            source_file: "main.cpp".to_string(),
            source_code: "int main() {}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_interpreted_language_skips_compile() {
        let sandbox = ScriptedSandbox::echo();
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Python).unwrap();

        let result = compile(&sandbox, profile, &artifact(), Duration::from_secs(30)).await;

        assert_eq!(result, CompileResult::Ready);
        assert_eq!(sandbox.compile_calls(), 0);
    }

    #[tokio::test]
    async fn test_successful_compile() {
        let sandbox = ScriptedSandbox::echo();
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Cpp).unwrap();

        let result = compile(&sandbox, profile, &artifact(), Duration::from_secs(30)).await;

        assert_eq!(result, CompileResult::Ready);
        assert_eq!(sandbox.compile_calls(), 1);
    }

    #[tokio::test]
    async fn test_diagnostics_are_reported() {
        let sandbox = ScriptedSandbox::echo()
            .with_compile(|_| Ok(CompileOutput::failure("main.cpp:1:1: error: 'x' was not declared")));
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Cpp).unwrap();

        let result = compile(&sandbox, profile, &artifact(), Duration::from_secs(30)).await;

        match result {
            CompileResult::Failed(diag) => {
                assert!(diag.starts_with("Compilation error:"));
                assert!(diag.contains("'x' was not declared"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sandbox_error_is_compile_failure() {
        let sandbox = ScriptedSandbox::echo()
            .with_compile(|_| Err(SandboxError::Unavailable("daemon unreachable".to_string())));
        let registry = LanguageRegistry::builtin();
        let profile = registry.get(Language::Java).unwrap();

        let result = compile(&sandbox, profile, &artifact(), Duration::from_secs(30)).await;

        match result {
            CompileResult::Failed(diag) => {
                assert!(diag.starts_with("Compilation failed:"));
                assert!(diag.contains("daemon unreachable"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
