use crate::error::{JudgeError, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Which sandbox strategy executes submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionBackend {
    /// Disposable Docker containers on this host
    Local,
    /// Delegation to a Judge0-compatible service
    Remote,
}

impl FromStr for ExecutionBackend {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "docker" => Ok(ExecutionBackend::Local),
            "remote" | "judge0" => Ok(ExecutionBackend::Remote),
            other => Err(JudgeError::Config(format!(
                "unknown execution backend: {}",
                other
            ))),
        }
    }
}

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub backend: ExecutionBackend,
    pub remote_judge_url: String,
    pub remote_judge_token: Option<String>,
    pub remote_poll_interval_ms: u64,
    pub remote_max_polls: u32,
    pub compile_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_concurrent_submissions: usize,
    pub max_parallel_tests: usize,
    pub language_config_path: Option<PathBuf>,
    pub questions_dir: PathBuf,
    pub workdir_root: PathBuf,
    pub stale_running_secs: u64,
}

impl Config {
    /// Built-in defaults, no environment lookups
    pub fn defaults() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend: ExecutionBackend::Local,
            remote_judge_url: "http://127.0.0.1:2358".to_string(),
            remote_judge_token: None,
            remote_poll_interval_ms: 1000,
            remote_max_polls: 30,
            compile_timeout_ms: 30_000,
            max_timeout_ms: 30_000,
            max_concurrent_submissions: 4,
            max_parallel_tests: 1,
            language_config_path: None,
            questions_dir: PathBuf::from("questions"),
            workdir_root: env::temp_dir(),
            stale_running_secs: 900,
        }
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::defaults();

        let config = Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            backend: match env::var("EXECUTION_BACKEND") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.backend,
            },
            remote_judge_url: env::var("REMOTE_JUDGE_URL").unwrap_or(defaults.remote_judge_url),
            remote_judge_token: env::var("REMOTE_JUDGE_TOKEN").ok().filter(|t| !t.is_empty()),
            remote_poll_interval_ms: parse_var(
                "REMOTE_POLL_INTERVAL_MS",
                defaults.remote_poll_interval_ms,
            )?,
            remote_max_polls: parse_var("REMOTE_MAX_POLLS", defaults.remote_max_polls)?,
            compile_timeout_ms: parse_var("COMPILE_TIMEOUT_MS", defaults.compile_timeout_ms)?,
            max_timeout_ms: parse_var("MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            max_concurrent_submissions: parse_var(
                "MAX_CONCURRENT_SUBMISSIONS",
                defaults.max_concurrent_submissions,
            )?,
            max_parallel_tests: parse_var("MAX_PARALLEL_TESTS", defaults.max_parallel_tests)?,
            language_config_path: env::var("LANGUAGE_CONFIG_PATH").ok().map(PathBuf::from),
            questions_dir: env::var("QUESTIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.questions_dir),
            workdir_root: env::var("WORKDIR_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workdir_root),
            stale_running_secs: parse_var("STALE_RUNNING_SECS", defaults.stale_running_secs)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_submissions == 0 {
            return Err(JudgeError::Config(
                "MAX_CONCURRENT_SUBMISSIONS must be at least 1".to_string(),
            ));
        }
        if self.max_parallel_tests == 0 {
            return Err(JudgeError::Config(
                "MAX_PARALLEL_TESTS must be at least 1".to_string(),
            ));
        }
        if self.remote_max_polls == 0 {
            return Err(JudgeError::Config(
                "REMOTE_MAX_POLLS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| JudgeError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
