/// Scripted sandbox for tests
///
/// Default behavior echoes stdin back as stdout (trimmed) in a fixed 5ms
/// with 1.5MB of memory, never times out and never crashes. Tests replace
/// the run or compile behavior with closures to stage specific outcomes.
use super::{
    Artifact, CompileOutput, RunLimits, RunRequest, RunResult, Sandbox, SandboxError,
};
use arbiter_common::LanguageProfile;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type RunScript = Box<dyn Fn(&RunRequest<'_>) -> Result<RunResult, SandboxError> + Send + Sync>;
type CompileScript = Box<dyn Fn(&Artifact) -> Result<CompileOutput, SandboxError> + Send + Sync>;
type PrepareScript = Box<dyn Fn(&LanguageProfile) -> Result<(), SandboxError> + Send + Sync>;

pub(crate) const ECHO_TIME_MS: u64 = 5;
pub(crate) const ECHO_MEMORY_MB: f64 = 1.5;

pub(crate) struct ScriptedSandbox {
    run: RunScript,
    compile: CompileScript,
    prepare: PrepareScript,
    delay: Duration,
    calls: Mutex<Vec<&'static str>>,
    compile_calls: AtomicUsize,
    run_calls: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    seen_limits: Mutex<Vec<RunLimits>>,
}

impl ScriptedSandbox {
    pub(crate) fn echo() -> Self {
        Self {
            run: Box::new(|request| {
                Ok(RunResult::exited(
                    0,
                    request.stdin.trim(),
                    "",
                    ECHO_TIME_MS,
                    ECHO_MEMORY_MB,
                ))
            }),
            compile: Box::new(|_| Ok(CompileOutput::success())),
            prepare: Box::new(|_| Ok(())),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            compile_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            seen_limits: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_run<F>(mut self, script: F) -> Self
    where
        F: Fn(&RunRequest<'_>) -> Result<RunResult, SandboxError> + Send + Sync + 'static,
    {
        self.run = Box::new(script);
        self
    }

    pub(crate) fn with_compile<F>(mut self, script: F) -> Self
    where
        F: Fn(&Artifact) -> Result<CompileOutput, SandboxError> + Send + Sync + 'static,
    {
        self.compile = Box::new(script);
        self
    }

    pub(crate) fn with_prepare<F>(mut self, script: F) -> Self
    where
        F: Fn(&LanguageProfile) -> Result<(), SandboxError> + Send + Sync + 'static,
    {
        self.prepare = Box::new(script);
        self
    }

    /// Hold every run for `delay` so overlapping runs become observable
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Backend calls in the order they arrived ("prepare", "compile", "run")
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub(crate) fn compile_calls(&self) -> usize {
        self.compile_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    /// Highest number of runs that were in flight at the same time
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub(crate) fn seen_limits(&self) -> Vec<RunLimits> {
        self.seen_limits
            .lock()
            .map(|limits| limits.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn prepare(&self, profile: &LanguageProfile) -> Result<(), SandboxError> {
        self.record("prepare");
        (self.prepare)(profile)
    }

    async fn compile(
        &self,
        _profile: &LanguageProfile,
        artifact: &Artifact,
        _timeout: Duration,
    ) -> Result<CompileOutput, SandboxError> {
        self.record("compile");
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        (self.compile)(artifact)
    }

    async fn run(
        &self,
        _profile: &LanguageProfile,
        _artifact: &Artifact,
        request: &RunRequest<'_>,
    ) -> Result<RunResult, SandboxError> {
        self.record("run");
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut limits) = self.seen_limits.lock() {
            limits.push(request.limits);
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        (self.run)(request)
    }
}
