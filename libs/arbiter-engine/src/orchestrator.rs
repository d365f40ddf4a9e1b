/// Submission Orchestrator
///
/// **Core Responsibility:**
/// Own the submission state machine and run each submission exactly once.
///
/// ```text
/// pending --execute starts--> running --verdicts produced--> completed
///                                     --pipeline failure---> error
/// ```
///
/// **Guarantees:**
/// - Unsupported languages and unknown questions are rejected before any
///   record exists
/// - At most one execution per submission, enforced by the store's atomic
///   pending → running transition
/// - Fails closed: errors and panics inside the pipeline end in `error`
///   with `completed_at` set, never in a stuck `running`
/// - Executions share a bounded pool; unrelated submissions never wait on
///   each other's locks
use crate::aggregator::aggregate;
use crate::executor::{self, ExecutionSettings};
use crate::intake;
use crate::questions::QuestionLookup;
use crate::sandbox::Sandbox;
use crate::store::SubmissionStore;
use arbiter_common::{
    JudgeError, LanguageRegistry, Result, Submission, SubmissionReceipt, SubmissionStatus,
    TestVerdict,
};
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ABANDONED_REASON: &str = "execution abandoned";

/// How a call to `execute` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Verdicts were produced and persisted
    Completed,
    /// The submission was already running or terminal; nothing was done
    Skipped,
    /// The run finished, but the record had been finalized elsewhere (for
    /// instance by the reconciliation sweep) and was left as it was
    Superseded,
}

/// Awaitable handle on a scheduled execution
///
/// Dropping it detaches the execution; it keeps running in the pool.
pub struct ExecutionHandle {
    submission_id: Uuid,
    join: JoinHandle<Result<ExecutionOutcome>>,
}

impl ExecutionHandle {
    pub fn submission_id(&self) -> Uuid {
        self.submission_id
    }

    pub fn receipt(&self) -> SubmissionReceipt {
        SubmissionReceipt::queued(self.submission_id)
    }

    pub async fn wait(self) -> Result<ExecutionOutcome> {
        self.join
            .await
            .map_err(|e| JudgeError::Pipeline(format!("execution task failed: {}", e)))?
    }
}

/// A reserved place in the execution pool, released on drop
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<LanguageRegistry>,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn SubmissionStore>,
    questions: Arc<dyn QuestionLookup>,
    settings: ExecutionSettings,
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn SubmissionStore>,
        questions: Arc<dyn QuestionLookup>,
        settings: ExecutionSettings,
        max_concurrent_submissions: usize,
    ) -> Self {
        let pool_size = max_concurrent_submissions.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                sandbox,
                store,
                questions,
                settings,
                permits: Arc::new(Semaphore::new(pool_size)),
                pool_size,
            }),
        }
    }

    /// Validate, persist as `pending` and schedule in the background
    ///
    /// Returns as soon as the record exists; the handle can be awaited or
    /// dropped.
    pub async fn enqueue(
        &self,
        user_id: &str,
        question_id: &str,
        language: &str,
        source_code: &str,
    ) -> Result<ExecutionHandle> {
        let submission = intake::admit(
            &self.inner.registry,
            self.inner.questions.as_ref(),
            self.inner.store.as_ref(),
            user_id,
            question_id,
            language,
            source_code,
        )
        .await?;

        Ok(self.schedule(submission.id))
    }

    /// Wait for a free place in the pool
    ///
    /// Lets a queue consumer hold back its next pop until the pool can take
    /// the work, so the backlog stays in the durable queue.
    pub async fn reserve(&self) -> Result<ExecutionSlot> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JudgeError::Pipeline("execution pool is shut down".to_string()))?;
        Ok(ExecutionSlot { _permit: permit })
    }

    /// Run `execute` on the bounded pool
    pub fn schedule(&self, submission_id: Uuid) -> ExecutionHandle {
        let orchestrator = self.clone();
        self.spawn_execution(submission_id, async move { orchestrator.reserve().await })
    }

    /// Run `execute` in a place already reserved with [`Orchestrator::reserve`]
    pub fn schedule_reserved(&self, slot: ExecutionSlot, submission_id: Uuid) -> ExecutionHandle {
        self.spawn_execution(submission_id, async move { Ok(slot) })
    }

    fn spawn_execution<F>(&self, submission_id: Uuid, slot: F) -> ExecutionHandle
    where
        F: Future<Output = Result<ExecutionSlot>> + Send + 'static,
    {
        let orchestrator = self.clone();

        let join = tokio::spawn(async move {
            let _slot = slot.await?;

            let outcome = orchestrator.execute(submission_id).await;
            if let Err(e) = &outcome {
                error!(submission_id = %submission_id, error = %e, "Execution failed");
            }
            outcome
        });

        ExecutionHandle {
            submission_id,
            join,
        }
    }

    /// Drive a submission to a terminal state
    ///
    /// A no-op for submissions that are already running or terminal.
    /// Pipeline failures are recorded on the submission and also returned.
    pub async fn execute(&self, submission_id: Uuid) -> Result<ExecutionOutcome> {
        let Some(running) = self.inner.store.try_begin(&submission_id, Utc::now()).await? else {
            info!(submission_id = %submission_id, "Submission already claimed, skipping");
            return Ok(ExecutionOutcome::Skipped);
        };

        info!(
            submission_id = %submission_id,
            language = %running.language,
            backend = self.inner.sandbox.name(),
            "Execution started"
        );

        let pipeline = AssertUnwindSafe(self.run_pipeline(&running))
            .catch_unwind()
            .await;

        match pipeline {
            Ok(Ok(verdicts)) => self.complete(running, verdicts).await,
            Ok(Err(e)) => {
                self.fail(running, e.to_string()).await?;
                Err(e)
            }
            Err(panic) => {
                let reason = format!("execution panicked: {}", panic_message(panic.as_ref()));
                self.fail(running, reason.clone()).await?;
                Err(JudgeError::Pipeline(reason))
            }
        }
    }

    async fn run_pipeline(&self, submission: &Submission) -> Result<Vec<TestVerdict>> {
        let profile = self.inner.registry.get(submission.language)?;
        let question = self.inner.questions.lookup(&submission.question_id).await?;

        executor::execute(
            self.inner.sandbox.as_ref(),
            profile,
            &submission.id,
            &submission.source_code,
            &question.test_cases,
            &self.inner.settings,
        )
        .await
    }

    async fn complete(
        &self,
        mut submission: Submission,
        verdicts: Vec<TestVerdict>,
    ) -> Result<ExecutionOutcome> {
        let totals = aggregate(&verdicts);
        submission.status = totals.final_status;
        submission.total_tests = totals.total_tests;
        submission.total_passed = totals.total_passed;
        submission.execution_time_ms = totals.execution_time_ms;
        submission.memory_used_mb = totals.memory_used_mb;
        submission.results = verdicts;
        submission.completed_at = Some(Utc::now());

        if !self.inner.store.finish(&submission).await? {
            warn!(submission_id = %submission.id, "Submission finalized elsewhere, dropping results");
            return Ok(ExecutionOutcome::Superseded);
        }

        info!(
            submission_id = %submission.id,
            passed = submission.total_passed,
            total = submission.total_tests,
            execution_time_ms = submission.execution_time_ms,
            memory_used_mb = submission.memory_used_mb,
            "Execution completed"
        );
        Ok(ExecutionOutcome::Completed)
    }

    async fn fail(&self, mut submission: Submission, reason: String) -> Result<()> {
        error!(submission_id = %submission.id, reason = %reason, "Execution pipeline failed");

        submission.status = SubmissionStatus::Error;
        submission.results.clear();
        submission.failure_reason = Some(reason);
        submission.completed_at = Some(Utc::now());

        if !self.inner.store.finish(&submission).await? {
            warn!(submission_id = %submission.id, "Submission finalized elsewhere");
        }
        Ok(())
    }

    pub async fn get_status(&self, submission_id: &Uuid) -> Result<Submission> {
        self.inner
            .store
            .get(submission_id)
            .await?
            .ok_or(JudgeError::SubmissionNotFound(*submission_id))
    }

    /// A user's most recent submissions, newest first
    pub async fn history(
        &self,
        user_id: &str,
        question_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        self.inner
            .store
            .list_for_user(user_id, question_id, limit)
            .await
    }

    /// Move submissions stuck in `running` for longer than `max_age` to `error`
    ///
    /// Covers executions lost to a crashed process. Returns the ids that
    /// were transitioned.
    pub async fn reconcile_stale(&self, max_age: Duration) -> Result<Vec<Uuid>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| JudgeError::Config(format!("invalid reconciliation age: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let mut reconciled = Vec::new();
        for id in self.inner.store.stale_running(cutoff).await? {
            let Some(mut submission) = self.inner.store.get(&id).await? else {
                continue;
            };
            if submission.status != SubmissionStatus::Running {
                continue;
            }

            submission.status = SubmissionStatus::Error;
            submission.failure_reason = Some(ABANDONED_REASON.to_string());
            submission.completed_at = Some(Utc::now());

            if self.inner.store.finish(&submission).await? {
                warn!(submission_id = %id, "Stale execution marked as abandoned");
                reconciled.push(id);
            }
        }
        Ok(reconciled)
    }

    /// Pending submissions older than `max_age`
    ///
    /// These were admitted but never started, typically because the process
    /// that popped them from the intake queue died. Executing them again is
    /// safe: `execute` is a no-op for anything already claimed.
    pub async fn stale_pending(&self, max_age: Duration) -> Result<Vec<Uuid>> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| JudgeError::Config(format!("invalid reconciliation age: {}", e)))?;
        self.inner.store.stale_pending(Utc::now() - max_age).await
    }

    /// Wait for every in-flight execution and refuse new ones
    pub async fn shutdown(&self) {
        let permits = self.inner.pool_size as u32;
        if let Ok(all) = self.inner.permits.acquire_many(permits).await {
            all.forget();
        }
        self.inner.permits.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
