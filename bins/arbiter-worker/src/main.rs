use anyhow::Context;
use arbiter_common::redis::{IntakeQueue, QUEUE_KEY};
use arbiter_common::{Config, ExecutionBackend, LanguageRegistry};
use arbiter_engine::{
    DockerSandbox, ExecutionSettings, Orchestrator, QuestionDirectory, RedisStore, RemoteJudge,
    Sandbox,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// BLPOP timeout; bounds how long shutdown waits on an idle queue
const POP_TIMEOUT_SECS: f64 = 5.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Arbiter worker booting...");

    let config = Config::from_env().context("invalid configuration")?;

    let registry = match &config.language_config_path {
        Some(path) => LanguageRegistry::load_from_file(path)
            .with_context(|| format!("failed to load language profiles from {}", path.display()))?,
        None => LanguageRegistry::builtin(),
    };
    info!(
        languages = ?registry.enabled_languages(),
        "Loaded language profiles"
    );

    let sandbox = build_sandbox(&config).await?;
    prepare_languages(sandbox.as_ref(), &registry).await;

    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
    let mut queue = IntakeQueue::connect(&config.redis_url)
        .await
        .context("failed to open intake queue connection")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        sandbox,
        Arc::new(store),
        Arc::new(QuestionDirectory::new(&config.questions_dir)),
        ExecutionSettings::from_config(&config),
        config.max_concurrent_submissions,
    );

    // Anything still `running` this old was lost by a previous process
    let reconciled = orchestrator
        .reconcile_stale(Duration::from_secs(config.stale_running_secs))
        .await
        .context("reconciliation sweep failed")?;
    if !reconciled.is_empty() {
        warn!(count = reconciled.len(), "Marked abandoned submissions as errored");
    }

    // Admitted but never popped (lost push, worker died between pop and begin)
    let stranded = orchestrator
        .stale_pending(Duration::from_secs(config.stale_running_secs))
        .await
        .context("pending sweep failed")?;
    for id in &stranded {
        queue.push(id).await.context("failed to requeue pending submission")?;
    }
    if !stranded.is_empty() {
        warn!(count = stranded.len(), "Requeued stranded pending submissions");
    }

    info!(
        queue = QUEUE_KEY,
        pool = config.max_concurrent_submissions,
        backend = ?config.backend,
        "Listening for submissions"
    );

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, draining in-flight executions...");
    };

    tokio::select! {
        _ = worker_loop(&mut queue, &orchestrator) => {},
        _ = shutdown => {},
    }

    orchestrator.shutdown().await;
    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn build_sandbox(config: &Config) -> anyhow::Result<Arc<dyn Sandbox>> {
    match config.backend {
        ExecutionBackend::Local => {
            let sandbox = DockerSandbox::connect(&config.workdir_root)
                .context("failed to create Docker client")?;
            sandbox
                .ping()
                .await
                .context("Docker daemon is not reachable")?;

            let removed = sandbox.remove_orphans().await?;
            if removed > 0 {
                warn!(removed, "Removed sandbox containers left by a previous run");
            }
            info!(workdir_root = %config.workdir_root.display(), "Using local Docker sandbox");
            Ok(Arc::new(sandbox))
        }
        ExecutionBackend::Remote => {
            let judge = RemoteJudge::new(
                config.remote_judge_url.clone(),
                config.remote_judge_token.clone(),
                Duration::from_millis(config.remote_poll_interval_ms),
                config.remote_max_polls,
            )
            .context("failed to create remote judge client")?;
            info!(
                url = %config.remote_judge_url,
                max_polls = config.remote_max_polls,
                "Using remote judge"
            );
            Ok(Arc::new(judge))
        }
    }
}

/// Pull every enabled language's runtime up front; the first submission of
/// a language then does not wait on a registry download
async fn prepare_languages(sandbox: &dyn Sandbox, registry: &LanguageRegistry) {
    for language in registry.enabled_languages() {
        let Ok(profile) = registry.get(language) else {
            continue;
        };
        match sandbox.prepare(profile).await {
            Ok(()) => debug!(%language, image = %profile.image, "Sandbox ready"),
            Err(e) => warn!(%language, error = %e, "Failed to prepare sandbox, retrying per submission"),
        }
    }
}

async fn worker_loop(queue: &mut IntakeQueue, orchestrator: &Orchestrator) {
    loop {
        // Take a pool slot first so the backlog stays in Redis, not in memory
        let slot = match orchestrator.reserve().await {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "Execution pool unavailable, stopping intake");
                break;
            }
        };

        // BLPOP with a timeout so shutdown is noticed on an idle queue
        match queue.pop(POP_TIMEOUT_SECS).await {
            Ok(Some(submission_id)) => {
                debug!(submission_id = %submission_id, "Popped submission");
                // Fire and forget: the pool owns the execution from here
                drop(orchestrator.schedule_reserved(slot, submission_id));
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Failed to read from intake queue");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
