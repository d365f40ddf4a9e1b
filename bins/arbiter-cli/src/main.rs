mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Run, submit and inspect code submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List language profiles
    Langs {
        /// JSON file with profile overrides (defaults to LANGUAGE_CONFIG_PATH)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Judge a source file against a question file locally and print the result
    Judge {
        /// Question JSON file ({"test_cases": [...]})
        #[arg(short, long)]
        question: PathBuf,

        /// Language key (python, java, cpp, javascript)
        #[arg(short, long)]
        language: String,

        /// Source file to judge
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Store a pending submission and queue its id for the worker
    Submit {
        #[arg(short, long)]
        user: String,

        /// Question id, looked up in QUESTIONS_DIR
        #[arg(short, long)]
        question: String,

        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        source: PathBuf,
    },

    /// Show a persisted submission
    Status {
        /// Submission id
        id: Uuid,
    },

    /// List a user's recent submissions
    History {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        question: Option<String>,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Mark submissions stuck in `running` as errored and requeue stranded
    /// `pending` ones
    Reconcile {
        /// Age after which a submission counts as abandoned
        /// (defaults to STALE_RUNNING_SECS)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Langs { config } => {
            commands::list_languages(config.as_deref())?;
        }
        Commands::Judge {
            question,
            language,
            source,
        } => {
            commands::judge(&question, &language, &source).await?;
        }
        Commands::Submit {
            user,
            question,
            language,
            source,
        } => {
            commands::submit(&user, &question, &language, &source).await?;
        }
        Commands::Status { id } => {
            commands::show_status(&id).await?;
        }
        Commands::History {
            user,
            question,
            limit,
        } => {
            commands::show_history(&user, question.as_deref(), limit).await?;
        }
        Commands::Reconcile { max_age_secs } => {
            commands::reconcile(max_age_secs).await?;
        }
    }

    Ok(())
}
