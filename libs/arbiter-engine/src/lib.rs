pub mod aggregator;
pub mod compiler;
pub mod evaluator;
pub mod executor;
pub mod intake;
pub mod orchestrator;
pub mod questions;
pub mod sandbox;
pub mod store;
pub mod workspace;

pub use executor::ExecutionSettings;
pub use intake::admit;
pub use orchestrator::{ExecutionHandle, ExecutionOutcome, ExecutionSlot, Orchestrator};
pub use questions::{QuestionDirectory, QuestionLookup, StaticQuestions};
pub use sandbox::{DockerSandbox, RemoteJudge, Sandbox, SandboxError};
pub use store::{MemoryStore, RedisStore, SubmissionStore};
