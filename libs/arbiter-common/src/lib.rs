pub mod config;
pub mod error;
pub mod language;
pub mod redis;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{Config, ExecutionBackend};
pub use error::{JudgeError, Result};
pub use language::{Language, LanguageProfile, LanguageRegistry};
pub use types::{
    Question, Submission, SubmissionReceipt, SubmissionStatus, TestCase, TestVerdict,
};
