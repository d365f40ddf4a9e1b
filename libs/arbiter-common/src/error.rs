use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the judge core
///
/// Per-test failures never show up here: they are folded into
/// `TestVerdict`s by the evaluator. What remains is either rejected
/// synchronously (language, question, submission lookups) or recorded as a
/// pipeline failure on the submission.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("language {0} is not supported")]
    UnsupportedLanguage(String),

    #[error("question {0} not found")]
    QuestionNotFound(String),

    #[error("submission {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("pipeline failure: {0}")]
    Pipeline(String),
}

impl From<redis::RedisError> for JudgeError {
    fn from(e: redis::RedisError) -> Self {
        JudgeError::Store(e.to_string())
    }
}

impl JudgeError {
    /// Rejections that happen before any submission record exists
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            JudgeError::UnsupportedLanguage(_) | JudgeError::QuestionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = JudgeError::UnsupportedLanguage("cobol".to_string());
        assert_eq!(err.to_string(), "language cobol is not supported");

        let err = JudgeError::QuestionNotFound("two-sum".to_string());
        assert_eq!(err.to_string(), "question two-sum not found");
    }

    #[test]
    fn test_rejection_classification() {
        assert!(JudgeError::UnsupportedLanguage("x".into()).is_rejection());
        assert!(JudgeError::QuestionNotFound("q".into()).is_rejection());
        assert!(!JudgeError::Pipeline("boom".into()).is_rejection());
        assert!(!JudgeError::SubmissionNotFound(Uuid::new_v4()).is_rejection());
    }

    #[test]
    fn test_json_error_converts() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: JudgeError = parse.unwrap_err().into();
        assert!(matches!(err, JudgeError::Serialization(_)));
    }
}
