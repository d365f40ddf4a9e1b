/// Submission intake
///
/// Validates a request and persists it as `pending`. Unsupported languages
/// and unknown questions are rejected here, before any record exists, so
/// every caller (the orchestrator, the CLI feeding the worker queue) gets
/// the same synchronous answer.
use crate::questions::QuestionLookup;
use crate::store::SubmissionStore;
use arbiter_common::{LanguageRegistry, Result, Submission};
use tracing::info;

pub async fn admit(
    registry: &LanguageRegistry,
    questions: &dyn QuestionLookup,
    store: &dyn SubmissionStore,
    user_id: &str,
    question_id: &str,
    language: &str,
    source_code: &str,
) -> Result<Submission> {
    let profile = registry.resolve(language)?;
    questions.lookup(question_id).await?;

    let submission = Submission::new(user_id, question_id, profile.language, source_code);
    store.insert(&submission).await?;

    info!(
        submission_id = %submission.id,
        user_id,
        question_id,
        language = %profile.language,
        "Submission queued"
    );
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questions::StaticQuestions;
    use crate::store::MemoryStore;
    use arbiter_common::{JudgeError, Language, Question, SubmissionStatus};

    fn questions() -> StaticQuestions {
        StaticQuestions::new().with("sum", Question::default())
    }

    #[tokio::test]
    async fn test_admit_persists_pending_record() {
        let registry = LanguageRegistry::builtin();
        let store = MemoryStore::new();

        let submission = admit(&registry, &questions(), &store, "u1", "sum", "Python", "print(3)")
            .await
            .unwrap();

        assert_eq!(submission.language, Language::Python);
        let stored = store.get(&submission.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubmissionStatus::Pending);
        assert_eq!(stored.source_code, "print(3)");
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn test_admit_rejects_before_persisting() {
        let registry = LanguageRegistry::builtin();
        let store = MemoryStore::new();

        let err = admit(&registry, &questions(), &store, "u1", "sum", "cobol", "")
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(_)));

        let err = admit(&registry, &questions(), &store, "u1", "nope", "cpp", "")
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::QuestionNotFound(_)));

        assert!(store.list_for_user("u1", None, 10).await.unwrap().is_empty());
    }
}
