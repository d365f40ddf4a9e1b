use arbiter_common::{JudgeError, Question, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves a question id to its test cases
///
/// Returns `QuestionNotFound` for ids it cannot resolve. Test cases are
/// treated as immutable once handed out.
#[async_trait]
pub trait QuestionLookup: Send + Sync {
    async fn lookup(&self, question_id: &str) -> Result<Question>;
}

/// Fixed in-memory question set
#[derive(Debug, Clone, Default)]
pub struct StaticQuestions {
    questions: HashMap<String, Question>,
}

impl StaticQuestions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, question_id: impl Into<String>, question: Question) -> Self {
        self.insert(question_id, question);
        self
    }

    pub fn insert(&mut self, question_id: impl Into<String>, question: Question) {
        self.questions.insert(question_id.into(), question);
    }
}

#[async_trait]
impl QuestionLookup for StaticQuestions {
    async fn lookup(&self, question_id: &str) -> Result<Question> {
        self.questions
            .get(question_id)
            .cloned()
            .ok_or_else(|| JudgeError::QuestionNotFound(question_id.to_string()))
    }
}

/// One JSON file per question: `{dir}/{question_id}.json`
#[derive(Debug, Clone)]
pub struct QuestionDirectory {
    dir: PathBuf,
}

impl QuestionDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load a question from an explicit path, outside any directory
    pub async fn load_file(path: &Path) -> Result<Question> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            JudgeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Ids double as file names, so anything that could leave the directory is
/// rejected
fn is_valid_question_id(question_id: &str) -> bool {
    !question_id.is_empty()
        && question_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl QuestionLookup for QuestionDirectory {
    async fn lookup(&self, question_id: &str) -> Result<Question> {
        if !is_valid_question_id(question_id) {
            return Err(JudgeError::QuestionNotFound(question_id.to_string()));
        }

        let path = self.dir.join(format!("{}.json", question_id));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JudgeError::QuestionNotFound(question_id.to_string()))
            }
            Err(e) => {
                return Err(JudgeError::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let question: Question = serde_json::from_str(&content)?;
        debug!(
            question_id,
            test_cases = question.test_cases.len(),
            "Loaded question"
        );
        Ok(question)
    }
}
