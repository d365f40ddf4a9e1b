/// Submission persistence
///
/// The orchestrator is the only writer. Both status transitions are guarded
/// inside the store so that racing writers cannot break monotonicity:
/// `try_begin` only moves `pending → running`, `finish` only moves
/// `running → completed | error`.
use arbiter_common::redis::{
    status_key, submission_key, user_index_key, PENDING_KEY, RUNNING_KEY,
};
use arbiter_common::{JudgeError, Result, Submission, SubmissionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Persist a new `pending` submission
    async fn insert(&self, submission: &Submission) -> Result<()>;

    async fn get(&self, id: &Uuid) -> Result<Option<Submission>>;

    /// Atomically move a pending submission to `running`
    ///
    /// Returns the running record when this caller won the transition,
    /// `None` when the submission was already running or terminal.
    async fn try_begin(&self, id: &Uuid, started_at: DateTime<Utc>) -> Result<Option<Submission>>;

    /// Write a terminal record, only if the stored one is still `running`
    ///
    /// Returns whether the write happened.
    async fn finish(&self, submission: &Submission) -> Result<bool>;

    /// Ids of submissions that entered `running` before `started_before`
    async fn stale_running(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Ids of submissions still `pending` that were submitted before
    /// `submitted_before`
    async fn stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// A user's submissions, newest first
    async fn list_for_user(
        &self,
        user_id: &str,
        question_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Submission>>;
}

fn running_copy(submission: &Submission, started_at: DateTime<Utc>) -> Submission {
    let mut running = submission.clone();
    running.status = SubmissionStatus::Running;
    running.started_at = Some(started_at);
    running
}

fn ensure_terminal(submission: &Submission) -> Result<()> {
    if submission.status.is_terminal() {
        Ok(())
    } else {
        Err(JudgeError::Store(format!(
            "refusing to finish submission {} with non-terminal status {}",
            submission.id, submission.status
        )))
    }
}

/// In-process store for tests and one-shot CLI runs
#[derive(Default)]
pub struct MemoryStore {
    submissions: RwLock<HashMap<Uuid, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert(&self, submission: &Submission) -> Result<()> {
        let mut submissions = self.submissions.write().await;
        if submissions.contains_key(&submission.id) {
            return Err(JudgeError::Store(format!(
                "submission {} already exists",
                submission.id
            )));
        }
        submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Submission>> {
        Ok(self.submissions.read().await.get(id).cloned())
    }

    async fn try_begin(&self, id: &Uuid, started_at: DateTime<Utc>) -> Result<Option<Submission>> {
        let mut submissions = self.submissions.write().await;
        let stored = submissions
            .get_mut(id)
            .ok_or(JudgeError::SubmissionNotFound(*id))?;

        if !stored.status.can_transition_to(SubmissionStatus::Running) {
            return Ok(None);
        }
        let running = running_copy(stored, started_at);
        *stored = running.clone();
        Ok(Some(running))
    }

    async fn finish(&self, submission: &Submission) -> Result<bool> {
        ensure_terminal(submission)?;
        let mut submissions = self.submissions.write().await;
        let stored = submissions
            .get_mut(&submission.id)
            .ok_or(JudgeError::SubmissionNotFound(submission.id))?;

        if !stored.status.can_transition_to(submission.status) {
            return Ok(false);
        }
        *stored = submission.clone();
        Ok(true)
    }

    async fn stale_running(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let submissions = self.submissions.read().await;
        Ok(submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Running)
            .filter(|s| s.started_at.map_or(true, |t| t < started_before))
            .map(|s| s.id)
            .collect())
    }

    async fn stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let submissions = self.submissions.read().await;
        let mut stale: Vec<&Submission> = submissions
            .values()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .filter(|s| s.submitted_at < submitted_before)
            .collect();
        stale.sort_by_key(|s| s.submitted_at);
        Ok(stale.into_iter().map(|s| s.id).collect())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        question_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        let submissions = self.submissions.read().await;
        let mut matching: Vec<Submission> = submissions
            .values()
            .filter(|s| s.user_id == user_id)
            .filter(|s| question_id.map_or(true, |q| s.question_id == q))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

// KEYS: status, record, running set, pending set.
// ARGV: running record, started millis, id.
const BEGIN_SCRIPT: &str = r#"
local status = redis.call('GET', KEYS[1])
if not status then
  return -1
end
if status ~= 'pending' then
  return 0
end
redis.call('SET', KEYS[1], 'running')
redis.call('SET', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
redis.call('ZREM', KEYS[4], ARGV[3])
return 1
"#;

// KEYS: status, record, running set. ARGV: terminal record, terminal status, id.
const FINISH_SCRIPT: &str = r#"
local status = redis.call('GET', KEYS[1])
if not status then
  return -1
end
if status ~= 'running' then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[3])
return 1
"#;

/// Redis-backed store shared by the worker and the CLI
///
/// Layout: the record as JSON, the bare status string next to it (the
/// field the Lua guards compare against), sorted sets of pending ids
/// (scored by submission time) and running ids (scored by start time), and
/// one sorted set per user scored by submission time.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    begin_script: redis::Script,
    finish_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            begin_script: redis::Script::new(BEGIN_SCRIPT),
            finish_script: redis::Script::new(FINISH_SCRIPT),
        }
    }

    /// Members of an index set scored strictly before `cutoff`
    async fn scored_before(&self, index: &str, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(index)
            .arg("-inf")
            .arg(format!("({}", cutoff.timestamp_millis()))
            .query_async(&mut conn)
            .await?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| JudgeError::Store(format!("invalid id {} in {}: {}", id, index, e)))
            })
            .collect()
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<Submission>> {
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| submission_key(&id))
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let records: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut submissions = Vec::with_capacity(records.len());
        for record in records.into_iter().flatten() {
            submissions.push(serde_json::from_str(&record)?);
        }
        Ok(submissions)
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn insert(&self, submission: &Submission) -> Result<()> {
        let record = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .set(submission_key(&submission.id), record)
            .ignore()
            .set(status_key(&submission.id), submission.status.as_str())
            .ignore()
            .zadd(
                user_index_key(&submission.user_id),
                submission.id.to_string(),
                submission.submitted_at.timestamp_millis(),
            )
            .ignore()
            .zadd(
                PENDING_KEY,
                submission.id.to_string(),
                submission.submitted_at.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Submission>> {
        let mut conn = self.conn.clone();
        let record: Option<String> = redis::cmd("GET")
            .arg(submission_key(id))
            .query_async(&mut conn)
            .await?;

        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn try_begin(&self, id: &Uuid, started_at: DateTime<Utc>) -> Result<Option<Submission>> {
        let current = self
            .get(id)
            .await?
            .ok_or(JudgeError::SubmissionNotFound(*id))?;
        if current.status != SubmissionStatus::Pending {
            return Ok(None);
        }

        let running = running_copy(&current, started_at);
        let record = serde_json::to_string(&running)?;
        let mut conn = self.conn.clone();

        let outcome: i64 = self
            .begin_script
            .key(status_key(id))
            .key(submission_key(id))
            .key(RUNNING_KEY)
            .key(PENDING_KEY)
            .arg(record)
            .arg(started_at.timestamp_millis())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(Some(running)),
            0 => Ok(None),
            _ => Err(JudgeError::SubmissionNotFound(*id)),
        }
    }

    async fn finish(&self, submission: &Submission) -> Result<bool> {
        ensure_terminal(submission)?;
        let record = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();

        let outcome: i64 = self
            .finish_script
            .key(status_key(&submission.id))
            .key(submission_key(&submission.id))
            .key(RUNNING_KEY)
            .arg(record)
            .arg(submission.status.as_str())
            .arg(submission.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(JudgeError::SubmissionNotFound(submission.id)),
        }
    }

    async fn stale_running(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.scored_before(RUNNING_KEY, started_before).await
    }

    async fn stale_pending(&self, submitted_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.scored_before(PENDING_KEY, submitted_before).await
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        question_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Submission>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // A question filter can discard any number of entries, so only the
        // unfiltered listing can be bounded at the index
        let stop: i64 = match question_id {
            Some(_) => -1,
            None => limit as i64 - 1,
        };

        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(user_index_key(user_id))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;

        let mut submissions = self.load_many(&ids).await?;
        if let Some(question_id) = question_id {
            submissions.retain(|s| s.question_id == question_id);
        }
        submissions.truncate(limit);
        Ok(submissions)
    }
}
