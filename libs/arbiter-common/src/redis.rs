use crate::error::{JudgeError, Result};
use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Redis key layout, shared by the worker, the store and the CLI so they
/// never drift apart

pub const QUEUE_KEY: &str = "arbiter:queue";
pub const SUBMISSION_PREFIX: &str = "arbiter:submission";
pub const STATUS_PREFIX: &str = "arbiter:status";
pub const USER_INDEX_PREFIX: &str = "arbiter:user";
/// Sorted set of running submissions scored by start time (unix millis)
pub const RUNNING_KEY: &str = "arbiter:running";
/// Sorted set of pending submissions scored by submission time (unix millis)
pub const PENDING_KEY: &str = "arbiter:pending";

/// Full submission record (JSON)
pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

/// Bare status string, the field the at-most-once guard runs against
pub fn status_key(id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, id)
}

/// Sorted set of a user's submissions scored by submission time
pub fn user_index_key(user_id: &str) -> String {
    format!("{}:{}:submissions", USER_INDEX_PREFIX, user_id)
}

/// Worker intake queue of submission ids
///
/// Owns a dedicated connection: BLPOP holds its socket for the whole pop
/// timeout, and commands multiplexed onto the same socket would wait
/// behind it.
#[derive(Clone)]
pub struct IntakeQueue {
    conn: ConnectionManager,
}

impl IntakeQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Append an admitted submission
    pub async fn push(&mut self, id: &Uuid) -> Result<()> {
        let _: i64 = redis::cmd("RPUSH")
            .arg(QUEUE_KEY)
            .arg(id.to_string())
            .query_async(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Blocking pop with a timeout so callers can check for shutdown
    ///
    /// Returns `Ok(None)` when the timeout elapsed with an empty queue.
    pub async fn pop(&mut self, timeout_secs: f64) -> Result<Option<Uuid>> {
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(QUEUE_KEY)
            .arg(timeout_secs)
            .query_async(&mut self.conn)
            .await?;

        match popped {
            Some((_, payload)) => parse_queued_id(&payload).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_queued_id(payload: &str) -> Result<Uuid> {
    Uuid::parse_str(payload.trim()).map_err(|e| {
        JudgeError::Store(format!("invalid submission id {:?} on intake queue: {}", payload, e))
    })
}
