use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{AttemptOutcome, CaptchaAttempt, ImageRef, TrainingData};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::history::{CREATE_ANALYSES, CREATE_ANALYSES_INDEX};

/// Result of a compare-and-set on an attempt's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeWrite {
    /// The attempt was pending and now carries the new outcome.
    Applied(CaptchaAttempt),
    /// The attempt already had this outcome; nothing changed.
    Unchanged(CaptchaAttempt),
    /// The attempt already had a different outcome, which is kept.
    Conflict(CaptchaAttempt),
}

/// Durable home of CAPTCHA attempts and their training rows.
#[async_trait]
pub trait CaptchaRepository: Send + Sync {
    async fn insert_attempt(&self, attempt: &CaptchaAttempt) -> Result<()>;

    async fn get_attempt(&self, id: Uuid) -> Result<Option<CaptchaAttempt>>;

    /// All attempts in insertion order.
    async fn list_attempts(&self) -> Result<Vec<CaptchaAttempt>>;

    /// Sets a terminal outcome only if the attempt is still pending. `Ok(None)` when the
    /// attempt does not exist.
    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
        actual_position: Option<u32>,
        validated_at: DateTime<Utc>,
    ) -> Result<Option<OutcomeWrite>>;

    /// Inserts or replaces the row keyed by attempt id; `created_at` of an existing row survives.
    async fn upsert_training(&self, row: &TrainingData) -> Result<TrainingData>;

    async fn get_training(&self, attempt_id: Uuid) -> Result<Option<TrainingData>>;

    async fn list_training(&self) -> Result<Vec<TrainingData>>;
}

fn ensure_terminal(outcome: AttemptOutcome) -> Result<()> {
    if outcome == AttemptOutcome::Pending {
        bail!("an attempt outcome can only be set to success or failure");
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    attempts: HashMap<Uuid, CaptchaAttempt>,
    order: Vec<Uuid>,
    training: HashMap<Uuid, TrainingData>,
}

#[derive(Debug, Default)]
pub struct MemoryCaptchaRepository {
    state: RwLock<MemoryState>,
}

impl MemoryCaptchaRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaptchaRepository for MemoryCaptchaRepository {
    async fn insert_attempt(&self, attempt: &CaptchaAttempt) -> Result<()> {
        let mut state = self.state.write().await;
        if state.attempts.contains_key(&attempt.id) {
            bail!("attempt {} already exists", attempt.id);
        }
        state.order.push(attempt.id);
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<CaptchaAttempt>> {
        Ok(self.state.read().await.attempts.get(&id).cloned())
    }

    async fn list_attempts(&self) -> Result<Vec<CaptchaAttempt>> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.attempts.get(id).cloned())
            .collect())
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
        actual_position: Option<u32>,
        validated_at: DateTime<Utc>,
    ) -> Result<Option<OutcomeWrite>> {
        ensure_terminal(outcome)?;
        let mut state = self.state.write().await;
        let Some(attempt) = state.attempts.get_mut(&id) else {
            return Ok(None);
        };
        let write = if attempt.outcome == AttemptOutcome::Pending {
            attempt.outcome = outcome;
            attempt.actual_position = actual_position;
            attempt.validated_at = Some(validated_at);
            OutcomeWrite::Applied(attempt.clone())
        } else if attempt.outcome == outcome {
            OutcomeWrite::Unchanged(attempt.clone())
        } else {
            OutcomeWrite::Conflict(attempt.clone())
        };
        Ok(Some(write))
    }

    async fn upsert_training(&self, row: &TrainingData) -> Result<TrainingData> {
        let mut state = self.state.write().await;
        if !state.attempts.contains_key(&row.attempt_id) {
            bail!("training row references unknown attempt {}", row.attempt_id);
        }
        let mut stored = row.clone();
        if let Some(existing) = state.training.get(&row.attempt_id) {
            stored.created_at = existing.created_at;
        }
        state.training.insert(row.attempt_id, stored.clone());
        Ok(stored)
    }

    async fn get_training(&self, attempt_id: Uuid) -> Result<Option<TrainingData>> {
        Ok(self.state.read().await.training.get(&attempt_id).cloned())
    }

    async fn list_training(&self) -> Result<Vec<TrainingData>> {
        let mut rows: Vec<_> = self.state.read().await.training.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.attempt_id.cmp(&b.attempt_id))
        });
        Ok(rows)
    }
}

const CREATE_ATTEMPTS: &str = "CREATE TABLE IF NOT EXISTS captcha_attempts (
    id TEXT PRIMARY KEY,
    challenge_reference TEXT NOT NULL,
    challenge_sha256 TEXT NOT NULL,
    challenge_archived_path TEXT,
    piece_reference TEXT NOT NULL,
    piece_sha256 TEXT NOT NULL,
    piece_archived_path TEXT,
    metadata TEXT,
    estimated_position INTEGER NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    outcome TEXT NOT NULL,
    actual_position INTEGER,
    validated_at TEXT
)";

const CREATE_TRAINING: &str = "CREATE TABLE IF NOT EXISTS captcha_training (
    attempt_id TEXT PRIMARY KEY REFERENCES captcha_attempts(id),
    corrected_position INTEGER NOT NULL,
    annotated_by TEXT NOT NULL,
    estimated_position INTEGER NOT NULL,
    position_error INTEGER NOT NULL,
    estimate_was_correct INTEGER NOT NULL,
    label TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const SELECT_ATTEMPT: &str = "SELECT id, challenge_reference, challenge_sha256, challenge_archived_path, \
    piece_reference, piece_sha256, piece_archived_path, metadata, estimated_position, confidence, \
    created_at, outcome, actual_position, validated_at FROM captcha_attempts";

const SELECT_TRAINING: &str = "SELECT attempt_id, corrected_position, annotated_by, estimated_position, \
    position_error, estimate_was_correct, label, created_at, updated_at FROM captcha_training";

/// SQLite-backed repository for CAPTCHA attempts, training rows and the analysis history;
/// tables are created on connect.
#[derive(Debug, Clone)]
pub struct SqliteCaptchaRepository {
    pool: SqlitePool,
}

impl SqliteCaptchaRepository {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing sqlite url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await
            .context("enabling WAL mode")?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let repo = Self { pool };
        repo.create_tables().await?;
        Ok(repo)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_tables(&self) -> Result<()> {
        sqlx::query(CREATE_ATTEMPTS)
            .execute(&self.pool)
            .await
            .context("creating captcha_attempts")?;
        sqlx::query(CREATE_TRAINING)
            .execute(&self.pool)
            .await
            .context("creating captcha_training")?;
        for statement in [CREATE_ANALYSES, CREATE_ANALYSES_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating market_analyses")?;
        }
        info!("captcha and analysis tables ready");
        Ok(())
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{column} out of range: {value}"))
}

fn attempt_from_row(row: &SqliteRow) -> Result<CaptchaAttempt> {
    let id: String = row.try_get("id")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let outcome: String = row.try_get("outcome")?;
    let actual_position: Option<i64> = row.try_get("actual_position")?;
    let validated_at: Option<String> = row.try_get("validated_at")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(CaptchaAttempt {
        id: Uuid::parse_str(&id).with_context(|| format!("parsing attempt id {id}"))?,
        challenge_image: ImageRef {
            reference: row.try_get("challenge_reference")?,
            sha256: row.try_get("challenge_sha256")?,
            archived_path: row.try_get("challenge_archived_path")?,
        },
        piece_image: ImageRef {
            reference: row.try_get("piece_reference")?,
            sha256: row.try_get("piece_sha256")?,
            archived_path: row.try_get("piece_archived_path")?,
        },
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("parsing attempt metadata")?,
        estimated_position: to_u32(row.try_get("estimated_position")?, "estimated_position")?,
        confidence: row.try_get("confidence")?,
        created_at: parse_timestamp(&created_at)?,
        outcome: outcome.parse::<AttemptOutcome>()?,
        actual_position: actual_position
            .map(|v| to_u32(v, "actual_position"))
            .transpose()?,
        validated_at: validated_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn training_from_row(row: &SqliteRow) -> Result<TrainingData> {
    let attempt_id: String = row.try_get("attempt_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(TrainingData {
        attempt_id: Uuid::parse_str(&attempt_id)
            .with_context(|| format!("parsing attempt id {attempt_id}"))?,
        corrected_position: to_u32(row.try_get("corrected_position")?, "corrected_position")?,
        annotated_by: row.try_get("annotated_by")?,
        estimated_position: to_u32(row.try_get("estimated_position")?, "estimated_position")?,
        position_error: to_u32(row.try_get("position_error")?, "position_error")?,
        estimate_was_correct: row.try_get("estimate_was_correct")?,
        label: row.try_get("label")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait]
impl CaptchaRepository for SqliteCaptchaRepository {
    async fn insert_attempt(&self, attempt: &CaptchaAttempt) -> Result<()> {
        let metadata = attempt
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing attempt metadata")?;
        sqlx::query(
            "INSERT INTO captcha_attempts (\
                id, challenge_reference, challenge_sha256, challenge_archived_path, \
                piece_reference, piece_sha256, piece_archived_path, metadata, \
                estimated_position, confidence, created_at, outcome, actual_position, validated_at\
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id.to_string())
        .bind(&attempt.challenge_image.reference)
        .bind(&attempt.challenge_image.sha256)
        .bind(&attempt.challenge_image.archived_path)
        .bind(&attempt.piece_image.reference)
        .bind(&attempt.piece_image.sha256)
        .bind(&attempt.piece_image.archived_path)
        .bind(metadata)
        .bind(i64::from(attempt.estimated_position))
        .bind(attempt.confidence)
        .bind(attempt.created_at.to_rfc3339())
        .bind(attempt.outcome.as_str())
        .bind(attempt.actual_position.map(i64::from))
        .bind(attempt.validated_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting attempt {}", attempt.id))?;
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<CaptchaAttempt>> {
        let row = sqlx::query(&format!("{SELECT_ATTEMPT} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading attempt {id}"))?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn list_attempts(&self) -> Result<Vec<CaptchaAttempt>> {
        let rows = sqlx::query(&format!("{SELECT_ATTEMPT} ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await
            .context("listing attempts")?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
        actual_position: Option<u32>,
        validated_at: DateTime<Utc>,
    ) -> Result<Option<OutcomeWrite>> {
        ensure_terminal(outcome)?;
        let updated = sqlx::query(
            "UPDATE captcha_attempts SET outcome = ?, actual_position = ?, validated_at = ? \
             WHERE id = ? AND outcome = 'pending'",
        )
        .bind(outcome.as_str())
        .bind(actual_position.map(i64::from))
        .bind(validated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording outcome for attempt {id}"))?;

        let Some(current) = self.get_attempt(id).await? else {
            return Ok(None);
        };
        let write = if updated.rows_affected() == 1 {
            OutcomeWrite::Applied(current)
        } else if current.outcome == outcome {
            OutcomeWrite::Unchanged(current)
        } else {
            OutcomeWrite::Conflict(current)
        };
        Ok(Some(write))
    }

    async fn upsert_training(&self, row: &TrainingData) -> Result<TrainingData> {
        sqlx::query(
            "INSERT INTO captcha_training (\
                attempt_id, corrected_position, annotated_by, estimated_position, position_error, \
                estimate_was_correct, label, created_at, updated_at\
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
            ON CONFLICT(attempt_id) DO UPDATE SET \
                corrected_position = excluded.corrected_position, \
                annotated_by = excluded.annotated_by, \
                estimated_position = excluded.estimated_position, \
                position_error = excluded.position_error, \
                estimate_was_correct = excluded.estimate_was_correct, \
                label = excluded.label, \
                updated_at = excluded.updated_at",
        )
        .bind(row.attempt_id.to_string())
        .bind(i64::from(row.corrected_position))
        .bind(&row.annotated_by)
        .bind(i64::from(row.estimated_position))
        .bind(i64::from(row.position_error))
        .bind(row.estimate_was_correct)
        .bind(&row.label)
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting training row for {}", row.attempt_id))?;

        self.get_training(row.attempt_id)
            .await?
            .with_context(|| format!("training row for {} vanished after upsert", row.attempt_id))
    }

    async fn get_training(&self, attempt_id: Uuid) -> Result<Option<TrainingData>> {
        let row = sqlx::query(&format!("{SELECT_TRAINING} WHERE attempt_id = ?"))
            .bind(attempt_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading training row {attempt_id}"))?;
        row.as_ref().map(training_from_row).transpose()
    }

    async fn list_training(&self) -> Result<Vec<TrainingData>> {
        let rows = sqlx::query(&format!("{SELECT_TRAINING} ORDER BY created_at, attempt_id"))
            .fetch_all(&self.pool)
            .await
            .context("listing training rows")?;
        rows.iter().map(training_from_row).collect()
    }
}
