use std::sync::Arc;

use chrono::Utc;
use scout_core::{AttemptOutcome, CaptchaAttempt, ImageRef, ScoutError};
use scout_storage::{CaptchaRepository, ImageArchive, OutcomeWrite};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::estimator::{GapEstimator, TemplateMatchEstimator};

/// Image bytes plus where they came from (URL or local path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeImage {
    pub reference: String,
    pub bytes: Vec<u8>,
}

impl ChallengeImage {
    pub fn new(reference: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            reference: reference.into(),
            bytes,
        }
    }

    fn validate(&self, role: &str) -> Result<(), ScoutError> {
        if self.reference.trim().is_empty() {
            return Err(ScoutError::validation(format!("{role} image reference is missing")));
        }
        if self.bytes.is_empty() {
            return Err(ScoutError::validation(format!(
                "{role} image {} has no bytes",
                self.reference
            )));
        }
        Ok(())
    }
}

pub struct CaptchaSolver {
    estimator: Arc<dyn GapEstimator>,
    repository: Arc<dyn CaptchaRepository>,
    archive: Option<ImageArchive>,
}

impl CaptchaSolver {
    pub fn new(repository: Arc<dyn CaptchaRepository>) -> Self {
        Self::with_estimator(repository, Arc::new(TemplateMatchEstimator::new()))
    }

    pub fn with_estimator(
        repository: Arc<dyn CaptchaRepository>,
        estimator: Arc<dyn GapEstimator>,
    ) -> Self {
        Self {
            estimator,
            repository,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ImageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn repository(&self) -> Arc<dyn CaptchaRepository> {
        Arc::clone(&self.repository)
    }

    /// Estimates the gap and records a pending attempt.
    pub async fn solve(
        &self,
        challenge: ChallengeImage,
        piece: ChallengeImage,
        metadata: Option<JsonValue>,
    ) -> Result<CaptchaAttempt, ScoutError> {
        challenge.validate("challenge")?;
        piece.validate("piece")?;

        let estimate = self.estimator.estimate(&challenge.bytes, &piece.bytes).await?;
        let attempt = CaptchaAttempt {
            id: Uuid::new_v4(),
            challenge_image: self.image_ref("challenges", &challenge).await?,
            piece_image: self.image_ref("pieces", &piece).await?,
            metadata,
            estimated_position: estimate.position,
            confidence: estimate.confidence,
            created_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
            actual_position: None,
            validated_at: None,
        };
        self.repository.insert_attempt(&attempt).await?;
        debug!(
            attempt_id = %attempt.id,
            position = estimate.position,
            confidence = estimate.confidence,
            "captcha gap estimated"
        );
        Ok(attempt)
    }

    async fn image_ref(&self, namespace: &str, image: &ChallengeImage) -> Result<ImageRef, ScoutError> {
        let sha256 = ImageArchive::sha256_hex(&image.bytes);
        let archived_path = match &self.archive {
            Some(archive) => {
                let stored = archive.store(namespace, &image.bytes).await?;
                Some(stored.relative_path.to_string_lossy().into_owned())
            }
            None => None,
        };
        Ok(ImageRef {
            reference: image.reference.clone(),
            sha256,
            archived_path,
        })
    }

    /// Records whether the submitted estimate was accepted. The first terminal outcome sticks.
    pub async fn validate_result(
        &self,
        attempt_id: Uuid,
        success: bool,
        actual_position: Option<u32>,
    ) -> Result<CaptchaAttempt, ScoutError> {
        if success && actual_position.is_none() {
            return Err(ScoutError::validation(
                "a successful attempt needs the actual gap position",
            ));
        }
        let outcome = AttemptOutcome::from_success(success);
        let write = self
            .repository
            .record_outcome(attempt_id, outcome, actual_position, Utc::now())
            .await?
            .ok_or_else(|| ScoutError::NotFound(format!("captcha attempt {attempt_id}")))?;

        match write {
            OutcomeWrite::Applied(attempt) => {
                info!(attempt_id = %attempt_id, outcome = outcome.as_str(), "captcha attempt validated");
                Ok(attempt)
            }
            OutcomeWrite::Unchanged(attempt) => Ok(attempt),
            OutcomeWrite::Conflict(attempt) => {
                warn!(
                    attempt_id = %attempt_id,
                    existing = attempt.outcome.as_str(),
                    requested = outcome.as_str(),
                    "conflicting captcha validation rejected"
                );
                Err(ScoutError::validation(format!(
                    "attempt {attempt_id} was already validated as {}",
                    attempt.outcome.as_str()
                )))
            }
        }
    }
}
