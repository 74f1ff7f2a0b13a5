use std::sync::Arc;

use chrono::Utc;
use scout_core::{ManualAnnotation, ScoutError, TrainingData, TrainingStats};
use scout_storage::CaptchaRepository;
use tracing::info;

/// Largest pixel error at which an automatic estimate still counts as correct.
pub const DEFAULT_TOLERANCE_PX: u32 = 5;

pub struct TrainingService {
    repository: Arc<dyn CaptchaRepository>,
    tolerance: u32,
}

impl TrainingService {
    pub fn new(repository: Arc<dyn CaptchaRepository>) -> Self {
        Self {
            repository,
            tolerance: DEFAULT_TOLERANCE_PX,
        }
    }

    pub fn with_tolerance(mut self, tolerance: u32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Stores a human correction for an attempt. Annotating the same attempt again
    /// replaces the earlier correction.
    pub async fn annotate_manually(
        &self,
        annotation: ManualAnnotation,
    ) -> Result<TrainingData, ScoutError> {
        let attempt_id = annotation
            .attempt_id
            .filter(|id| !id.is_nil())
            .ok_or_else(|| ScoutError::validation("attempt_id is required"))?;
        let gap_position = annotation
            .gap_position
            .ok_or_else(|| ScoutError::validation("gap_position is required"))?;
        let gap_position = u32::try_from(gap_position).map_err(|_| {
            ScoutError::validation(format!(
                "gap_position must be a non-negative pixel offset, got {gap_position}"
            ))
        })?;
        let annotated_by = annotation
            .annotated_by
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ScoutError::validation("annotated_by is required"))?;

        let attempt = self
            .repository
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| ScoutError::NotFound(format!("captcha attempt {attempt_id}")))?;

        let row = TrainingData::labeled(&attempt, gap_position, annotated_by, self.tolerance, Utc::now());
        let stored = self.repository.upsert_training(&row).await?;
        info!(
            attempt_id = %attempt_id,
            position_error = stored.position_error,
            label = %stored.label,
            "captcha attempt annotated"
        );
        Ok(stored)
    }

    pub async fn get_training_stats(&self) -> Result<TrainingStats, ScoutError> {
        let attempts = self.repository.list_attempts().await?;
        let training = self.repository.list_training().await?;
        Ok(TrainingStats::from_records(&attempts, &training))
    }
}
