use std::sync::Arc;

use anyhow::{Context, Result};
use scout_captcha::{CaptchaSolver, TrainingService};
use scout_providers::{ProviderContext, ProviderFactory, ProvidersConfig};
use scout_storage::{
    AnalysisHistory, CaptchaRepository, HttpClientConfig, HttpFetcher, ImageArchive,
    MemoryTokenStore, SqliteCaptchaRepository,
};
use tracing::info;

use crate::{MarketAnalyzer, ScoutConfig};

/// Every long-lived service wired together from one configuration.
pub struct ScoutRuntime {
    pub config: ScoutConfig,
    pub analyzer: MarketAnalyzer,
    pub solver: Arc<CaptchaSolver>,
    pub training: TrainingService,
    /// Saved market reports; shares the captcha database.
    pub history: Arc<dyn AnalysisHistory>,
}

impl ScoutRuntime {
    pub async fn from_env() -> Result<Self> {
        let config = ScoutConfig::from_env();
        let providers = config.providers_config(|key| std::env::var(key).ok())?;
        Self::from_config(config, providers).await
    }

    pub async fn from_config(config: ScoutConfig, providers: ProvidersConfig) -> Result<Self> {
        config.validate()?;
        let database = Arc::new(if config.database_url.contains(":memory:") {
            SqliteCaptchaRepository::in_memory().await?
        } else {
            SqliteCaptchaRepository::connect(&config.database_url).await?
        });
        let repository: Arc<dyn CaptchaRepository> = database.clone();
        let history: Arc<dyn AnalysisHistory> = database;

        let mut solver = CaptchaSolver::new(Arc::clone(&repository));
        if let Some(dir) = &config.captcha_archive_dir {
            solver = solver.with_archive(ImageArchive::new(dir.clone()));
        }
        let solver = Arc::new(solver);

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            pacing: config.pacing(),
            ..Default::default()
        })
        .context("building http client")?;
        let context = ProviderContext::new(Arc::new(http), Arc::new(MemoryTokenStore::new()))
            .with_solver(Arc::clone(&solver))
            .with_config(providers);

        let analyzer = MarketAnalyzer::new(Arc::new(ProviderFactory::new(context)))
            .with_provider_timeout(config.provider_timeout())
            .with_history(Arc::clone(&history));
        info!(database_url = %config.database_url, "scout runtime ready");
        Ok(Self {
            training: TrainingService::new(repository),
            analyzer,
            solver,
            history,
            config,
        })
    }

    pub fn factory(&self) -> &ProviderFactory {
        self.analyzer.factory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_core::ManualAnnotation;
    use scout_storage::AnalysisRecord;

    fn memory_config() -> ScoutConfig {
        ScoutConfig {
            database_url: "sqlite::memory:".into(),
            ..ScoutConfig::default()
        }
    }

    #[tokio::test]
    async fn wires_builtin_providers_and_captcha_services() {
        let runtime = ScoutRuntime::from_config(memory_config(), ProvidersConfig::default())
            .await
            .unwrap();
        assert_eq!(runtime.factory().known_tags(), vec!["ebay", "leboncoin", "vinted"]);
        assert!(runtime.factory().context().solver.is_some());

        let stats = runtime.training.get_training_stats().await.unwrap();
        assert_eq!(stats.total_attempts, 0);
        let missing_id = ManualAnnotation {
            attempt_id: None,
            gap_position: Some(10),
            annotated_by: Some("ana".into()),
        };
        let err = runtime.training.annotate_manually(missing_id).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn zero_provider_timeout_is_refused() {
        let config = ScoutConfig {
            provider_timeout_secs: 0,
            ..memory_config()
        };
        let err = ScoutRuntime::from_config(config, ProvidersConfig::default())
            .await
            .err()
            .unwrap();
        let err = err.downcast::<scout_core::ScoutError>().unwrap();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn sqlite_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scout.db");
        let config = ScoutConfig {
            database_url: format!("sqlite://{}", path.display()),
            captcha_archive_dir: Some(dir.path().join("archive")),
            ..ScoutConfig::default()
        };
        let runtime = ScoutRuntime::from_config(config, ProvidersConfig::default())
            .await
            .unwrap();
        assert!(path.exists());
        assert!(runtime.solver.repository().list_attempts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn analyses_share_the_captcha_database() {
        let runtime = ScoutRuntime::from_config(memory_config(), ProvidersConfig::default())
            .await
            .unwrap();
        runtime
            .history
            .save_analysis(&AnalysisRecord {
                search_text: "nike air max".into(),
                analyzed_at: chrono::Utc::now(),
                average_price: Some(42.5),
                report: serde_json::json!({ "results": [] }),
            })
            .await
            .unwrap();
        let found = runtime.analyzer.historical_analyses("Nike Air Max", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].average_price, Some(42.5));
    }
}
