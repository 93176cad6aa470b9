use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::money::Usd;
use crate::types::GenerationStep;

// ---------------------------------------------------------------------------
// FileConfig: tunables from TOML. Secrets stay in the environment.
// ---------------------------------------------------------------------------

/// TOML-backed configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub generation: GenerationConfig,
    pub quality: QualityConfig,
    pub recovery: RecoveryConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchConfig {
    pub default_batch_size: u32,
    /// Delay between consecutive batches of one session, bounding load on the analysis service.
    pub inter_batch_delay_secs: u64,
    /// Cost reserved per item before the analysis call; actual cost is committed after.
    pub estimated_item_cost_usd: f64,
    pub item_timeout_secs: u64,
    /// Items analyzed concurrently inside one batch. 1 keeps strict ordering.
    pub worker_concurrency: usize,
    /// Batches executing concurrently across the analysis queue.
    pub queue_concurrency: usize,
    pub min_content_chars: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 10,
            inter_batch_delay_secs: 30,
            estimated_item_cost_usd: 0.0013,
            item_timeout_secs: 60,
            worker_concurrency: 1,
            queue_concurrency: 4,
            min_content_chars: 500,
        }
    }
}

impl BatchConfig {
    pub fn estimated_item_cost(&self) -> Usd {
        Usd::from_dollars(self.estimated_item_cost_usd)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_secs(self.inter_batch_delay_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

/// Share of overall progress each step contributes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StepWeights {
    pub selection: f64,
    pub synthesis: f64,
    pub writing: f64,
    pub storage: f64,
}

impl Default for StepWeights {
    fn default() -> Self {
        Self {
            selection: 0.25,
            synthesis: 0.30,
            writing: 0.35,
            storage: 0.10,
        }
    }
}

impl StepWeights {
    pub fn weight(&self, step: GenerationStep) -> f64 {
        match step {
            GenerationStep::Selection => self.selection,
            GenerationStep::Synthesis => self.synthesis,
            GenerationStep::Writing => self.writing,
            GenerationStep::Storage => self.storage,
        }
    }

    /// Sum of the weights of every step before `step`.
    pub fn completed_before(&self, step: GenerationStep) -> f64 {
        GenerationStep::ALL
            .iter()
            .take(step.index())
            .map(|s| self.weight(*s))
            .sum()
    }

    pub fn total(&self) -> f64 {
        GenerationStep::ALL.iter().map(|s| self.weight(*s)).sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenerationConfig {
    pub max_selected_items: usize,
    pub queue_concurrency: usize,
    /// Hard limit on a single composer call (synthesis or writing).
    pub stage_timeout_secs: u64,
    /// Terminal progress rows are purged after this many hours.
    pub progress_retention_hours: i64,
    pub weights: StepWeights,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_selected_items: 20,
            queue_concurrency: 2,
            stage_timeout_secs: 300,
            progress_retention_hours: 24 * 7,
            weights: StepWeights::default(),
        }
    }
}

impl GenerationConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn progress_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.progress_retention_hours)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QualityConfig {
    pub min_selected_items: usize,
    pub min_avg_signal_strength: f64,
    pub min_coherence: f64,
    /// Below this coherence the synthesis is unusable.
    pub coherence_floor: f64,
    pub min_citations: u32,
    pub min_words: u32,
    pub max_words: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_selected_items: 3,
            min_avg_signal_strength: 0.4,
            min_coherence: 0.6,
            coherence_floor: 0.2,
            min_citations: 5,
            min_words: 300,
            max_words: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RecoveryConfig {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub base_delay_secs: i64,
    pub stall_timeout_secs: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_retries: 3,
            base_delay_secs: 60,
            stall_timeout_secs: 2 * 60 * 60,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn base_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.base_delay_secs)
    }

    pub fn stall_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_timeout_secs)
    }
}

/// Two-tier alert thresholds. Quality and citation alerts fire when the value
/// drops below a threshold; rate, count and cost alerts fire above one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AlertConfig {
    pub interval_secs: u64,
    pub window_hours: i64,
    pub quality_warning: f64,
    pub quality_critical: f64,
    pub citation_warning: f64,
    pub citation_critical: f64,
    pub failure_rate_warning: f64,
    pub failure_rate_critical: f64,
    pub failed_runs_warning: u32,
    pub failed_runs_critical: u32,
    pub cost_warning_usd: f64,
    pub cost_critical_usd: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            window_hours: 24,
            quality_warning: 0.7,
            quality_critical: 0.5,
            citation_warning: 5.0,
            citation_critical: 3.0,
            failure_rate_warning: 0.10,
            failure_rate_critical: 0.25,
            failed_runs_warning: 1,
            failed_runs_critical: 3,
            cost_warning_usd: 5.0,
            cost_critical_usd: 10.0,
        }
    }
}

impl AlertConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours)
    }
}

impl FileConfig {
    /// Load, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FileConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the pipeline misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.default_batch_size == 0 {
            return Err(ConfigError::invalid("batch.default_batch_size", "must be at least 1"));
        }
        if self.batch.estimated_item_cost_usd <= 0.0 {
            return Err(ConfigError::invalid(
                "batch.estimated_item_cost_usd",
                "must be greater than zero",
            ));
        }
        if self.batch.worker_concurrency == 0 || self.batch.queue_concurrency == 0 {
            return Err(ConfigError::invalid("batch concurrency", "must be at least 1"));
        }
        if self.generation.queue_concurrency == 0 {
            return Err(ConfigError::invalid(
                "generation.queue_concurrency",
                "must be at least 1",
            ));
        }
        let total = self.generation.weights.total();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::invalid(
                "generation.weights",
                format!("must sum to 1.0, got {total}"),
            ));
        }
        if self.quality.min_words > self.quality.max_words {
            return Err(ConfigError::invalid(
                "quality.min_words",
                "must not exceed quality.max_words",
            ));
        }
        if self.quality.coherence_floor > self.quality.min_coherence {
            return Err(ConfigError::invalid(
                "quality.coherence_floor",
                "must not exceed quality.min_coherence",
            ));
        }
        let a = &self.alerts;
        if a.quality_critical > a.quality_warning || a.citation_critical > a.citation_warning {
            return Err(ConfigError::invalid(
                "alerts",
                "critical floors must sit at or below warning floors",
            ));
        }
        if a.failure_rate_critical < a.failure_rate_warning
            || a.failed_runs_critical < a.failed_runs_warning
            || a.cost_critical_usd < a.cost_warning_usd
        {
            return Err(ConfigError::invalid(
                "alerts",
                "critical ceilings must sit at or above warning ceilings",
            ));
        }
        if a.window_hours <= 0 {
            return Err(ConfigError::invalid("alerts.window_hours", "must be positive"));
        }

        // Zero intervals panic inside tokio::time::interval; non-positive
        // durations would stall or purge everything on the first sweep.
        let positive: [(&str, i64); 7] = [
            ("batch.item_timeout_secs", self.batch.item_timeout_secs as i64),
            ("generation.stage_timeout_secs", self.generation.stage_timeout_secs as i64),
            ("generation.progress_retention_hours", self.generation.progress_retention_hours),
            ("recovery.interval_secs", self.recovery.interval_secs as i64),
            ("recovery.base_delay_secs", self.recovery.base_delay_secs),
            ("recovery.stall_timeout_secs", self.recovery.stall_timeout_secs),
            ("alerts.interval_secs", a.interval_secs as i64),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AppConfig: secrets and environment-specific values.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string. Absent means the in-memory store.
    pub database_url: Option<String>,
    pub analysis_service_url: String,
    pub analysis_api_key: String,
    pub slack_webhook_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables (after `.env`, if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let analysis_service_url = required_env("ANALYSIS_SERVICE_URL")?;
        if !analysis_service_url.starts_with("http://") && !analysis_service_url.starts_with("https://")
        {
            return Err(ConfigError::invalid(
                "ANALYSIS_SERVICE_URL",
                "must be an http(s) URL",
            ));
        }

        Ok(Self {
            database_url: optional_env("DATABASE_URL"),
            analysis_service_url,
            analysis_api_key: required_env("ANALYSIS_API_KEY")?,
            slack_webhook_url: optional_env("SLACK_WEBHOOK_URL"),
        })
    }

    /// Log which settings are present without leaking secret values.
    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.chars().count().min(5);
            let head: String = val.chars().take(n).collect();
            format!("{head}...({} chars)", val.chars().count())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) => preview(v),
                None => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  ANALYSIS_SERVICE_URL: {}", self.analysis_service_url);
        tracing::info!("  ANALYSIS_API_KEY: {}", preview(&self.analysis_api_key));
        tracing::info!("  SLACK_WEBHOOK_URL: {}", preview_opt(&self.slack_webhook_url));
    }
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    optional_env(key).ok_or(ConfigError::MissingEnv(key))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
