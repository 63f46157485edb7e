//! Environment-driven configuration, in the teacher's `SidecarConfig`-style
//! layered-sections shape.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub api: ApiSection,
    pub rate_limit: RateLimitSection,
    pub budget: BudgetSection,
    pub concurrency: ConcurrencySection,
    pub cache: CacheSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetryConfigSection,
    pub models: ModelSection,
    pub generation: GenerationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub api_key: String,
    pub base_url: String,
    /// Sent as `HTTP-Referer` on every chat-completions call, per the
    /// header contract in `spec.md` §6.
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    pub monthly_budget_usd: Option<f64>,
    pub daily_token_quota: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySection {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub checkpoint_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    pub cache_dir: String,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfigSection {
    pub max_attempts: u32,
    pub initial_delay_seconds: u64,
    pub max_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub stage1: String,
    pub stage2: String,
}

impl CacheSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl CircuitBreakerSection {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|e| {
            PipelineError::Configuration(format!("invalid value for {name}: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T>(name: &str) -> Result<Option<T>, PipelineError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.is_empty() => Ok(None),
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Configuration(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl PipelineConfig {
    /// Loads configuration from environment variables. A missing `API_KEY`
    /// or an unparsable numeric value is fatal (`PipelineError::Configuration`).
    pub fn from_env() -> Result<Self, PipelineError> {
        let api_key = std::env::var("API_KEY").map_err(|_| {
            PipelineError::Configuration("API_KEY is required".to_string())
        })?;
        if api_key.trim().is_empty() {
            return Err(PipelineError::Configuration("API_KEY must not be empty".to_string()));
        }

        let config = Self {
            api: ApiSection {
                api_key,
                base_url: env_or("API_BASE_URL", "https://openrouter.ai/api/v1"),
                referer: env_or("APP_REFERER", "https://github.com/flashcard-pipeline"),
                title: env_or("APP_TITLE", "Flashcard Pipeline"),
            },
            rate_limit: RateLimitSection {
                requests_per_minute: env_parse("REQUESTS_PER_MINUTE", 600)?,
                requests_per_hour: env_parse("REQUESTS_PER_HOUR", 36_000)?,
                burst_size: env_parse("BURST_SIZE", 20)?,
            },
            budget: BudgetSection {
                monthly_budget_usd: env_parse_opt("MONTHLY_BUDGET_USD")?,
                daily_token_quota: env_parse_opt("DAILY_TOKEN_QUOTA")?,
            },
            concurrency: ConcurrencySection {
                max_concurrent: env_parse("MAX_CONCURRENT", 50)?,
                batch_size: env_parse("BATCH_SIZE", 10)?,
                checkpoint_interval: env_parse("CHECKPOINT_INTERVAL", 100)?,
            },
            cache: CacheSection {
                cache_dir: env_or("CACHE_DIR", "./.cache"),
                cache_ttl_seconds: env_parse("CACHE_TTL_SECONDS", 86_400)?,
                cache_max_entries: env_parse("CACHE_MAX_ENTRIES", 1000)?,
            },
            circuit_breaker: CircuitBreakerSection {
                failure_threshold: env_parse("CIRCUIT_FAILURE_THRESHOLD", 5)?,
                recovery_timeout_seconds: env_parse("CIRCUIT_RECOVERY_TIMEOUT_SECONDS", 60)?,
            },
            retry: RetryConfigSection {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3)?,
                initial_delay_seconds: env_parse("RETRY_INITIAL_DELAY_SECONDS", 1)?,
                max_delay_seconds: env_parse("RETRY_MAX_DELAY_SECONDS", 60)?,
            },
            models: ModelSection {
                stage1: env_or("MODEL_STAGE1", "anthropic/claude-3-5-sonnet"),
                stage2: env_or("MODEL_STAGE2", "anthropic/claude-3-5-sonnet"),
            },
            generation: GenerationSection {
                temperature: env_parse("GENERATION_TEMPERATURE", 0.7)?,
                max_tokens: env_parse("GENERATION_MAX_TOKENS", 2000)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.rate_limit.requests_per_minute == 0 {
            return Err(PipelineError::Configuration(
                "REQUESTS_PER_MINUTE must be positive".to_string(),
            ));
        }
        if self.rate_limit.burst_size == 0 {
            return Err(PipelineError::Configuration(
                "BURST_SIZE must be positive".to_string(),
            ));
        }
        if self.concurrency.max_concurrent == 0 {
            return Err(PipelineError::Configuration(
                "MAX_CONCURRENT must be positive".to_string(),
            ));
        }
        if self.concurrency.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "BATCH_SIZE must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
