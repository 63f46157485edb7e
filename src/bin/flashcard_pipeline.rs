// Flashcard pipeline engine entry point. Vocabulary ingress, export
// formatting, and the interactive study UI are separate collaborators;
// this binary only proves out the engine's wiring and configuration.

use flashcard_pipeline_core::{logging, PipelineConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return Err(Box::new(e));
        }
    };

    info!("flashcard pipeline engine starting");
    info!(base_url = %config.api.base_url, "api configuration loaded");
    info!(
        requests_per_minute = config.rate_limit.requests_per_minute,
        burst_size = config.rate_limit.burst_size,
        "rate limiter configuration loaded"
    );
    info!(
        max_concurrent = config.concurrency.max_concurrent,
        batch_size = config.concurrency.batch_size,
        "concurrency configuration loaded"
    );
    info!(
        cache_dir = %config.cache.cache_dir,
        ttl_seconds = config.cache.cache_ttl_seconds,
        "cache configuration loaded"
    );
    info!(
        stage1 = %config.models.stage1,
        stage2 = %config.models.stage2,
        "model configuration loaded"
    );

    info!("this binary wires and validates configuration only; drive the engine through the library API from a vocabulary ingress collaborator");
    Ok(())
}
