//! Composite rate limiter: stacks an API-wide limiter, a per-stage
//! limiter, and a cost limiter behind one `acquire_for_stage` call. The
//! cost limiter is billed against estimated tokens (the same token-bucket
//! abstraction as the request limiters), not estimated USD directly — see
//! DESIGN.md for the rationale.

use crate::error::PipelineError;
use crate::rate_limiter::token_bucket::{Algorithm, ShardedRateLimiter};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stage1,
    Stage2,
}

pub struct CompositeRateLimiter {
    api: ShardedRateLimiter,
    stage1: ShardedRateLimiter,
    stage2: ShardedRateLimiter,
    cost: ShardedRateLimiter,
}

impl CompositeRateLimiter {
    pub fn new(
        api_rate: u32,
        stage1_rate: u32,
        stage2_rate: u32,
        cost_token_rate: u32,
        period: Duration,
        burst: u32,
    ) -> Self {
        Self {
            api: ShardedRateLimiter::new(api_rate, period, burst, Algorithm::TokenBucket),
            stage1: ShardedRateLimiter::new(stage1_rate, period, burst, Algorithm::TokenBucket),
            stage2: ShardedRateLimiter::new(stage2_rate, period, burst, Algorithm::TokenBucket),
            cost: ShardedRateLimiter::new(cost_token_rate, period, burst, Algorithm::TokenBucket),
        }
    }

    /// Must pass the API limiter, the stage-specific limiter, and the
    /// cost limiter (estimated tokens) to proceed.
    pub fn acquire_for_stage(&self, key: &str, stage: Stage, estimated_tokens: u32) -> Result<(), PipelineError> {
        let api = self.api.acquire(key, 1);
        if !api.allowed {
            return Err(PipelineError::RateLimit {
                message: "api-wide rate limit exceeded".to_string(),
                retry_after_secs: api.retry_after.unwrap_or_default().as_secs().max(1),
            });
        }

        let stage_limiter = match stage {
            Stage::Stage1 => &self.stage1,
            Stage::Stage2 => &self.stage2,
        };
        let stage_outcome = stage_limiter.acquire(key, 1);
        if !stage_outcome.allowed {
            return Err(PipelineError::RateLimit {
                message: format!("{stage:?} rate limit exceeded"),
                retry_after_secs: stage_outcome.retry_after.unwrap_or_default().as_secs().max(1),
            });
        }

        let cost_outcome = self.cost.acquire(key, estimated_tokens.max(1));
        if !cost_outcome.allowed {
            return Err(PipelineError::RateLimit {
                message: "cost (token-budget) limit exceeded".to_string(),
                retry_after_secs: cost_outcome.retry_after.unwrap_or_default().as_secs().max(1),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_when_any_tier_is_exhausted() {
        let limiter = CompositeRateLimiter::new(1000, 1000, 1000, 10, Duration::from_secs(60), 10);
        // Cost limiter has only 10 tokens/min; a 1000-token estimate exhausts it immediately.
        let result = limiter.acquire_for_stage("item-1", Stage::Stage1, 1000);
        assert!(result.is_err());
    }
}
