//! Token-based cost accounting. All monetary math happens in fixed-point
//! nano-USD integers (1 USD = 1_000_000_000 nano-USD) to avoid float drift
//! in aggregates; nano-USD is the smallest unit that represents `$X.XX per
//! 1M tokens` exactly for any two-decimal `X.XX`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_nano_usd_per_token: u64,
    pub output_nano_usd_per_token: u64,
}

impl ModelRate {
    /// `$X per 1M tokens` = `X * 1000` nano-USD per token exactly, since
    /// one token is one-millionth of the quoted batch and
    /// 1 USD = 1_000_000_000 nano-USD.
    pub fn from_per_million(input_usd_per_million: f64, output_usd_per_million: f64) -> Self {
        Self {
            input_nano_usd_per_token: (input_usd_per_million * 1000.0).round() as u64,
            output_nano_usd_per_token: (output_usd_per_million * 1000.0).round() as u64,
        }
    }
}

pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    default: ModelRate,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        // Reference model default: $3.00 / 1M input, $15.00 / 1M output.
        let default = ModelRate::from_per_million(3.00, 15.00);
        rates.insert("anthropic/claude-3-5-sonnet".to_string(), default);
        Self { rates, default }
    }
}

impl PricingTable {
    pub fn set(&mut self, model: impl Into<String>, rate: ModelRate) {
        self.rates.insert(model.into(), rate);
    }

    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.default)
    }

    /// `cost = input_tokens * input_rate + output_tokens * output_rate`,
    /// returned in nano-USD.
    pub fn cost_nano_usd(&self, model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
        let rate = self.rate_for(model);
        input_tokens * rate.input_nano_usd_per_token + output_tokens * rate.output_nano_usd_per_token
    }
}

pub fn nano_usd_to_usd(nano: u64) -> f64 {
    nano as f64 / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_in_tokens() {
        let table = PricingTable::default();
        let cost = table.cost_nano_usd("anthropic/claude-3-5-sonnet", 1_000_000, 0);
        assert_eq!(nano_usd_to_usd(cost), 3.0);
    }

    #[test]
    fn unknown_model_uses_default_rate() {
        let table = PricingTable::default();
        let known = table.cost_nano_usd("anthropic/claude-3-5-sonnet", 100, 100);
        let unknown = table.cost_nano_usd("some/other-model", 100, 100);
        assert_eq!(known, unknown);
    }
}
