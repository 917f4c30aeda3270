//! The provider price table.

use atelier_ledger::Provider;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub provider: Provider,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

/// Model id -> rate, with longest-prefix fallback so dated model ids
/// (`gpt-4o-2024-08-06`) price like their family.
#[derive(Debug, Clone)]
pub struct PriceTable {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

impl PriceTable {
    pub fn new(rates: HashMap<String, ModelRate>, default_rate: ModelRate) -> Self {
        Self {
            rates,
            default_rate,
        }
    }

    /// The built-in table. Deployments override via configuration.
    pub fn builtin() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "gpt-4o".to_string(),
            ModelRate {
                provider: Provider::Openai,
                input_per_million: dec!(2.50),
                output_per_million: dec!(10.00),
            },
        );
        rates.insert(
            "gpt-4o-mini".to_string(),
            ModelRate {
                provider: Provider::Openai,
                input_per_million: dec!(0.15),
                output_per_million: dec!(0.60),
            },
        );
        rates.insert(
            "claude-sonnet".to_string(),
            ModelRate {
                provider: Provider::Anthropic,
                input_per_million: dec!(3.00),
                output_per_million: dec!(15.00),
            },
        );
        rates.insert(
            "claude-haiku".to_string(),
            ModelRate {
                provider: Provider::Anthropic,
                input_per_million: dec!(0.80),
                output_per_million: dec!(4.00),
            },
        );
        let default_rate = ModelRate {
            provider: Provider::Openai,
            input_per_million: dec!(5.00),
            output_per_million: dec!(15.00),
        };
        Self::new(rates, default_rate)
    }

    pub fn rate(&self, model: &str) -> ModelRate {
        if let Some(rate) = self.rates.get(model) {
            return *rate;
        }
        self.rates
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, rate)| *rate)
            .unwrap_or(self.default_rate)
    }

    /// Cost for one call.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
        let rate = self.rate(model);
        let million = Decimal::from(1_000_000u64);
        Decimal::from(input_tokens) * rate.input_per_million / million
            + Decimal::from(output_tokens) * rate.output_per_million / million
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_model_rate() {
        let table = PriceTable::builtin();
        // 1000 in + 500 out on gpt-4o: 1000*2.50/1M + 500*10/1M.
        let cost = table.cost("gpt-4o", 1000, 500);
        assert_eq!(cost, dec!(0.0075));
    }

    #[test]
    fn dated_model_prices_like_family() {
        let table = PriceTable::builtin();
        assert_eq!(
            table.rate("claude-sonnet-20250101"),
            table.rate("claude-sonnet")
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let table = PriceTable::builtin();
        // gpt-4o-mini-foo must price as mini, not as gpt-4o.
        assert_eq!(table.rate("gpt-4o-mini-foo"), table.rate("gpt-4o-mini"));
    }

    #[test]
    fn unknown_model_uses_default() {
        let table = PriceTable::builtin();
        let cost = table.cost("mystery-model", 1_000_000, 0);
        assert_eq!(cost, dec!(5.00));
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let table = PriceTable::builtin();
        assert_eq!(table.cost("gpt-4o", 0, 0), Decimal::ZERO);
    }
}
