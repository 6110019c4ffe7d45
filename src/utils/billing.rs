use serde::{Deserialize, Serialize};

use crate::registry::ModelDescriptor;

/// Token counts reported by an upstream provider, normalized to the
/// OpenAI field names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    /// Some providers omit `total_tokens`; derive it when absent so the
    /// ledger invariant `total = prompt + completion` always holds.
    pub fn normalized(mut self) -> Usage {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// Rough token count for a piece of text, roughly four characters per
/// token. Used when a stream dies before the upstream reports real usage;
/// an estimate in the ledger beats a zero that understates consumption.
pub fn estimate_tokens(text_len: usize) -> i64 {
    (text_len as i64 + 3) / 4
}

/// Cost of one request in micro-units of currency. Prices are expressed per
/// thousand tokens, so integer division only loses sub-micro remainders.
pub fn cost_micro(usage: &Usage, model: &ModelDescriptor) -> i64 {
    usage.prompt_tokens * model.price_per_1k_input_micro / 1000
        + usage.completion_tokens * model.price_per_1k_output_micro / 1000
}
