use serde::{Deserialize, Serialize};

/// Token usage for a completion, as reported by the provider's `usage`
/// object or, failing that, estimated by `TokenEstimator`. `Engine::Stats`
/// is the §3 `UsageSnapshot` this feeds — see `sa_engine::stats::Stats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
