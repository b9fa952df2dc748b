use serde::{Deserialize, Serialize};

/// Token accounting reported by the chat API for a single completion.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Normalized request for a single formatting call.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_text: String,
    /// Completion-size cap passed through to the API (`max_tokens`).
    pub max_tokens: u64,
}

/// Formatted text plus what it cost.
#[derive(Clone, Debug)]
pub struct ChatCompletion {
    pub text: String,
    pub usage: TokenUsage,
}
