use async_trait::async_trait;

use crate::Result;

use super::types::{ChatCompletion, ChatRequest};

/// Port for the chat backend that rewrites listing text.
///
/// Provider quirks (OAuth exchange, payload shape, TLS handling) stay out of
/// the pipeline; the GigaChat adapter implements this in its own crate.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, req: ChatRequest) -> Result<ChatCompletion>;
}
