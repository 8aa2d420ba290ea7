//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），以及带熔断的 Provider Router

pub mod circuit_breaker;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState, ProviderHealth, ProviderSnapshot};
pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use mock::{MockLlmClient, ScriptedLlmClient, ScriptedReply};
pub use openai::{OpenAiClient, TokenUsage};
pub use router::{ProviderRouter, RouterConfig};
pub use traits::{Completion, CompletionOptions, LlmClient, LlmError, ProviderAttempt, Usage};
