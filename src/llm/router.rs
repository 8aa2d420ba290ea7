//! Provider Router：按优先级在多个 Provider 间故障转移，每个 Provider 独立熔断
//!
//! - 按 priority 升序尝试；open 状态（冷却未到）的 Provider 直接跳过，不发请求
//! - 单次调用受 per-call 超时约束，超时计为失败
//! - 健康状态按 Provider 各自加锁，锁不跨 await 持有
//! - 所有 Provider 都失败时返回 AllProvidersFailed，列出每个 Provider 的原因

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{Admission, CircuitBreakerConfig, ProviderHealth, ProviderSnapshot};
use super::{
    create_deepseek_client, CircuitState, Completion, CompletionOptions, LlmClient, LlmError,
    MockLlmClient, OpenAiClient, ProviderAttempt,
};
use crate::config::{LlmSection, ProviderEntry, RouterSection};
use crate::memory::Message;

/// Router 配置
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub breaker: CircuitBreakerConfig,
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RouterConfig {
    pub fn from_sections(llm: &LlmSection, router: &RouterSection) -> Self {
        Self {
            breaker: CircuitBreakerConfig {
                failure_threshold: router.failure_threshold.max(1),
                cooldown: Duration::from_secs(router.cooldown_secs),
            },
            request_timeout: Duration::from_secs(llm.request_timeout_secs.max(1)),
        }
    }
}

struct RoutedProvider {
    name: String,
    priority: u32,
    client: Arc<dyn LlmClient>,
    health: Mutex<ProviderHealth>,
}

impl RoutedProvider {
    fn with_health<T>(&self, f: impl FnOnce(&mut ProviderHealth) -> T) -> T {
        let mut guard = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// 多 Provider 路由器
pub struct ProviderRouter {
    providers: Vec<RoutedProvider>,
    config: RouterConfig,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            providers: Vec::new(),
            config,
        }
    }

    /// 注册 Provider；同优先级按注册顺序
    pub fn add_provider(
        &mut self,
        name: impl Into<String>,
        priority: u32,
        client: Arc<dyn LlmClient>,
    ) -> &mut Self {
        self.providers.push(RoutedProvider {
            name: name.into(),
            priority,
            client,
            health: Mutex::new(ProviderHealth::default()),
        });
        self.providers.sort_by_key(|p| p.priority);
        self
    }

    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        priority: u32,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        self.add_provider(name, priority, client);
        self
    }

    /// 由配置构建；未配置任何 Provider 时按环境变量选择 DeepSeek / OpenAI，都没有则用 Mock
    pub fn from_config(llm: &LlmSection, router: &RouterSection) -> Self {
        let mut this = Self::new(RouterConfig::from_sections(llm, router));
        if llm.providers.is_empty() {
            let (name, client): (&str, Arc<dyn LlmClient>) =
                if std::env::var("DEEPSEEK_API_KEY").is_ok() {
                    ("deepseek", Arc::new(create_deepseek_client(None, None, None)))
                } else if std::env::var("OPENAI_API_KEY").is_ok() {
                    let base_url = std::env::var("OPENAI_BASE_URL").ok();
                    let model =
                        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
                    (
                        "openai",
                        Arc::new(OpenAiClient::new(base_url.as_deref(), &model, None)),
                    )
                } else {
                    tracing::warn!("no LLM provider configured and no API key found, using mock client");
                    ("mock", Arc::new(MockLlmClient))
                };
            this.add_provider(name, 0, client);
            return this;
        }
        for entry in &llm.providers {
            this.add_provider(entry.name.clone(), entry.priority, client_for(entry));
        }
        this
    }

    /// 不可取消的便捷版本
    pub async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        self.complete_cancellable(messages, options, &CancellationToken::new())
            .await
    }

    /// 按优先级故障转移；cancel 触发时立即返回 Cancelled
    pub async fn complete_cancellable(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        cancel: &CancellationToken,
    ) -> Result<Completion, LlmError> {
        if self.providers.is_empty() {
            return Err(LlmError::NoProviders);
        }
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let mut attempts = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let admission =
                provider.with_health(|h| h.try_acquire(&self.config.breaker, Instant::now()));
            if admission == Admission::Rejected {
                tracing::debug!(provider = %provider.name, "skipping provider, circuit open");
                attempts.push(ProviderAttempt {
                    provider: provider.name.clone(),
                    error: "circuit open".to_string(),
                    skipped: true,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if admission == Admission::Probe {
                        provider.with_health(ProviderHealth::release_probe);
                    }
                    return Err(LlmError::Cancelled);
                }
                r = tokio::time::timeout(timeout, provider.client.complete(messages, options)) => r,
            };
            let latency = started.elapsed();

            let error = match outcome {
                Ok(Ok(mut completion)) => {
                    provider.with_health(|h| h.on_success(latency));
                    tracing::info!(
                        provider = %provider.name,
                        latency_ms = latency.as_millis() as u64,
                        total_tokens = completion.usage.total_tokens,
                        "llm call succeeded"
                    );
                    completion.provider = Some(provider.name.clone());
                    return Ok(completion);
                }
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout(timeout),
            };

            provider.with_health(|h| h.on_failure(&self.config.breaker, latency, Instant::now()));
            tracing::warn!(provider = %provider.name, error = %error, "llm call failed, trying next provider");
            attempts.push(ProviderAttempt {
                provider: provider.name.clone(),
                error: error.to_string(),
                skipped: false,
            });
        }

        Err(LlmError::AllProvidersFailed(attempts))
    }

    /// 所有 Provider 的健康快照（按优先级）
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.providers
            .iter()
            .map(|p| p.with_health(|h| h.snapshot(&p.name, p.priority)))
            .collect()
    }

    pub fn state_of(&self, name: &str) -> Option<CircuitState> {
        self.providers
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.with_health(|h| h.state()))
    }

    /// 手动重置指定 Provider；不存在时返回 false
    pub fn reset(&self, name: &str) -> bool {
        match self.providers.iter().find(|p| p.name == name) {
            Some(p) => {
                p.with_health(ProviderHealth::reset);
                tracing::info!(provider = %name, "provider circuit reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for p in &self.providers {
            p.with_health(ProviderHealth::reset);
        }
    }
}

fn client_for(entry: &ProviderEntry) -> Arc<dyn LlmClient> {
    let api_key = entry
        .api_key_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());
    match entry.kind.as_str() {
        "mock" => Arc::new(MockLlmClient),
        "deepseek" => Arc::new(create_deepseek_client(
            entry.model.as_deref(),
            entry.base_url.as_deref(),
            entry.api_key_env.as_deref(),
        )),
        other => {
            if other != "openai" {
                tracing::warn!(kind = %other, provider = %entry.name, "unknown provider kind, treating as openai-compatible");
            }
            Arc::new(OpenAiClient::new(
                entry.base_url.as_deref(),
                entry.model.as_deref().unwrap_or("gpt-4o-mini"),
                api_key.as_deref(),
            ))
        }
    }
}

#[async_trait]
impl LlmClient for ProviderRouter {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion, LlmError> {
        ProviderRouter::complete(self, messages, options).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.providers.iter().fold((0, 0, 0), |acc, p| {
            let (a, b, c) = p.client.token_usage();
            (acc.0 + a, acc.1 + b, acc.2 + c)
        })
    }
}
