//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 默认模型: deepseek-chat，可由配置或 DEEPSEEK_MODEL 覆盖

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 客户端
///
/// - api_key 优先取 `api_key_env` 指定的环境变量，其次 `DEEPSEEK_API_KEY`
/// - base_url 未指定时使用官方地址
pub fn create_deepseek_client(
    model: Option<&str>,
    base_url: Option<&str>,
    api_key_env: Option<&str>,
) -> OpenAiClient {
    let api_key = api_key_env
        .and_then(|name| std::env::var(name).ok())
        .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok());

    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiClient::new(
        Some(base_url.unwrap_or(DEEPSEEK_BASE_URL)),
        &model,
        api_key.as_deref(),
    )
}
