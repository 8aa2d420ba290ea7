//! Hive - Rust 任务编排控制循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、错误与恢复、会话监管
//! - **learning**: 错误模式、教训沉淀与限时检索（进程级单例）
//! - **llm**: LLM 客户端抽象、多 Provider 熔断路由（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 任务对话、分词相似度、教训检索后端
//! - **observability**: 日志初始化
//! - **react**: Planner、约束校验、里程碑校验、进度监控与控制循环
//! - **skills**: 技能加载与结构化计划
//! - **tools**: 工具注册表、执行器、确认挂起与内置工具

pub mod config;
pub mod core;
pub mod learning;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod skills;
pub mod tools;

pub use crate::core::{AgentError, Orchestrator, TaskHandle};
pub use crate::react::{LoopEvent, TaskOutcome};
