//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ROUTER__FAILURE_THRESHOLD=5`）。
//! 每个字段都有默认值，空配置即可运行。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub tools: ToolsSection,
    pub orchestrator: OrchestratorSection,
    pub learning: LearningSection,
}

/// [app] 段：应用名、工作目录、日志级别
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// RUST_LOG 未设置时的默认过滤（如 "info"、"hive=debug"）
    pub log_level: Option<String>,
}

/// [llm] 段：单次请求超时与 Provider 列表（按 priority 升序尝试）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            providers: Vec::new(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// [[llm.providers]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    /// openai / deepseek / mock
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// 0 为主 Provider，数值越大越靠后
    #[serde(default)]
    pub priority: u32,
}

fn default_provider_kind() -> String {
    "openai".to_string()
}

/// [router] 段：熔断阈值与冷却时间
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// 连续失败多少次后熔断（closed -> open）
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// open -> half_open 的冷却时间（秒）
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

/// [tools] 段：工具超时、确认超时、Shell 配置
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 等待用户确认的会话超时（秒），超时视为取消
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            shell: ShellSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

/// [tools.shell] 段：允许的命令名（首词；为空表示不限）与需要用户确认的高风险模式
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_high_risk_patterns")]
    pub high_risk_patterns: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            high_risk_patterns: default_high_risk_patterns(),
        }
    }
}

fn default_high_risk_patterns() -> Vec<String> {
    vec![
        "rm ".into(),
        "mv ".into(),
        "sudo ".into(),
        "chmod ".into(),
        "chown ".into(),
        "git push".into(),
        "git reset".into(),
        "kill ".into(),
        "curl ".into(),
        "> ".into(),
    ]
}

/// [orchestrator] 段：迭代/反思/违规/重规划上限与技能目录
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 同一步骤未通过里程碑时允许的反思次数
    #[serde(default = "default_max_reflections_per_step")]
    pub max_reflections_per_step: u32,
    /// 约束违规次数超过此值时触发重规划
    #[serde(default = "default_max_constraint_violations")]
    pub max_constraint_violations: u32,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    pub skills_dir: Option<PathBuf>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_reflections_per_step: default_max_reflections_per_step(),
            max_constraint_violations: default_max_constraint_violations(),
            max_replans: default_max_replans(),
            skills_dir: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    25
}

fn default_max_reflections_per_step() -> u32 {
    3
}

fn default_max_constraint_violations() -> u32 {
    3
}

fn default_max_replans() -> u32 {
    1
}

/// [learning] 段：错误模式保留时长、去重阈值、检索超时
#[derive(Debug, Clone, Deserialize)]
pub struct LearningSection {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
    /// 关键词回退检索覆盖的最近教训条数
    #[serde(default = "default_recent_lessons_capacity")]
    pub recent_lessons_capacity: usize,
    #[serde(default = "default_max_lessons_returned")]
    pub max_lessons_returned: usize,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            dedup_threshold: default_dedup_threshold(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
            recent_lessons_capacity: default_recent_lessons_capacity(),
            max_lessons_returned: default_max_lessons_returned(),
        }
    }
}

fn default_max_age_days() -> u64 {
    7
}

fn default_dedup_threshold() -> f32 {
    0.85
}

fn default_retrieval_timeout_ms() -> u64 {
    3000
}

fn default_recent_lessons_capacity() -> usize {
    256
}

fn default_max_lessons_returned() -> usize {
    3
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.router.failure_threshold, 3);
        assert_eq!(cfg.learning.max_age_days, 7);
        assert_eq!(cfg.learning.retrieval_timeout_ms, 3000);
        assert!((cfg.learning.dedup_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(cfg.orchestrator.max_reflections_per_step, 3);
        assert!(cfg.llm.providers.is_empty());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[router]
failure_threshold = 5

[orchestrator]
max_iterations = 7

[[llm.providers]]
name = "primary"
kind = "deepseek"
priority = 0

[[llm.providers]]
name = "backup"
model = "gpt-4o-mini"
priority = 1
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.router.failure_threshold, 5);
        assert_eq!(cfg.router.cooldown_secs, 30);
        assert_eq!(cfg.orchestrator.max_iterations, 7);
        assert_eq!(cfg.llm.providers.len(), 2);
        assert_eq!(cfg.llm.providers[1].kind, "openai");
        assert_eq!(cfg.learning.max_lessons_returned, 3);
    }
}
