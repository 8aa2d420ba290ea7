//! 教训：绑定到错误模式的自然语言修正，带结构化置信度
//!
//! 置信度 = 基础分 + 各结构信号的有界加分（具体路径/命令、分步骤、代码块、足够长），上限 1.0。
//! 各加分值为可调常量，不是对外契约。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ErrorClass;

pub const BASE_CONFIDENCE: f32 = 0.3;
pub const CONCRETE_REFERENCE_BONUS: f32 = 0.25;
pub const STEP_STRUCTURE_BONUS: f32 = 0.2;
pub const CODE_BLOCK_BONUS: f32 = 0.15;
pub const SUBSTANTIVE_LENGTH_BONUS: f32 = 0.1;
/// 视为「足够具体」的最少字符数
const SUBSTANTIVE_CHARS: usize = 80;

/// 一条已存储的教训
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub pattern_signature: String,
    pub tool: String,
    pub error_class: ErrorClass,
    pub content: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

impl Lesson {
    pub fn new(pattern_signature: &str, tool: &str, error_class: ErrorClass, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern_signature: pattern_signature.to_string(),
            tool: tool.to_string(),
            error_class,
            content: content.trim().to_string(),
            confidence: confidence_score(content),
            created_at: Utc::now(),
        }
    }

    /// 注入 prompt 的单行表示
    pub fn render(&self) -> String {
        format!(
            "- [{} / {} / confidence {:.2}] {}",
            self.tool, self.error_class, self.confidence, self.content
        )
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// 路径（./a、/x/y、src/main.rs）、反引号命令或 `$ cmd`
fn concrete_reference_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &RE,
        r"(?m)(?:^|\s)(?:\.{0,2}/[\w.\-]+|[\w\-]+/[\w.\-/]+\.\w+)|`[^`\n]+`|\$ \S+",
    )
}

/// 以编号或项目符号开头的行
fn step_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?m)^\s*(?:\d+[.)]|[-*])\s+\S")
}

pub fn has_concrete_reference(text: &str) -> bool {
    let without_fences = text.replace("```", "");
    concrete_reference_regex().is_some_and(|re| re.is_match(&without_fences))
}

pub fn has_step_structure(text: &str) -> bool {
    step_line_regex().is_some_and(|re| re.find_iter(text).count() >= 2)
}

pub fn has_code_block(text: &str) -> bool {
    text.matches("```").count() >= 2
}

/// 由结构信号计算置信度，结果落在 [0, 1]
pub fn confidence_score(text: &str) -> f32 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }
    let mut score = BASE_CONFIDENCE;
    if has_concrete_reference(text) {
        score += CONCRETE_REFERENCE_BONUS;
    }
    if has_step_structure(text) {
        score += STEP_STRUCTURE_BONUS;
    }
    if has_code_block(text) {
        score += CODE_BLOCK_BONUS;
    }
    if text.chars().count() >= SUBSTANTIVE_CHARS {
        score += SUBSTANTIVE_LENGTH_BONUS;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_gets_base_score() {
        assert!((confidence_score("try again later") - BASE_CONFIDENCE).abs() < 1e-6);
        assert_eq!(confidence_score("   "), 0.0);
    }

    #[test]
    fn test_concrete_path_adds_bonus() {
        let score = confidence_score("create ./config/app.toml before reading it");
        assert!((score - (BASE_CONFIDENCE + CONCRETE_REFERENCE_BONUS)).abs() < 1e-6);
        assert!(has_concrete_reference("run `cargo check` first"));
        assert!(has_concrete_reference("$ ls -la"));
    }

    #[test]
    fn test_all_signals_capped_at_one() {
        let text = "Fix the missing config:\n1. run `mkdir -p ./config`\n2. write the defaults\n```\necho '[app]' > ./config/default.toml\n```\nthen rerun the command.";
        let score = confidence_score(text);
        assert!(has_step_structure(text));
        assert!(has_code_block(text));
        assert!(score <= 1.0);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_bullet_is_not_step_structure() {
        assert!(!has_step_structure("- just one hint"));
    }
}
