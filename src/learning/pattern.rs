//! 错误模式：由 (工具名, 错误分类, 上下文) 派生签名
//!
//! 上下文经过归一化（小写、数字替换为 #、压缩空白、截断），
//! 使「同一错误、不同行号/PID」落到同一签名上。

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 签名中保留的上下文最大字符数
const CONTEXT_SIGNATURE_CHARS: usize = 80;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    PermissionDenied,
    Timeout,
    InvalidArguments,
    Syntax,
    Network,
    Cancelled,
    UnknownTool,
    /// 工具成功返回但未满足里程碑
    MilestoneFailed,
    Unknown,
}

impl ErrorClass {
    /// 依据错误文本中的关键词分类
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

        if has(&["unknown tool"]) {
            Self::UnknownTool
        } else if has(&["timed out", "timeout"]) {
            Self::Timeout
        } else if has(&["cancelled", "canceled"]) {
            Self::Cancelled
        } else if has(&["not found", "no such file", "does not exist"]) {
            Self::NotFound
        } else if has(&["permission denied", "access denied", "forbidden", "path escape"]) {
            Self::PermissionDenied
        } else if has(&["syntax", "parse error", "unexpected token"]) {
            Self::Syntax
        } else if has(&["connection", "network", "dns", "unreachable"]) {
            Self::Network
        } else if has(&["invalid", "missing", "required", "expected"]) {
            Self::InvalidArguments
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Timeout => "timeout",
            Self::InvalidArguments => "invalid_arguments",
            Self::Syntax => "syntax",
            Self::Network => "network",
            Self::Cancelled => "cancelled",
            Self::UnknownTool => "unknown_tool",
            Self::MilestoneFailed => "milestone_failed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 归一化上下文：小写、数字替换为 #、压缩空白、截断
pub fn normalize_context(context: &str) -> String {
    let replaced: String = context
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    replaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(CONTEXT_SIGNATURE_CHARS)
        .collect()
}

/// 计算错误签名
pub fn signature_of(tool: &str, class: ErrorClass, context: &str) -> String {
    format!("{}:{}:{}", tool, class, normalize_context(context))
}

/// 一条错误模式；寿命从 created_at 起算，再次记录只刷新次数与 last_seen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub tool: String,
    pub error_class: ErrorClass,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u32,
    pub max_age_secs: u64,
}

impl ErrorPattern {
    pub fn new(
        tool: &str,
        error_class: ErrorClass,
        context: &str,
        max_age_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            signature: signature_of(tool, error_class, context),
            tool: tool.to_string(),
            error_class,
            context: context.trim().to_string(),
            created_at: now,
            last_seen: now,
            occurrences: 1,
            max_age_secs,
        }
    }

    pub fn refresh(&mut self, context: &str, now: DateTime<Utc>) {
        self.occurrences = self.occurrences.saturating_add(1);
        self.last_seen = now;
        self.context = context.trim().to_string();
    }

    /// 创建时间超过 max_age 即过期，期间是否再次出现不影响
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let max_age = Duration::seconds(i64::try_from(self.max_age_secs).unwrap_or(i64::MAX));
        now.signed_duration_since(self.created_at) > max_age
    }

    /// 检索查询文本：签名 + 原始上下文
    pub fn query_text(&self) -> String {
        format!("{} {} {}", self.tool, self.error_class, self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ErrorClass::classify("Path not found: a.txt"), ErrorClass::NotFound);
        assert_eq!(ErrorClass::classify("Command timed out after 30s"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::classify("Permission denied (os error 13)"), ErrorClass::PermissionDenied);
        assert_eq!(ErrorClass::classify("Unknown tool: foo"), ErrorClass::UnknownTool);
        assert_eq!(ErrorClass::classify("missing field `path`"), ErrorClass::InvalidArguments);
        assert_eq!(ErrorClass::classify("segfault"), ErrorClass::Unknown);
    }

    #[test]
    fn test_signature_ignores_numbers_and_spacing() {
        let a = signature_of("run_in_terminal", ErrorClass::Syntax, "error at line 12:  unexpected");
        let b = signature_of("run_in_terminal", ErrorClass::Syntax, "Error at line 97: unexpected");
        assert_eq!(a, b);
        assert!(a.starts_with("run_in_terminal:syntax:"));
    }

    #[test]
    fn test_expiry_counts_from_creation() {
        let now = Utc::now();
        let mut p = ErrorPattern::new("read_file", ErrorClass::NotFound, "x", 60, now - Duration::seconds(120));
        assert!(p.is_expired(now));
        p.refresh("x", now);
        assert!(p.is_expired(now));
        assert_eq!(p.occurrences, 2);
        assert_eq!(p.last_seen, now);

        let young = ErrorPattern::new("read_file", ErrorClass::NotFound, "x", 60, now - Duration::seconds(30));
        assert!(!young.is_expired(now));
    }
}
