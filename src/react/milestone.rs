//! 里程碑校验：步骤的期望结果断言 vs 工具输出
//!
//! 同步、确定性、不调用 LLM。支持的断言文本（大小写不敏感）：
//! - `success` / `ok` / 空：工具执行成功
//! - `exit code N`
//! - `output contains X` / `contains X`
//! - `output does not contain X` / `not contains X`
//! - `output matches <regex>` / `matches /regex/`
//! - `file exists [path]`（缺省取调用参数中的 path）
//! - `at least N lines` / `lines >= N`
//! - `json /pointer == value`
//!
//! 其余文本视为自由描述：工具成功即通过。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::tools::{SafeFs, ToolObservation};

/// 解析后的断言
#[derive(Debug, Clone)]
pub enum Milestone {
    Success,
    ExitCode(i32),
    OutputContains(String),
    OutputNotContains(String),
    OutputMatches(Regex),
    FileExists(Option<String>),
    LineCountAtLeast(usize),
    JsonEquals { pointer: String, value: Value },
    FreeForm(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneResult {
    pub passed: bool,
    pub reason: String,
}

impl MilestoneResult {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

fn exit_code_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^exit[ _]?code\s*(?:==|=|is)?\s*(-?\d+)$").ok())
        .as_ref()
}

fn line_count_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:at least\s+(\d+)\s+lines?|lines?\s*>=\s*(\d+))$").ok())
        .as_ref()
}

fn json_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^json\s+(/\S*)\s*==\s*(.+)$").ok())
        .as_ref()
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for q in ['"', '\'', '`'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// 大小写不敏感地剥离前缀，返回原文剩余部分
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

impl Milestone {
    pub fn parse(expect: &str) -> Self {
        let text = expect.trim();
        let lower = text.to_lowercase();
        if matches!(lower.as_str(), "" | "success" | "ok" | "succeeds" | "tool succeeds") {
            return Self::Success;
        }
        if let Some(c) = exit_code_regex().and_then(|re| re.captures(text)) {
            if let Some(code) = c.get(1).and_then(|m| m.as_str().parse().ok()) {
                return Self::ExitCode(code);
            }
        }
        for prefix in ["output does not contain ", "output not contains ", "not contains "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                return Self::OutputNotContains(unquote(rest));
            }
        }
        for prefix in ["output contains ", "contains "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                return Self::OutputContains(unquote(rest));
            }
        }
        for prefix in ["output matches ", "matches "] {
            if let Some(rest) = strip_prefix_ci(text, prefix) {
                let rest = rest.trim();
                let pattern = rest
                    .strip_prefix('/')
                    .and_then(|r| r.strip_suffix('/'))
                    .unwrap_or(rest);
                return match Regex::new(pattern) {
                    Ok(re) => Self::OutputMatches(re),
                    Err(_) => Self::OutputContains(pattern.to_string()),
                };
            }
        }
        if let Some(rest) = strip_prefix_ci(text, "file exists") {
            let path = unquote(rest);
            return Self::FileExists(if path.is_empty() { None } else { Some(path) });
        }
        if let Some(c) = line_count_regex().and_then(|re| re.captures(text)) {
            let n = c
                .get(1)
                .or_else(|| c.get(2))
                .and_then(|m| m.as_str().parse().ok());
            if let Some(n) = n {
                return Self::LineCountAtLeast(n);
            }
        }
        if let Some(c) = json_regex().and_then(|re| re.captures(text)) {
            if let (Some(p), Some(v)) = (c.get(1), c.get(2)) {
                let raw = v.as_str().trim();
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(unquote(raw)));
                return Self::JsonEquals {
                    pointer: p.as_str().to_string(),
                    value,
                };
            }
        }
        Self::FreeForm(text.to_string())
    }
}

/// 里程碑校验器；FileExists 通过 SafeFs 在工作区内检查
#[derive(Debug, Clone, Default)]
pub struct MilestoneValidator {
    fs: Option<SafeFs>,
}

impl MilestoneValidator {
    pub fn new(fs: Option<SafeFs>) -> Self {
        Self { fs }
    }

    pub fn check(&self, expect: &str, obs: &ToolObservation) -> MilestoneResult {
        self.evaluate(&Milestone::parse(expect), obs)
    }

    pub fn evaluate(&self, milestone: &Milestone, obs: &ToolObservation) -> MilestoneResult {
        if let Milestone::ExitCode(expected) = milestone {
            return match obs.exit_code {
                Some(code) if code == *expected => MilestoneResult::pass(format!("exit code {code}")),
                Some(code) => MilestoneResult::fail(format!("expected exit code {expected}, got {code}")),
                None if *expected == 0 && obs.success => MilestoneResult::pass("tool succeeded"),
                None => MilestoneResult::fail(format!(
                    "expected exit code {expected}, but '{}' reported no exit code",
                    obs.tool
                )),
            };
        }
        if !obs.success {
            let error = obs.error.as_deref().unwrap_or("unknown error");
            return MilestoneResult::fail(format!("tool '{}' failed: {error}", obs.tool));
        }

        let output = obs.output.as_str();
        match milestone {
            Milestone::Success | Milestone::FreeForm(_) => MilestoneResult::pass("tool succeeded"),
            Milestone::ExitCode(_) => MilestoneResult::pass("exit code matched"),
            Milestone::OutputContains(needle) => {
                if output.contains(needle.as_str()) {
                    MilestoneResult::pass(format!("output contains '{needle}'"))
                } else {
                    MilestoneResult::fail(format!("output does not contain '{needle}'"))
                }
            }
            Milestone::OutputNotContains(needle) => {
                if output.contains(needle.as_str()) {
                    MilestoneResult::fail(format!("output unexpectedly contains '{needle}'"))
                } else {
                    MilestoneResult::pass(format!("output does not contain '{needle}'"))
                }
            }
            Milestone::OutputMatches(re) => {
                if re.is_match(output) {
                    MilestoneResult::pass(format!("output matches /{}/", re.as_str()))
                } else {
                    MilestoneResult::fail(format!("output does not match /{}/", re.as_str()))
                }
            }
            Milestone::LineCountAtLeast(n) => {
                let lines = output.lines().count();
                if lines >= *n {
                    MilestoneResult::pass(format!("{lines} lines"))
                } else {
                    MilestoneResult::fail(format!("expected at least {n} lines, got {lines}"))
                }
            }
            Milestone::JsonEquals { pointer, value } => match serde_json::from_str::<Value>(output) {
                Ok(doc) => match doc.pointer(pointer) {
                    Some(actual) if actual == value => {
                        MilestoneResult::pass(format!("{pointer} == {value}"))
                    }
                    Some(actual) => {
                        MilestoneResult::fail(format!("{pointer} is {actual}, expected {value}"))
                    }
                    None => MilestoneResult::fail(format!("{pointer} not present in output")),
                },
                Err(e) => MilestoneResult::fail(format!("output is not JSON: {e}")),
            },
            Milestone::FileExists(path) => {
                let path = path
                    .clone()
                    .or_else(|| obs.args.get("path").and_then(Value::as_str).map(String::from));
                let Some(path) = path else {
                    return MilestoneResult::fail("file exists check has no path");
                };
                let Some(fs) = &self.fs else {
                    return MilestoneResult::fail("no workspace configured for file checks");
                };
                if fs.exists(&path) {
                    MilestoneResult::pass(format!("file {path} exists"))
                } else {
                    MilestoneResult::fail(format!("file {path} does not exist"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(success: bool, output: &str, exit_code: Option<i32>) -> ToolObservation {
        ToolObservation {
            tool_call_id: "c".into(),
            tool: "run_in_terminal".into(),
            args: serde_json::json!({"command": "x"}),
            success,
            output: output.into(),
            error: if success { None } else { Some("exit code 1".into()) },
            exit_code,
            error_class: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_parse_forms() {
        assert!(matches!(Milestone::parse("success"), Milestone::Success));
        assert!(matches!(Milestone::parse("Exit code 0"), Milestone::ExitCode(0)));
        assert!(matches!(Milestone::parse("exit_code == 2"), Milestone::ExitCode(2)));
        assert!(matches!(Milestone::parse("output contains \"[app]\""), Milestone::OutputContains(s) if s == "[app]"));
        assert!(matches!(Milestone::parse("not contains error"), Milestone::OutputNotContains(s) if s == "error"));
        assert!(matches!(Milestone::parse("matches /v\\d+/"), Milestone::OutputMatches(_)));
        assert!(matches!(Milestone::parse("file exists"), Milestone::FileExists(None)));
        assert!(matches!(Milestone::parse("file exists out/a.txt"), Milestone::FileExists(Some(p)) if p == "out/a.txt"));
        assert!(matches!(Milestone::parse("at least 3 lines"), Milestone::LineCountAtLeast(3)));
        assert!(matches!(Milestone::parse("json /status == \"ok\""), Milestone::JsonEquals { .. }));
        assert!(matches!(Milestone::parse("the tests pass"), Milestone::FreeForm(_)));
    }

    #[test]
    fn test_exit_code_and_failure() {
        let v = MilestoneValidator::default();
        assert!(v.check("exit code 0", &obs(true, "", Some(0))).passed);
        let r = v.check("exit code 0", &obs(false, "", Some(1)));
        assert!(!r.passed);
        assert!(r.reason.contains("got 1"));
        assert!(v.check("exit code 1", &obs(false, "", Some(1))).passed);
        // 工具失败时，非 exit code 断言一律不通过
        assert!(!v.check("the tests pass", &obs(false, "", Some(1))).passed);
    }

    #[test]
    fn test_output_predicates() {
        let v = MilestoneValidator::default();
        let o = obs(true, "line one\nversion v12\n", Some(0));
        assert!(v.check("contains version", &o).passed);
        assert!(!v.check("contains missing", &o).passed);
        assert!(v.check("not contains error", &o).passed);
        assert!(v.check("matches /v\\d+/", &o).passed);
        assert!(v.check("at least 2 lines", &o).passed);
        assert!(!v.check("lines >= 3", &o).passed);
        let j = obs(true, r#"{"status": "ok", "n": 3}"#, None);
        assert!(v.check("json /status == \"ok\"", &j).passed);
        assert!(v.check("json /n == 3", &j).passed);
        assert!(!v.check("json /n == 4", &j).passed);
    }

    #[test]
    fn test_file_exists_uses_args_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let v = MilestoneValidator::new(Some(SafeFs::new(dir.path())));
        let mut o = obs(true, "Wrote 1 bytes", None);
        o.tool = "write_file".into();
        o.args = serde_json::json!({"path": "a.txt"});
        assert!(v.check("file exists", &o).passed);
        o.args = serde_json::json!({"path": "b.txt"});
        let r = v.check("file exists", &o);
        assert!(!r.passed);
        assert!(r.reason.contains("b.txt"));
    }
}
