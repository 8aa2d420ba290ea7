//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 与绝对路径逃逸）；
//! read_file / write_file / list_dir 基于 SafeFs 提供文件能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 读取上限，超出部分截断
const MAX_READ_BYTES: usize = 256 * 1024;

/// 沙箱文件系统：绑定根目录，校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法规整：拒绝绝对路径与越过根目录的 ..，不要求路径存在
    fn lexical(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut out = PathBuf::new();
        for component in Path::new(path.trim()).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => out.push(part),
                Component::ParentDir => {
                    if !out.pop() {
                        return Err(AgentError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AgentError::PathEscape(path.to_string()));
                }
            }
        }
        Ok(self.root_dir.join(out))
    }

    /// 已存在路径：规整后再 canonicalize，防止符号链接逃逸
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let full = self.lexical(path)?;
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string()))
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        let mut content = std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {e}")))?;
        if content.len() > MAX_READ_BYTES {
            let mut cut = MAX_READ_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n...(truncated)");
        }
        Ok(content)
    }

    /// 写入文件（自动创建父目录），返回写入字节数
    pub fn write_file(&self, path: &str, content: &str) -> Result<usize, AgentError> {
        if path.trim().is_empty() {
            return Err(AgentError::ToolExecutionFailed("Empty path".to_string()));
        }
        let target = self.lexical(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecutionFailed(format!("Create dir failed: {e}")))?;
            let parent = parent
                .canonicalize()
                .map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            if !parent.starts_with(&self.root_dir) {
                return Err(AgentError::PathEscape(path.to_string()));
            }
        }
        std::fs::write(&target, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {e}")))?;
        Ok(content.len())
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {e}")))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{name}{ty}"));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn path_arg(args: &Value, default: &str) -> String {
    args.get("path")
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

fn path_schema(extra: Option<(&str, &str)>) -> Value {
    let mut properties = serde_json::json!({
        "path": { "type": "string", "description": "Path relative to the workspace root" }
    });
    let mut required = vec!["path"];
    if let Some((name, desc)) = extra {
        properties[name] = serde_json::json!({ "type": "string", "description": desc });
        required.push(name);
    }
    serde_json::json!({ "type": "object", "properties": properties, "required": required })
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Args: {\"path\": \"relative/path\"}"
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let path = path_arg(&args, "");
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(&path).map(ToolOutput::text).map_err(|e| e.to_string())
    }
}

/// 写入文件（覆盖）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace. Args: {\"path\": \"relative/path\", \"content\": \"text\"}"
    }

    fn parameters_schema(&self) -> Value {
        path_schema(Some(("content", "Full file content")))
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let path = path_arg(&args, "");
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let written = self.fs.write_file(&path, content).map_err(|e| e.to_string())?;
        Ok(ToolOutput::text(format!("Wrote {written} bytes to {path}")))
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
        let path = path_arg(&args, ".");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(&path).map_err(|e| e.to_string())?;
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
