//! 工具层：注册表、执行器、确认挂起与内置工具

pub mod confirmation;
pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;

use std::path::Path;

pub use confirmation::{
    ConfirmationBroker, ConfirmationDecision, ConfirmationError, ConfirmationRequest,
    ConfirmationResponse, ConfirmationTicket,
};
pub use echo::EchoTool;
pub use executor::{
    ExecutionOutcome, ToolExecutionRecord, ToolExecutor, ToolInvocation, ToolObservation,
};
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{RiskLevel, Tool, ToolContext, ToolOutput, ToolRegistry};
pub use schema::tool_call_schema_json;
pub use shell::RunInTerminalTool;

use crate::config::ToolsSection;

/// 内置工具集：read_file / write_file / list_dir / run_in_terminal / echo，均绑定到 workspace
pub fn default_registry(workspace: &Path, tools: &ToolsSection) -> ToolRegistry {
    let fs = SafeFs::new(workspace);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs.clone()));
    registry.register(ListDirTool::new(fs.clone()));
    registry.register(RunInTerminalTool::new(&tools.shell, fs.root()));
    registry.register(EchoTool);
    registry
}
