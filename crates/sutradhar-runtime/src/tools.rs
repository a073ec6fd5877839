use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use sutradhar_providers::{CancelToken, ToolDefinition};

/// Ambient facts a tool execution receives.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub cancel: CancelToken,
}

/// Result of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A tool: definition advertised to the model plus an opaque executor.
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    fn execute(&self, args: &serde_json::Value, context: &ToolContext) -> ToolOutput;

    /// Read-only tools are available to review agents.
    fn read_only(&self) -> bool {
        false
    }
}

/// Registry of available tools; the orchestrator resolves tool calls here.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools
            .insert(tool.definition().name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition().clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Subset containing only read-only tools (for review agents).
    pub fn read_only_subset(&self) -> ToolRegistry {
        let tools = self
            .tools
            .iter()
            .filter(|(_, tool)| tool.read_only())
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        ToolRegistry { tools }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ==========================================
// Built-in handlers
// ==========================================

fn definition(name: &str, description: &str, schema: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
    }
}

/// Read a file relative to the project root.
pub struct ReadTool {
    def: ToolDefinition,
}

impl ReadTool {
    pub fn new() -> Self {
        Self {
            def: definition(
                "read",
                "Read a file",
                serde_json::json!({
                    "type": "object",
                    "properties": {"file_path": {"type": "string"}},
                    "required": ["file_path"]
                }),
            ),
        }
    }
}

impl Default for ReadTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolHandler for ReadTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn read_only(&self) -> bool {
        true
    }

    fn execute(&self, args: &serde_json::Value, context: &ToolContext) -> ToolOutput {
        let path = match args.get("file_path").and_then(|v| v.as_str()) {
            Some(path) => context.working_dir.join(path),
            None => return ToolOutput::error("missing file_path"),
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => ToolOutput::ok(content),
            Err(err) => ToolOutput::error(format!("read {}: {}", path.display(), err)),
        }
    }
}

/// Write a file relative to the project root.
pub struct WriteTool {
    def: ToolDefinition,
}

impl WriteTool {
    pub fn new() -> Self {
        Self {
            def: definition(
                "write",
                "Write a file",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["file_path", "content"]
                }),
            ),
        }
    }
}

impl Default for WriteTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolHandler for WriteTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn execute(&self, args: &serde_json::Value, context: &ToolContext) -> ToolOutput {
        let path = match args.get("file_path").and_then(|v| v.as_str()) {
            Some(path) => context.working_dir.join(path),
            None => return ToolOutput::error("missing file_path"),
        };
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                return ToolOutput::error(format!("mkdir {}: {}", parent.display(), err));
            }
        }
        match std::fs::write(&path, content) {
            Ok(()) => ToolOutput::ok(format!("wrote {} bytes", content.len())),
            Err(err) => ToolOutput::error(format!("write {}: {}", path.display(), err)),
        }
    }
}

/// Run a shell command in the project root.
pub struct ShellTool {
    def: ToolDefinition,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            def: definition(
                "bash",
                "Run a shell command",
                serde_json::json!({
                    "type": "object",
                    "properties": {"command": {"type": "string"}},
                    "required": ["command"]
                }),
            ),
        }
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolHandler for ShellTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn execute(&self, args: &serde_json::Value, context: &ToolContext) -> ToolOutput {
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(command) => command,
            None => return ToolOutput::error("missing command"),
        };
        if context.cancel.is_cancelled() {
            return ToolOutput::error("cancelled");
        }

        let result = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&context.working_dir)
            .output();

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                if !output.stderr.is_empty() {
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                if output.status.success() {
                    ToolOutput::ok(text)
                } else {
                    ToolOutput::error(format!(
                        "exit {}: {}",
                        output.status.code().unwrap_or(-1),
                        text
                    ))
                }
            }
            Err(err) => ToolOutput::error(format!("spawn: {}", err)),
        }
    }
}

/// The default tool set handed to the orchestrator.
pub fn builtin_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadTool::new()));
    registry.register(Arc::new(WriteTool::new()));
    registry.register(Arc::new(ShellTool::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ToolContext {
        ToolContext {
            working_dir: dir.path().to_path_buf(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        let write = WriteTool::new();
        let out = write.execute(
            &serde_json::json!({"file_path": "notes/a.txt", "content": "hello"}),
            &ctx,
        );
        assert!(!out.is_error);

        let read = ReadTool::new();
        let out = read.execute(&serde_json::json!({"file_path": "notes/a.txt"}), &ctx);
        assert!(!out.is_error);
        assert_eq!(out.content, "hello");
    }

    #[test]
    fn test_read_missing_file_is_error_result() {
        let temp = TempDir::new().unwrap();
        let read = ReadTool::new();
        let out = read.execute(&serde_json::json!({"file_path": "ghost.txt"}), &context(&temp));
        assert!(out.is_error);
    }

    #[test]
    fn test_shell_captures_exit_status() {
        let temp = TempDir::new().unwrap();
        let shell = ShellTool::new();

        let ok = shell.execute(&serde_json::json!({"command": "echo hi"}), &context(&temp));
        assert!(!ok.is_error);
        assert!(ok.content.contains("hi"));

        let fail = shell.execute(&serde_json::json!({"command": "exit 3"}), &context(&temp));
        assert!(fail.is_error);
        assert!(fail.content.contains("exit 3"));
    }

    #[test]
    fn test_registry_read_only_subset() {
        let registry = builtin_tools();
        assert_eq!(registry.len(), 3);

        let read_only = registry.read_only_subset();
        assert_eq!(read_only.len(), 1);
        assert!(read_only.get("read").is_some());
        assert!(read_only.get("bash").is_none());
    }

    #[test]
    fn test_definitions_sorted() {
        let registry = builtin_tools();
        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["bash", "read", "write"]);
    }
}
