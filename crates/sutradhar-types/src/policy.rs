use crate::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An action proposed by an agent, subject to policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyAction {
    FileRead {
        file_path: String,
    },
    FileWrite {
        file_path: String,
        content: String,
    },
    ShellExec {
        command: String,
    },
    LlmCall {
        model: String,
        estimated_cost: f64,
    },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
}

impl PolicyAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyAction::FileRead { .. } => "file_read",
            PolicyAction::FileWrite { .. } => "file_write",
            PolicyAction::ShellExec { .. } => "shell_exec",
            PolicyAction::LlmCall { .. } => "llm_call",
            PolicyAction::ToolCall { .. } => "tool_call",
        }
    }

    /// The file path this action touches, if any.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            PolicyAction::FileRead { file_path } => Some(file_path),
            PolicyAction::FileWrite { file_path, .. } => Some(file_path),
            _ => None,
        }
    }

    /// Map a raw tool call onto the action it proposes. Unknown tools
    /// stay generic `ToolCall` actions.
    pub fn from_tool_call(name: &str, args: &serde_json::Value) -> PolicyAction {
        let path = args
            .get("file_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match name {
            "read" | "grep" | "glob" => PolicyAction::FileRead { file_path: path },
            "write" | "edit" => PolicyAction::FileWrite {
                file_path: path,
                content: args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "bash" | "exec" | "shell" => PolicyAction::ShellExec {
                command: args
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => PolicyAction::ToolCall {
                tool: name.to_string(),
                args: args.clone(),
            },
        }
    }
}

/// Verdict status, ordered by restrictiveness for final-decision folding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Allow,
    Warn,
    Modify,
    Deny,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Allow => "allow",
            VerdictStatus::Warn => "warn",
            VerdictStatus::Modify => "modify",
            VerdictStatus::Deny => "deny",
        }
    }
}

/// One rule's judgement of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub rule_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_action: Option<PolicyAction>,
}

impl Verdict {
    pub fn allow(rule_id: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Allow,
            rule_id: rule_id.into(),
            reason: String::new(),
            suggestion: None,
            modified_action: None,
        }
    }

    pub fn deny(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Deny,
            rule_id: rule_id.into(),
            reason: reason.into(),
            suggestion: None,
            modified_action: None,
        }
    }

    pub fn warn(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Warn,
            rule_id: rule_id.into(),
            reason: reason.into(),
            suggestion: None,
            modified_action: None,
        }
    }

    pub fn modify(
        rule_id: impl Into<String>,
        reason: impl Into<String>,
        action: PolicyAction,
    ) -> Self {
        Self {
            status: VerdictStatus::Modify,
            rule_id: rule_id.into(),
            reason: reason.into(),
            suggestion: None,
            modified_action: Some(action),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Metadata describing a policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMeta {
    pub id: String,
    pub name: String,
    pub category: String,
    pub severity: Severity,
}

/// Ambient facts rules may consult alongside the action itself.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub session_id: String,
    pub agent_id: String,
    pub project_root: Option<String>,
    /// Files modified so far this session.
    pub files_modified: u64,
    /// Shell commands run so far this session.
    pub commands_run: u64,
    /// Dollar cost accumulated so far this session.
    pub session_cost: f64,
}

/// One policy-checked action, recorded append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub action: PolicyAction,
    pub verdicts: Vec<Verdict>,
    pub final_decision: VerdictStatus,
}

/// Result of running the enforcement pipeline over one action.
#[derive(Debug, Clone)]
pub struct EnforceOutcome {
    pub allowed: bool,
    pub final_decision: VerdictStatus,
    pub verdicts: Vec<Verdict>,
    /// Present when some rule rewrote the action.
    pub modified_action: Option<PolicyAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_strings() {
        let action = PolicyAction::ShellExec {
            command: "ls".to_string(),
        };
        assert_eq!(action.kind(), "shell_exec");
        assert!(action.file_path().is_none());

        let write = PolicyAction::FileWrite {
            file_path: "src/lib.rs".to_string(),
            content: String::new(),
        };
        assert_eq!(write.file_path(), Some("src/lib.rs"));
    }

    #[test]
    fn test_from_tool_call_mapping() {
        let read = PolicyAction::from_tool_call("read", &serde_json::json!({"file_path": "a.rs"}));
        assert_eq!(read.kind(), "file_read");

        let bash = PolicyAction::from_tool_call("bash", &serde_json::json!({"command": "ls"}));
        assert!(matches!(bash, PolicyAction::ShellExec { ref command } if command == "ls"));

        let other = PolicyAction::from_tool_call("browse", &serde_json::json!({"url": "x"}));
        assert_eq!(other.kind(), "tool_call");
    }

    #[test]
    fn test_verdict_constructors() {
        let verdict = Verdict::deny("cmd-denylist", "banned").with_suggestion("use rg");
        assert_eq!(verdict.status, VerdictStatus::Deny);
        assert_eq!(verdict.suggestion.as_deref(), Some("use rg"));
    }

    #[test]
    fn test_audit_entry_serde() {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            action: PolicyAction::FileRead {
                file_path: "/etc/hosts".to_string(),
            },
            verdicts: vec![Verdict::allow("path-allowlist")],
            final_decision: VerdictStatus::Allow,
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"file_read\""));
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.final_decision, VerdictStatus::Allow);
    }
}
