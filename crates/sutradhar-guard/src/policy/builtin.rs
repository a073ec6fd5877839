use crate::policy::{PolicyConfig, PolicyRule, PolicySet};
use once_cell::sync::Lazy;
use regex::Regex;
use sutradhar_types::{PolicyAction, PolicyContext, RuleMeta, Severity, Verdict};

// Built-in rule implementations. Each is a pure function of the action and
// session context; none of them hold mutable state.

fn meta(id: &str, name: &str, category: &str, severity: Severity) -> RuleMeta {
    RuleMeta {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        severity,
    }
}

/// Confine file access to configured path prefixes.
pub struct PathAllowlistRule {
    meta: RuleMeta,
    allowed: Vec<String>,
}

impl PathAllowlistRule {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            meta: meta("path-allowlist", "Path allowlist", "filesystem", Severity::Critical),
            allowed,
        }
    }
}

impl PolicyRule for PathAllowlistRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        let path = match action.file_path() {
            Some(path) => path,
            None => return Ok(Verdict::allow(&self.meta.id)),
        };
        if self.allowed.is_empty() || self.allowed.iter().any(|prefix| path.starts_with(prefix)) {
            return Ok(Verdict::allow(&self.meta.id));
        }
        Ok(Verdict::deny(
            &self.meta.id,
            format!("{} is outside the allowed paths", path),
        ))
    }
}

/// Refuse file access under denied prefixes.
pub struct PathDenylistRule {
    meta: RuleMeta,
    denied: Vec<String>,
}

impl PathDenylistRule {
    pub fn new(denied: Vec<String>) -> Self {
        Self {
            meta: meta("path-denylist", "Path denylist", "filesystem", Severity::Critical),
            denied,
        }
    }
}

impl PolicyRule for PathDenylistRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let Some(path) = action.file_path() {
            if let Some(hit) = self.denied.iter().find(|prefix| path.starts_with(*prefix)) {
                return Ok(Verdict::deny(
                    &self.meta.id,
                    format!("{} is under denied prefix {}", path, hit),
                ));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Refuse shell commands containing denied fragments.
pub struct CommandDenylistRule {
    meta: RuleMeta,
    denied: Vec<String>,
}

impl CommandDenylistRule {
    pub fn new(denied: Vec<String>) -> Self {
        Self {
            meta: meta("cmd-denylist", "Command denylist", "shell", Severity::Critical),
            denied,
        }
    }
}

impl PolicyRule for CommandDenylistRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::ShellExec { command } = action {
            if let Some(hit) = self.denied.iter().find(|frag| command.contains(*frag)) {
                return Ok(Verdict::deny(
                    &self.meta.id,
                    format!("command matches denied fragment '{}'", hit),
                ));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Deny model calls once the session cost budget is exhausted.
pub struct CostBudgetRule {
    meta: RuleMeta,
    budget: f64,
}

impl CostBudgetRule {
    pub fn new(budget: f64) -> Self {
        Self {
            meta: meta("cost-budget", "Session cost budget", "budget", Severity::Critical),
            budget,
        }
    }
}

impl PolicyRule for CostBudgetRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::LlmCall { estimated_cost, .. } = action {
            if ctx.session_cost + estimated_cost > self.budget {
                return Ok(Verdict::deny(
                    &self.meta.id,
                    format!(
                        "session cost {:.2} + {:.2} exceeds budget {:.2}",
                        ctx.session_cost, estimated_cost, self.budget
                    ),
                ));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Cap the number of files modified per session.
pub struct FileModCapRule {
    meta: RuleMeta,
    max: u64,
}

impl FileModCapRule {
    pub fn new(max: u64) -> Self {
        Self {
            meta: meta("file-mod-cap", "Session file-modification cap", "budget", Severity::Warning),
            max,
        }
    }
}

impl PolicyRule for FileModCapRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if matches!(action, PolicyAction::FileWrite { .. }) && ctx.files_modified >= self.max {
            return Ok(Verdict::deny(
                &self.meta.id,
                format!("{} files already modified this session", ctx.files_modified),
            ));
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Cap the number of shell commands per session.
pub struct CommandCapRule {
    meta: RuleMeta,
    max: u64,
}

impl CommandCapRule {
    pub fn new(max: u64) -> Self {
        Self {
            meta: meta("cmd-cap", "Session command cap", "budget", Severity::Warning),
            max,
        }
    }
}

impl PolicyRule for CommandCapRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if matches!(action, PolicyAction::ShellExec { .. }) && ctx.commands_run >= self.max {
            return Ok(Verdict::deny(
                &self.meta.id,
                format!("{} commands already run this session", ctx.commands_run),
            ));
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

static SNAKE_CASE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+\.[a-z0-9]+$").unwrap());

/// Warn when a new Rust source file strays from snake_case naming.
pub struct FileNamingRule {
    meta: RuleMeta,
}

impl FileNamingRule {
    pub fn new() -> Self {
        Self {
            meta: meta("file-naming", "File naming convention", "convention", Severity::Info),
        }
    }
}

impl Default for FileNamingRule {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRule for FileNamingRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::FileWrite { file_path, .. } = action {
            if file_path.ends_with(".rs") {
                let name = file_path.rsplit('/').next().unwrap_or(file_path);
                if !SNAKE_CASE_FILE.is_match(name) {
                    return Ok(Verdict::warn(
                        &self.meta.id,
                        format!("{} is not snake_case", name),
                    )
                    .with_suggestion("rename to snake_case"));
                }
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Warn on oversized single-file writes.
pub struct FileSizeCapRule {
    meta: RuleMeta,
    max_bytes: usize,
}

impl FileSizeCapRule {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            meta: meta("file-size-cap", "File size cap", "convention", Severity::Warning),
            max_bytes,
        }
    }
}

impl PolicyRule for FileSizeCapRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::FileWrite { content, file_path } = action {
            if content.len() > self.max_bytes {
                return Ok(Verdict::warn(
                    &self.meta.id,
                    format!("{} is {} bytes, cap is {}", file_path, content.len(), self.max_bytes),
                )
                .with_suggestion("split the file"));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Warn when a substantial Rust source write ships without tests.
pub struct TestPresenceRule {
    meta: RuleMeta,
    min_lines: usize,
}

impl TestPresenceRule {
    pub fn new(min_lines: usize) -> Self {
        Self {
            meta: meta("test-presence", "Test presence", "quality", Severity::Warning),
            min_lines,
        }
    }
}

impl PolicyRule for TestPresenceRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::FileWrite { file_path, content } = action {
            if file_path.ends_with(".rs")
                && !file_path.contains("test")
                && content.lines().count() >= self.min_lines
                && !content.contains("#[cfg(test)]")
                && !content.contains("#[test]")
            {
                return Ok(Verdict::warn(
                    &self.meta.id,
                    format!("{} has no tests", file_path),
                )
                .with_suggestion("add a #[cfg(test)] module"));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

static PROHIBITED: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)(api[_-]?key|secret|password)\s*[:=]\s*['"][^'"]{8,}['"]"#).unwrap(),
        Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----").unwrap(),
    ]
});

/// Deny writes that would embed credentials into the tree.
pub struct ProhibitedContentRule {
    meta: RuleMeta,
}

impl ProhibitedContentRule {
    pub fn new() -> Self {
        Self {
            meta: meta("prohibited-content", "Prohibited content", "security", Severity::Critical),
        }
    }
}

impl Default for ProhibitedContentRule {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRule for ProhibitedContentRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        if let PolicyAction::FileWrite { file_path, content } = action {
            if PROHIBITED.iter().any(|pattern| pattern.is_match(content)) {
                return Ok(Verdict::deny(
                    &self.meta.id,
                    format!("{} would contain credential-like content", file_path),
                ));
            }
        }
        Ok(Verdict::allow(&self.meta.id))
    }
}

/// Rewrite unsorted leading `use` blocks in Rust writes.
pub struct ImportOrderingRule {
    meta: RuleMeta,
}

impl ImportOrderingRule {
    pub fn new() -> Self {
        Self {
            meta: meta("import-ordering", "Import ordering", "convention", Severity::Info),
        }
    }
}

impl Default for ImportOrderingRule {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRule for ImportOrderingRule {
    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn evaluate(&self, action: &PolicyAction, _ctx: &PolicyContext) -> anyhow::Result<Verdict> {
        let (file_path, content) = match action {
            PolicyAction::FileWrite { file_path, content } if file_path.ends_with(".rs") => {
                (file_path, content)
            }
            _ => return Ok(Verdict::allow(&self.meta.id)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let use_block: Vec<&str> = lines
            .iter()
            .take_while(|line| line.starts_with("use ") || line.trim().is_empty())
            .filter(|line| line.starts_with("use "))
            .copied()
            .collect();

        if use_block.len() < 2 {
            return Ok(Verdict::allow(&self.meta.id));
        }

        let mut sorted = use_block.clone();
        sorted.sort_unstable();
        if sorted == use_block {
            return Ok(Verdict::allow(&self.meta.id));
        }

        // Rebuild the file with the leading use block sorted in place.
        let mut rebuilt: Vec<String> = Vec::with_capacity(lines.len());
        let mut replacement = sorted.into_iter();
        let mut in_leading = true;
        for line in &lines {
            if in_leading && line.starts_with("use ") {
                rebuilt.push(replacement.next().unwrap_or(line).to_string());
                continue;
            }
            if in_leading && !line.trim().is_empty() {
                in_leading = false;
            }
            rebuilt.push((*line).to_string());
        }

        Ok(Verdict::modify(
            &self.meta.id,
            "leading use block sorted",
            PolicyAction::FileWrite {
                file_path: file_path.clone(),
                content: rebuilt.join("\n"),
            },
        ))
    }
}

/// The default policy set assembled from configuration.
pub fn default_policy_set(config: &PolicyConfig) -> PolicySet {
    let mut set = PolicySet::new("builtin", 100);
    set.add_rule(Box::new(PathDenylistRule::new(config.denied_paths.clone())));
    set.add_rule(Box::new(PathAllowlistRule::new(config.allowed_paths.clone())));
    set.add_rule(Box::new(CommandDenylistRule::new(
        config.denied_commands.clone(),
    )));
    set.add_rule(Box::new(CostBudgetRule::new(config.cost_budget)));
    set.add_rule(Box::new(FileModCapRule::new(config.max_files_per_session)));
    set.add_rule(Box::new(CommandCapRule::new(config.max_commands_per_session)));
    set.add_rule(Box::new(ProhibitedContentRule::new()));
    set.add_rule(Box::new(FileSizeCapRule::new(512 * 1024)));
    set.add_rule(Box::new(FileNamingRule::new()));
    set.add_rule(Box::new(TestPresenceRule::new(200)));
    set.add_rule(Box::new(ImportOrderingRule::new()));
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PolicyContext {
        PolicyContext::default()
    }

    #[test]
    fn test_path_denylist() {
        let rule = PathDenylistRule::new(vec!["/etc".to_string()]);
        let action = PolicyAction::FileRead {
            file_path: "/etc/shadow".to_string(),
        };
        let verdict = rule.evaluate(&action, &ctx()).unwrap();
        assert_eq!(verdict.status, sutradhar_types::VerdictStatus::Deny);

        let ok = PolicyAction::FileRead {
            file_path: "/home/user/a.rs".to_string(),
        };
        assert_eq!(
            rule.evaluate(&ok, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Allow
        );
    }

    #[test]
    fn test_path_allowlist_empty_is_unrestricted() {
        let rule = PathAllowlistRule::new(Vec::new());
        let action = PolicyAction::FileWrite {
            file_path: "/anywhere/x.rs".to_string(),
            content: String::new(),
        };
        assert_eq!(
            rule.evaluate(&action, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Allow
        );

        let confined = PathAllowlistRule::new(vec!["/workspace".to_string()]);
        assert_eq!(
            confined.evaluate(&action, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );
    }

    #[test]
    fn test_command_denylist() {
        let rule = CommandDenylistRule::new(vec!["rm -rf /".to_string()]);
        let action = PolicyAction::ShellExec {
            command: "sudo rm -rf / --no-preserve-root".to_string(),
        };
        assert_eq!(
            rule.evaluate(&action, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );
    }

    #[test]
    fn test_cost_budget() {
        let rule = CostBudgetRule::new(10.0);
        let mut context = ctx();
        context.session_cost = 9.5;
        let action = PolicyAction::LlmCall {
            model: "claude-opus-4-5".to_string(),
            estimated_cost: 1.0,
        };
        assert_eq!(
            rule.evaluate(&action, &context).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );

        context.session_cost = 1.0;
        assert_eq!(
            rule.evaluate(&action, &context).unwrap().status,
            sutradhar_types::VerdictStatus::Allow
        );
    }

    #[test]
    fn test_session_caps() {
        let files = FileModCapRule::new(2);
        let mut context = ctx();
        context.files_modified = 2;
        let write = PolicyAction::FileWrite {
            file_path: "a.rs".to_string(),
            content: String::new(),
        };
        assert_eq!(
            files.evaluate(&write, &context).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );

        let commands = CommandCapRule::new(3);
        context.commands_run = 3;
        let exec = PolicyAction::ShellExec {
            command: "ls".to_string(),
        };
        assert_eq!(
            commands.evaluate(&exec, &context).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );
    }

    #[test]
    fn test_file_naming_warns_on_camel_case() {
        let rule = FileNamingRule::new();
        let action = PolicyAction::FileWrite {
            file_path: "src/MyModule.rs".to_string(),
            content: String::new(),
        };
        let verdict = rule.evaluate(&action, &ctx()).unwrap();
        assert_eq!(verdict.status, sutradhar_types::VerdictStatus::Warn);
        assert!(verdict.suggestion.is_some());
    }

    #[test]
    fn test_prohibited_content_denies_credentials() {
        let rule = ProhibitedContentRule::new();
        let action = PolicyAction::FileWrite {
            file_path: "config.rs".to_string(),
            content: r#"let api_key = "sk_live_abcdef123456";"#.to_string(),
        };
        assert_eq!(
            rule.evaluate(&action, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Deny
        );
    }

    #[test]
    fn test_import_ordering_modifies_unsorted_block() {
        let rule = ImportOrderingRule::new();
        let action = PolicyAction::FileWrite {
            file_path: "src/lib.rs".to_string(),
            content: "use std::fmt;\nuse anyhow::Result;\n\nfn main() {}".to_string(),
        };
        let verdict = rule.evaluate(&action, &ctx()).unwrap();
        assert_eq!(verdict.status, sutradhar_types::VerdictStatus::Modify);
        if let Some(PolicyAction::FileWrite { content, .. }) = verdict.modified_action {
            let first_use = content.lines().next().unwrap();
            assert!(first_use.starts_with("use anyhow"));
            assert!(content.contains("fn main() {}"));
        } else {
            panic!("Expected modified FileWrite");
        }
    }

    #[test]
    fn test_import_ordering_allows_sorted_block() {
        let rule = ImportOrderingRule::new();
        let action = PolicyAction::FileWrite {
            file_path: "src/lib.rs".to_string(),
            content: "use anyhow::Result;\nuse std::fmt;\n\nfn main() {}".to_string(),
        };
        assert_eq!(
            rule.evaluate(&action, &ctx()).unwrap().status,
            sutradhar_types::VerdictStatus::Allow
        );
    }

    #[test]
    fn test_default_policy_set_denies_dangerous_command() {
        let config = PolicyConfig::default();
        let set = default_policy_set(&config);
        let mut engine = crate::PolicyEngine::new(config.enforce);
        engine.add_set(set);

        let outcome = engine.enforce(
            &PolicyAction::ShellExec {
                command: "rm -rf / ".to_string(),
            },
            &ctx(),
        );
        assert!(!outcome.allowed);
    }
}
