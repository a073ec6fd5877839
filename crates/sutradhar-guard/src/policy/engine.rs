use chrono::Utc;
use sutradhar_types::{
    AuditEntry, EnforceOutcome, PolicyAction, PolicyContext, RuleMeta, Verdict, VerdictStatus,
};
use tracing::warn;

/// A policy rule: metadata plus a pure evaluation function.
///
/// Rules must not panic the engine; an `Err` from `evaluate` is converted
/// into a synthetic deny verdict naming the rule.
pub trait PolicyRule: Send + Sync {
    fn meta(&self) -> &RuleMeta;

    fn evaluate(&self, action: &PolicyAction, context: &PolicyContext)
        -> anyhow::Result<Verdict>;
}

/// A named, prioritized group of rules. Higher priority runs earlier.
pub struct PolicySet {
    pub id: String,
    pub priority: i32,
    rules: Vec<Box<dyn PolicyRule>>,
}

impl PolicySet {
    pub fn new(id: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            priority,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn PolicyRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn add_rule(&mut self, rule: Box<dyn PolicyRule>) {
        self.rules.push(rule);
    }
}

/// Persistent destination for audit entries (JSONL file in production).
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry);
}

/// Evaluates proposed actions against rule sets and records every
/// enforcement in the audit trail.
pub struct PolicyEngine {
    /// Strict mode: a deny short-circuits enforcement.
    strict: bool,
    sets: Vec<PolicySet>,
    standalone: Vec<Box<dyn PolicyRule>>,
    audit_log: Vec<AuditEntry>,
    sink: Option<Box<dyn AuditSink>>,
}

impl PolicyEngine {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            sets: Vec::new(),
            standalone: Vec::new(),
            audit_log: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn add_set(&mut self, set: PolicySet) {
        self.sets.push(set);
        // Descending priority; insertion order is preserved within equal
        // priorities by the stable sort.
        self.sets.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn add_rule(&mut self, rule: Box<dyn PolicyRule>) {
        self.standalone.push(rule);
    }

    /// Remove a standalone rule by id. Unknown ids are a no-op.
    pub fn remove_rule(&mut self, rule_id: &str) {
        self.standalone.retain(|rule| rule.meta().id != rule_id);
        for set in self.sets.iter_mut() {
            set.rules.retain(|rule| rule.meta().id != rule_id);
        }
    }

    fn ordered_rules(&self) -> impl Iterator<Item = &dyn PolicyRule> {
        self.sets
            .iter()
            .flat_map(|set| set.rules.iter())
            .chain(self.standalone.iter())
            .map(|boxed| boxed.as_ref())
    }

    fn run_rule(
        rule: &dyn PolicyRule,
        action: &PolicyAction,
        context: &PolicyContext,
    ) -> Verdict {
        match rule.evaluate(action, context) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(rule = %rule.meta().id, error = %err, "policy rule failed");
                Verdict::deny(
                    rule.meta().id.clone(),
                    format!("{} threw: {}", rule.meta().name, err),
                )
            }
        }
    }

    /// Run every rule and return all verdicts. Never short-circuits and
    /// never modifies the action.
    pub fn evaluate(&self, action: &PolicyAction, context: &PolicyContext) -> Vec<Verdict> {
        self.ordered_rules()
            .map(|rule| Self::run_rule(rule, action, context))
            .collect()
    }

    /// Enforce an action: rules run in deterministic order, `modify`
    /// verdicts rewrite the action for subsequent rules, and exactly one
    /// audit entry is appended.
    pub fn enforce(&mut self, action: &PolicyAction, context: &PolicyContext) -> EnforceOutcome {
        let mut current = action.clone();
        let mut verdicts: Vec<Verdict> = Vec::new();
        let mut modified: Option<PolicyAction> = None;
        let mut saw_deny = false;
        let mut saw_warn = false;

        for rule in self.ordered_rules() {
            let verdict = Self::run_rule(rule, &current, context);
            match verdict.status {
                VerdictStatus::Deny => {
                    saw_deny = true;
                    verdicts.push(verdict);
                    if self.strict {
                        break;
                    }
                }
                VerdictStatus::Warn => {
                    saw_warn = true;
                    verdicts.push(verdict);
                }
                VerdictStatus::Modify => {
                    if let Some(action) = verdict.modified_action.clone() {
                        current = action.clone();
                        modified = Some(action);
                    }
                    verdicts.push(verdict);
                }
                VerdictStatus::Allow => verdicts.push(verdict),
            }
        }

        let final_decision = if saw_deny {
            VerdictStatus::Deny
        } else if saw_warn {
            VerdictStatus::Warn
        } else {
            VerdictStatus::Allow
        };

        let entry = AuditEntry {
            timestamp: Utc::now(),
            session_id: context.session_id.clone(),
            agent_id: context.agent_id.clone(),
            action: action.clone(),
            verdicts: verdicts.clone(),
            final_decision,
        };
        if let Some(sink) = &self.sink {
            sink.append(&entry);
        }
        self.audit_log.push(entry);

        EnforceOutcome {
            allowed: final_decision != VerdictStatus::Deny,
            final_decision,
            verdicts,
            modified_action: modified,
        }
    }

    /// Minimal adapter for external callers: map a raw tool call to its
    /// action and enforce it, returning whether it may proceed and the
    /// first denial reason when it may not.
    pub fn check(
        &mut self,
        tool_name: &str,
        args: &serde_json::Value,
        context: &PolicyContext,
    ) -> (bool, Option<String>) {
        let action = PolicyAction::from_tool_call(tool_name, args);
        let outcome = self.enforce(&action, context);
        if outcome.allowed {
            return (true, None);
        }
        let reason = outcome
            .verdicts
            .iter()
            .find(|v| v.status == VerdictStatus::Deny)
            .map(|v| v.reason.clone());
        (false, reason)
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit_log
    }

    pub fn query_audit(&self, filter: &crate::AuditFilter) -> Vec<&AuditEntry> {
        crate::policy::audit::query(&self.audit_log, filter)
    }

    pub fn session_summary(&self, session_id: &str) -> crate::SessionAuditSummary {
        crate::policy::audit::session_summary(&self.audit_log, session_id)
    }

    pub fn report(
        &self,
        filter: &crate::AuditFilter,
        format: crate::AuditReportFormat,
    ) -> anyhow::Result<String> {
        crate::policy::audit::report(&self.audit_log, filter, format)
    }
}
