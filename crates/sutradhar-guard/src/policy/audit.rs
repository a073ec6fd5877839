use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use sutradhar_types::{AuditEntry, VerdictStatus};

/// Filter for audit queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub action_kind: Option<String>,
    pub decision: Option<VerdictStatus>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp > to {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &entry.agent_id != agent_id {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if &entry.session_id != session_id {
                return false;
            }
        }
        if let Some(kind) = &self.action_kind {
            if entry.action.kind() != kind {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if entry.final_decision != decision {
                return false;
            }
        }
        true
    }
}

/// Per-session audit rollup.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAuditSummary {
    pub session_id: String,
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub warned: usize,
    /// Rules by how often they produced a non-allow verdict, descending.
    pub top_rules: Vec<(String, usize)>,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditReportFormat {
    Json,
    Markdown,
}

/// Apply a filter over an entry slice.
pub fn query<'a>(entries: &'a [AuditEntry], filter: &AuditFilter) -> Vec<&'a AuditEntry> {
    entries.iter().filter(|e| filter.matches(e)).collect()
}

/// Summarize one session's audit trail.
pub fn session_summary(entries: &[AuditEntry], session_id: &str) -> SessionAuditSummary {
    let mut summary = SessionAuditSummary {
        session_id: session_id.to_string(),
        total: 0,
        allowed: 0,
        denied: 0,
        warned: 0,
        top_rules: Vec::new(),
        first_ts: None,
        last_ts: None,
    };

    let mut rule_hits: HashMap<String, usize> = HashMap::new();
    for entry in entries.iter().filter(|e| e.session_id == session_id) {
        summary.total += 1;
        match entry.final_decision {
            VerdictStatus::Allow => summary.allowed += 1,
            VerdictStatus::Deny => summary.denied += 1,
            VerdictStatus::Warn | VerdictStatus::Modify => summary.warned += 1,
        }
        for verdict in &entry.verdicts {
            if verdict.status != VerdictStatus::Allow {
                *rule_hits.entry(verdict.rule_id.clone()).or_default() += 1;
            }
        }
        summary.first_ts = Some(match summary.first_ts {
            Some(first) if first < entry.timestamp => first,
            _ => entry.timestamp,
        });
        summary.last_ts = Some(match summary.last_ts {
            Some(last) if last > entry.timestamp => last,
            _ => entry.timestamp,
        });
    }

    let mut top: Vec<(String, usize)> = rule_hits.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top.truncate(10);
    summary.top_rules = top;
    summary
}

/// Render matched entries as JSON or Markdown.
pub fn report(
    entries: &[AuditEntry],
    filter: &AuditFilter,
    format: AuditReportFormat,
) -> anyhow::Result<String> {
    let matched = query(entries, filter);
    match format {
        AuditReportFormat::Json => Ok(serde_json::to_string_pretty(&matched)?),
        AuditReportFormat::Markdown => {
            let mut out = String::from("# Audit report\n\n");
            out.push_str(&format!("{} entries\n\n", matched.len()));
            out.push_str("| time | session | agent | action | decision |\n");
            out.push_str("|---|---|---|---|---|\n");
            for entry in matched {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} |\n",
                    entry.timestamp.to_rfc3339(),
                    entry.session_id,
                    entry.agent_id,
                    entry.action.kind(),
                    entry.final_decision.as_str(),
                ));
            }
            Ok(out)
        }
    }
}
