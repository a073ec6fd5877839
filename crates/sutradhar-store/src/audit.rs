use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use sutradhar_types::AuditEntry;

/// Append-only JSONL sink for audit entries.
///
/// One serialized `AuditEntry` per line; the file and its parent
/// directories are created on first append.
pub struct JsonlAuditLogger {
    path: PathBuf,
}

impl JsonlAuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location: `{home}/audit/audit.jsonl`.
    pub fn under_home(home: &Path) -> Self {
        Self::new(home.join("audit").join("audit.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit dir: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read every entry back. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sutradhar_types::{PolicyAction, Verdict, VerdictStatus};
    use tempfile::TempDir;

    fn sample_entry(agent_id: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            session_id: "s1".to_string(),
            agent_id: agent_id.to_string(),
            action: PolicyAction::ShellExec {
                command: "cargo test".to_string(),
            },
            verdicts: vec![Verdict::allow("cmd-denylist")],
            final_decision: VerdictStatus::Allow,
        }
    }

    #[test]
    fn test_append_creates_dirs_and_file() {
        let temp = TempDir::new().unwrap();
        let logger = JsonlAuditLogger::under_home(temp.path());

        logger.append(&sample_entry("a1")).unwrap();
        logger.append(&sample_entry("a2")).unwrap();

        assert!(logger.path().exists());
        let entries = logger.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].agent_id, "a1");
        assert_eq!(entries[1].agent_id, "a2");
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let logger = JsonlAuditLogger::under_home(temp.path());
        assert!(logger.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let logger = JsonlAuditLogger::under_home(temp.path());
        logger.append(&sample_entry("a1")).unwrap();

        use std::io::Write as _;
        let mut file = OpenOptions::new()
            .append(true)
            .open(logger.path())
            .unwrap();
        writeln!(file, "not json").unwrap();

        let entries = logger.read_all().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
