use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use sutradhar_types::{ContentPart, CostBreakdown, Finding, Role, Turn};

// NOTE: Store Design Rationale
//
// Why one SQLite file for sessions, patterns, and logs?
// - The consolidator reads turns and writes patterns in the same cycle;
//   keeping them in one file keeps each phase a single transaction
// - The writer is single-threaded per file; readers may be concurrent
//
// Why append-only turns with a (session_id, turn_number) primary key?
// - Turn order within a session is strictly insertion order
// - A duplicate turn number is a caller bug and must fail loudly

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub project: String,
    pub started_ts: String,
    pub ended_ts: Option<String>,
    pub turn_count: u64,
}

#[derive(Debug, Clone)]
pub struct ConsolidationLogRow {
    pub ts: String,
    pub phase: String,
    pub status: String,
    pub detail: Option<String>,
    pub sessions_scanned: u64,
    pub patterns_found: u64,
    pub crystallized: u64,
    pub procedures_mined: u64,
    pub duration_ms: u64,
}

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let db = Self { conn };
        crate::schema::migrate(&db.conn)?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        crate::schema::migrate(&db.conn)?;
        Ok(db)
    }

    // ==========================================
    // Sessions & turns
    // ==========================================

    /// Create the session row if it does not exist yet.
    pub fn ensure_session(&self, session_id: &str, project: &str) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO sessions (id, project, started_ts)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![session_id, project, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn close_session(&self, session_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_ts = ?2 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Next free turn number for a session (0 for a fresh session).
    pub fn next_turn_number(&self, session_id: &str) -> Result<u64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(turn_number) FROM turns WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| (m + 1) as u64).unwrap_or(0))
    }

    /// Append one turn. Fails on a duplicate (session, turn_number) pair.
    ///
    /// Also extracts tool calls into their own table, indexes the turn text
    /// for full-text retrieval, and bumps the session's turn counter, all in
    /// one transaction.
    pub fn append_turn(&mut self, turn: &Turn) -> Result<()> {
        let tx = self.conn.transaction()?;

        let parts_json = serde_json::to_string(&turn.parts)?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO turns
                (session_id, turn_number, role, parts, ts, model,
                 input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_usd)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                turn.session_id,
                turn.turn_number as i64,
                turn.role.as_str(),
                parts_json,
                turn.timestamp.to_rfc3339(),
                turn.model,
                turn.cost.input_tokens as i64,
                turn.cost.output_tokens as i64,
                turn.cost.cache_read_tokens as i64,
                turn.cost.cache_write_tokens as i64,
                turn.cost.cost_usd,
            ],
        )?;
        if inserted == 0 {
            bail!(
                "Turn {} already exists for session {}",
                turn.turn_number,
                turn.session_id
            );
        }

        for call in turn.tool_calls() {
            tx.execute(
                r#"
                INSERT INTO tool_calls (session_id, turn_number, name, arguments, result, is_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    turn.session_id,
                    turn.turn_number as i64,
                    call.name,
                    call.arguments,
                    call.result,
                    call.is_error,
                ],
            )?;
        }

        let text = turn.text();
        if !text.is_empty() {
            tx.execute(
                "INSERT INTO turns_fts (content, session_id, turn_number) VALUES (?1, ?2, ?3)",
                params![text, turn.session_id, turn.turn_number as i64],
            )?;
        }

        tx.execute(
            "UPDATE sessions SET turn_count = turn_count + 1 WHERE id = ?1",
            [&turn.session_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn turns_for_session(&self, session_id: &str) -> Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, turn_number, role, parts, ts, model,
                   input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, cost_usd
            FROM turns
            WHERE session_id = ?1
            ORDER BY turn_number ASC
            "#,
        )?;

        let rows = stmt.query_map([session_id], row_to_turn)?;
        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?);
        }
        Ok(turns)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, project, started_ts, ended_ts, turn_count
                FROM sessions
                WHERE id = ?1
                "#,
                [session_id],
                row_to_session,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recently started sessions, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, project, started_ts, ended_ts, turn_count
            FROM sessions
            ORDER BY started_ts DESC
            LIMIT ?1
            "#,
        )?;

        let sessions = stmt
            .query_map([limit as i64], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Full-text search over turn content. Returns (session_id, turn_number).
    pub fn search_turns(&self, query: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, turn_number
            FROM turns_fts
            WHERE turns_fts MATCH ?1
            LIMIT ?2
            "#,
        )?;

        let hits = stmt
            .query_map(params![query, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hits)
    }

    // ==========================================
    // Findings
    // ==========================================

    pub fn insert_finding(&self, finding: &Finding) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO findings
                (id, guardian_id, domain, severity, title, description, location,
                 suggestion, confidence, auto_fixable, timestamp_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                finding.id,
                finding.guardian_id,
                finding.domain.as_str(),
                finding.severity.as_str(),
                finding.title,
                finding.description,
                finding.location,
                finding.suggestion,
                finding.confidence,
                finding.auto_fixable,
                finding.timestamp_ms,
            ],
        )?;
        Ok(())
    }

    pub fn count_findings(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM findings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ==========================================
    // Consolidation log
    // ==========================================

    pub fn append_consolidation_log(&self, row: &ConsolidationLogRow) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO consolidation_log
                (ts, phase, status, detail, sessions_scanned, patterns_found,
                 crystallized, procedures_mined, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                row.ts,
                row.phase,
                row.status,
                row.detail,
                row.sessions_scanned as i64,
                row.patterns_found as i64,
                row.crystallized as i64,
                row.procedures_mined as i64,
                row.duration_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn recent_consolidation_logs(&self, limit: usize) -> Result<Vec<ConsolidationLogRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ts, phase, status, detail, sessions_scanned, patterns_found,
                   crystallized, procedures_mined, duration_ms
            FROM consolidation_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(ConsolidationLogRow {
                    ts: row.get(0)?,
                    phase: row.get(1)?,
                    status: row.get(2)?,
                    detail: row.get(3)?,
                    sessions_scanned: row.get::<_, i64>(4)? as u64,
                    patterns_found: row.get::<_, i64>(5)? as u64,
                    crystallized: row.get::<_, i64>(6)? as u64,
                    procedures_mined: row.get::<_, i64>(7)? as u64,
                    duration_ms: row.get::<_, i64>(8)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        project: row.get(1)?,
        started_ts: row.get(2)?,
        ended_ts: row.get(3)?,
        turn_count: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let parts_json: String = row.get(3)?;
    let parts: Vec<ContentPart> = serde_json::from_str(&parts_json).unwrap_or_default();
    let ts: String = row.get(4)?;
    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let role: String = row.get(2)?;

    Ok(Turn {
        session_id: row.get(0)?,
        turn_number: row.get::<_, i64>(1)? as u64,
        role: parse_role(&role),
        parts,
        timestamp,
        model: row.get(5)?,
        cost: CostBreakdown {
            input_tokens: row.get::<_, i64>(6)? as u64,
            output_tokens: row.get::<_, i64>(7)? as u64,
            cache_read_tokens: row.get::<_, i64>(8)? as u64,
            cache_write_tokens: row.get::<_, i64>(9)? as u64,
            cost_usd: row.get(10)?,
        },
    })
}

fn parse_role(role: &str) -> Role {
    match role {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "system" => Role::System,
        _ => Role::Tool,
    }
}
