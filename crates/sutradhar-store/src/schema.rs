use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

// NOTE: Schema Versioning Design
//
// Why per-logical-name version rows (not one global version)?
// - Sessions, patterns, and logs evolve independently
// - A pattern-store migration must not force a session-store rewrite
// - Each row advances monotonically; there is no down-migration
//
// Why idempotent CREATE ... IF NOT EXISTS steps?
// - A crashed migration can be re-run safely on next open
// - The version row is only bumped after the step commits

struct Migration {
    name: &'static str,
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "sessions",
        version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                started_ts TEXT NOT NULL,
                ended_ts TEXT,
                turn_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS turns (
                session_id TEXT NOT NULL,
                turn_number INTEGER NOT NULL,
                role TEXT NOT NULL,
                parts TEXT NOT NULL,
                ts TEXT NOT NULL,
                model TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, turn_number),
                FOREIGN KEY (session_id) REFERENCES sessions(id)
            );

            CREATE TABLE IF NOT EXISTS tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                turn_number INTEGER NOT NULL,
                name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                result TEXT,
                is_error INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS findings (
                id TEXT PRIMARY KEY,
                guardian_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                location TEXT NOT NULL,
                suggestion TEXT,
                confidence REAL NOT NULL,
                auto_fixable INTEGER NOT NULL DEFAULT 0,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS turns_fts USING fts5(
                content,
                session_id UNINDEXED,
                turn_number UNINDEXED
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_ts DESC);
            CREATE INDEX IF NOT EXISTS idx_tool_calls_session ON tool_calls(session_id, turn_number);
            CREATE INDEX IF NOT EXISTS idx_findings_ts ON findings(timestamp_ms DESC);
            "#,
    },
    Migration {
        name: "patterns",
        version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS samskaras (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                content TEXT NOT NULL,
                observation_count INTEGER NOT NULL DEFAULT 1,
                confidence REAL NOT NULL,
                project TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vasanas (
                id TEXT PRIMARY KEY,
                tendency TEXT NOT NULL,
                description TEXT NOT NULL,
                strength REAL NOT NULL,
                stability REAL NOT NULL,
                valence TEXT NOT NULL,
                source_samskaras TEXT NOT NULL,
                reinforcement_count INTEGER NOT NULL DEFAULT 0,
                last_activated_ms INTEGER NOT NULL,
                predictive_accuracy REAL NOT NULL DEFAULT 0,
                project TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vidhis (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                learned_from TEXT NOT NULL,
                confidence REAL NOT NULL,
                steps TEXT NOT NULL,
                triggers TEXT NOT NULL,
                success_rate REAL NOT NULL,
                parameter_schema TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_samskaras_project ON samskaras(project);
            CREATE INDEX IF NOT EXISTS idx_vasanas_project ON vasanas(project);
            CREATE INDEX IF NOT EXISTS idx_vidhis_project ON vidhis(project);
            "#,
    },
    Migration {
        name: "logs",
        version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS consolidation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                phase TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                sessions_scanned INTEGER NOT NULL DEFAULT 0,
                patterns_found INTEGER NOT NULL DEFAULT 0,
                crystallized INTEGER NOT NULL DEFAULT 0,
                procedures_mined INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0
            );
            "#,
    },
];

/// Apply all pending forward migrations. Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _schema_versions (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );
        "#,
    )?;

    for migration in MIGRATIONS {
        let current = schema_version(conn, migration.name)?.unwrap_or(0);
        if current >= migration.version {
            continue;
        }
        conn.execute_batch(migration.sql)?;
        conn.execute(
            r#"
            INSERT INTO _schema_versions (name, version)
            VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET version = ?2
            "#,
            params![migration.name, migration.version],
        )?;
    }

    Ok(())
}

/// Current version for a logical schema, `None` before first migration.
pub fn schema_version(conn: &Connection, name: &str) -> Result<Option<i64>> {
    let version = conn
        .query_row(
            "SELECT version FROM _schema_versions WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_records_versions() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        assert_eq!(schema_version(&conn, "sessions").unwrap(), Some(1));
        assert_eq!(schema_version(&conn, "patterns").unwrap(), Some(1));
        assert_eq!(schema_version(&conn, "logs").unwrap(), Some(1));
        assert_eq!(schema_version(&conn, "unknown").unwrap(), None);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn, "sessions").unwrap(), Some(1));
    }
}
