use crate::Database;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use sutradhar_types::{ParamSpec, PatternType, Samskara, Valence, Vasana, Vidhi, VidhiStep};

// NOTE: Pattern rows are keyed by deterministic FNV-1a hashes, so replaying
// the same sessions upserts instead of duplicating. Observation counts are
// recomputed by the consolidator from the replay window and merged with MAX,
// which keeps REPLAY+RECOMBINE idempotent on identical input.

impl Database {
    // ==========================================
    // Samskaras
    // ==========================================

    pub fn upsert_samskara(&self, samskara: &Samskara) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO samskaras
                (id, session_id, pattern_type, content, observation_count, confidence, project)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                session_id = ?2,
                observation_count = MAX(observation_count, ?5),
                confidence = ?6
            "#,
            params![
                samskara.id,
                samskara.session_id,
                samskara.pattern_type.as_str(),
                samskara.content,
                samskara.observation_count as i64,
                samskara.confidence,
                samskara.project,
            ],
        )?;
        Ok(())
    }

    pub fn list_samskaras(&self, project: &str) -> Result<Vec<Samskara>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, session_id, pattern_type, content, observation_count, confidence, project
            FROM samskaras
            WHERE project = ?1
            ORDER BY observation_count DESC, id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([project], |row| {
                let pattern_type: String = row.get(2)?;
                Ok(Samskara {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    pattern_type: parse_pattern_type(&pattern_type),
                    content: row.get(3)?,
                    observation_count: row.get::<_, i64>(4)? as u64,
                    confidence: row.get(5)?,
                    project: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==========================================
    // Vasanas
    // ==========================================

    pub fn upsert_vasana(&self, vasana: &Vasana) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO vasanas
                (id, tendency, description, strength, stability, valence,
                 source_samskaras, reinforcement_count, last_activated_ms,
                 predictive_accuracy, project)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                strength = ?4,
                stability = ?5,
                valence = ?6,
                source_samskaras = ?7,
                reinforcement_count = ?8,
                last_activated_ms = ?9,
                predictive_accuracy = ?10
            "#,
            params![
                vasana.id,
                vasana.tendency,
                vasana.description,
                vasana.strength,
                vasana.stability,
                valence_str(vasana.valence),
                serde_json::to_string(&vasana.source_samskaras)?,
                vasana.reinforcement_count as i64,
                vasana.last_activated_ms,
                vasana.predictive_accuracy,
                vasana.project,
            ],
        )?;
        Ok(())
    }

    pub fn get_vasana(&self, id: &str) -> Result<Option<Vasana>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, tendency, description, strength, stability, valence,
                       source_samskaras, reinforcement_count, last_activated_ms,
                       predictive_accuracy, project
                FROM vasanas
                WHERE id = ?1
                "#,
                [id],
                row_to_vasana,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_vasanas(&self, project: &str) -> Result<Vec<Vasana>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tendency, description, strength, stability, valence,
                   source_samskaras, reinforcement_count, last_activated_ms,
                   predictive_accuracy, project
            FROM vasanas
            WHERE project = ?1
            ORDER BY strength DESC, id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([project], row_to_vasana)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_all_vasanas(&self) -> Result<Vec<Vasana>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, tendency, description, strength, stability, valence,
                   source_samskaras, reinforcement_count, last_activated_ms,
                   predictive_accuracy, project
            FROM vasanas
            ORDER BY project ASC, strength DESC
            "#,
        )?;

        let rows = stmt
            .query_map([], row_to_vasana)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete tendencies whose strength fell below the floor. Returns the
    /// number of rows removed.
    pub fn delete_weak_vasanas(&self, floor: f64) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM vasanas WHERE strength < ?1", [floor])?;
        Ok(deleted)
    }

    // ==========================================
    // Vidhis
    // ==========================================

    /// Insert a procedure unless its id is already present. Returns whether
    /// a row was written.
    pub fn insert_vidhi_if_absent(&self, vidhi: &Vidhi) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO vidhis
                (id, project, name, learned_from, confidence, steps, triggers,
                 success_rate, parameter_schema)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                vidhi.id,
                vidhi.project,
                vidhi.name,
                serde_json::to_string(&vidhi.learned_from)?,
                vidhi.confidence,
                serde_json::to_string(&vidhi.steps)?,
                serde_json::to_string(&vidhi.triggers)?,
                vidhi.success_rate,
                serde_json::to_string(&vidhi.parameter_schema)?,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_vidhis(&self, project: &str) -> Result<Vec<Vidhi>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, project, name, learned_from, confidence, steps, triggers,
                   success_rate, parameter_schema
            FROM vidhis
            WHERE project = ?1
            ORDER BY confidence DESC, name ASC
            "#,
        )?;

        let rows = stmt
            .query_map([project], |row| {
                let learned_from: String = row.get(3)?;
                let steps: String = row.get(5)?;
                let triggers: String = row.get(6)?;
                let schema: String = row.get(8)?;
                Ok(Vidhi {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    name: row.get(2)?,
                    learned_from: serde_json::from_str::<Vec<String>>(&learned_from)
                        .unwrap_or_default(),
                    confidence: row.get(4)?,
                    steps: serde_json::from_str::<Vec<VidhiStep>>(&steps).unwrap_or_default(),
                    triggers: serde_json::from_str::<Vec<String>>(&triggers).unwrap_or_default(),
                    success_rate: row.get(7)?,
                    parameter_schema: serde_json::from_str::<Vec<ParamSpec>>(&schema)
                        .unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn valence_str(valence: Valence) -> &'static str {
    match valence {
        Valence::Positive => "positive",
        Valence::Negative => "negative",
        Valence::Neutral => "neutral",
    }
}

fn parse_valence(valence: &str) -> Valence {
    match valence {
        "positive" => Valence::Positive,
        "negative" => Valence::Negative,
        _ => Valence::Neutral,
    }
}

fn parse_pattern_type(pattern_type: &str) -> PatternType {
    match pattern_type {
        "tool-sequence" => PatternType::ToolSequence,
        "preference" => PatternType::Preference,
        "decision" => PatternType::Decision,
        "correction" => PatternType::Correction,
        _ => PatternType::Convention,
    }
}

fn row_to_vasana(row: &rusqlite::Row<'_>) -> rusqlite::Result<Vasana> {
    let valence: String = row.get(5)?;
    let sources: String = row.get(6)?;
    Ok(Vasana {
        id: row.get(0)?,
        tendency: row.get(1)?,
        description: row.get(2)?,
        strength: row.get(3)?,
        stability: row.get(4)?,
        valence: parse_valence(&valence),
        source_samskaras: serde_json::from_str::<Vec<String>>(&sources).unwrap_or_default(),
        reinforcement_count: row.get::<_, i64>(7)? as u64,
        last_activated_ms: row.get(8)?,
        predictive_accuracy: row.get(9)?,
        project: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutradhar_core::fnv1a_hex;

    fn sample_samskara(content: &str, count: u64) -> Samskara {
        Samskara {
            id: fnv1a_hex(&format!("tool-sequence:{}", content)),
            session_id: "s1".to_string(),
            pattern_type: PatternType::ToolSequence,
            content: content.to_string(),
            observation_count: count,
            confidence: 0.6,
            project: "demo".to_string(),
        }
    }

    fn sample_vasana(strength: f64) -> Vasana {
        Vasana {
            id: fnv1a_hex("read-then-edit"),
            tendency: "read-then-edit".to_string(),
            description: "reads before editing".to_string(),
            strength,
            stability: 0.7,
            valence: Valence::Positive,
            source_samskaras: vec!["abc".to_string()],
            reinforcement_count: 1,
            last_activated_ms: 1_700_000_000_000,
            predictive_accuracy: 0.0,
            project: "demo".to_string(),
        }
    }

    #[test]
    fn test_samskara_upsert_does_not_double_count() {
        let db = Database::open_in_memory().unwrap();
        let samskara = sample_samskara("read,edit,bash", 5);

        db.upsert_samskara(&samskara).unwrap();
        db.upsert_samskara(&samskara).unwrap();

        let rows = db.list_samskaras("demo").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].observation_count, 5);
    }

    #[test]
    fn test_samskara_upsert_takes_higher_count() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_samskara(&sample_samskara("read,edit", 2)).unwrap();
        db.upsert_samskara(&sample_samskara("read,edit", 7)).unwrap();
        db.upsert_samskara(&sample_samskara("read,edit", 3)).unwrap();

        let rows = db.list_samskaras("demo").unwrap();
        assert_eq!(rows[0].observation_count, 7);
    }

    #[test]
    fn test_vasana_round_trip_and_decay_delete() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_vasana(&sample_vasana(0.5)).unwrap();

        let loaded = db.get_vasana(&fnv1a_hex("read-then-edit")).unwrap().unwrap();
        assert_eq!(loaded.tendency, "read-then-edit");
        assert_eq!(loaded.valence, Valence::Positive);
        assert_eq!(loaded.source_samskaras, vec!["abc".to_string()]);

        db.upsert_vasana(&sample_vasana(0.005)).unwrap();
        let deleted = db.delete_weak_vasanas(0.01).unwrap();
        assert_eq!(deleted, 1);
        assert!(db.get_vasana(&fnv1a_hex("read-then-edit")).unwrap().is_none());
    }

    #[test]
    fn test_vidhi_insert_if_absent() {
        let db = Database::open_in_memory().unwrap();
        let vidhi = Vidhi {
            id: fnv1a_hex("read-then-edit-then-bash:demo"),
            project: "demo".to_string(),
            name: "read-then-edit-then-bash".to_string(),
            learned_from: vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
            confidence: 0.75,
            steps: vec![VidhiStep {
                index: 0,
                tool_name: "read".to_string(),
                arg_template: r#"{"file_path":"${step0_param_file_path}"}"#.to_string(),
                description: "read a file".to_string(),
            }],
            triggers: vec!["modify file".to_string()],
            success_rate: 0.9,
            parameter_schema: vec![],
        };

        assert!(db.insert_vidhi_if_absent(&vidhi).unwrap());
        assert!(!db.insert_vidhi_if_absent(&vidhi).unwrap());

        let vidhis = db.list_vidhis("demo").unwrap();
        assert_eq!(vidhis.len(), 1);
        assert_eq!(vidhis[0].steps.len(), 1);
    }
}
