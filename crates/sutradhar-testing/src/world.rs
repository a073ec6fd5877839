use anyhow::Result;
use std::path::{Path, PathBuf};
use sutradhar_store::Database;
use sutradhar_types::{ContentPart, Role, Turn};
use tempfile::TempDir;

/// An isolated on-disk world: a workspace directory, a project directory,
/// and a session store, all destroyed on drop.
pub struct TestWorld {
    _temp: TempDir,
    workspace: PathBuf,
    project: PathBuf,
}

impl TestWorld {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let workspace = temp.path().join("workspace");
        let project = temp.path().join("project");
        std::fs::create_dir_all(&workspace)?;
        std::fs::create_dir_all(&project)?;
        Ok(Self {
            _temp: temp,
            workspace,
            project,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn project(&self) -> &Path {
        &self.project
    }

    pub fn open_store(&self) -> Result<Database> {
        Database::open(&self.workspace.join("agent.db"))
    }

    /// Write a file into the project directory.
    pub fn project_file(&self, relative: &str, content: &str) -> Result<PathBuf> {
        let path = self.project.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Seed a session whose single assistant turn runs the given tool
    /// sequence successfully. Useful for consolidation tests.
    pub fn seed_tool_sequence_session(
        &self,
        session_id: &str,
        project: &str,
        tools: &[(&str, serde_json::Value)],
    ) -> Result<()> {
        let mut db = self.open_store()?;
        db.ensure_session(session_id, project)?;

        let mut turn = Turn::new(session_id, db.next_turn_number(session_id)?, Role::Assistant);
        for (index, (name, args)) in tools.iter().enumerate() {
            let id = format!("t{}", index);
            turn.parts.push(ContentPart::ToolUse {
                id: id.clone(),
                name: (*name).to_string(),
                arguments: args.to_string(),
            });
            turn.parts.push(ContentPart::ToolResult {
                tool_use_id: id,
                content: "ok".to_string(),
                is_error: false,
            });
        }
        db.append_turn(&turn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_isolation() {
        let world = TestWorld::new().unwrap();
        world.project_file("src/lib.rs", "fn a() {}").unwrap();
        assert!(world.project().join("src/lib.rs").exists());
        assert!(world.workspace().exists());
    }

    #[test]
    fn test_seeded_session_visible_in_store() {
        let world = TestWorld::new().unwrap();
        world
            .seed_tool_sequence_session(
                "s1",
                "demo",
                &[
                    ("read", serde_json::json!({"file_path": "a.rs"})),
                    ("edit", serde_json::json!({"file_path": "a.rs"})),
                ],
            )
            .unwrap();

        let db = world.open_store().unwrap();
        let turns = db.turns_for_session("s1").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].tool_calls().len(), 2);
    }
}
