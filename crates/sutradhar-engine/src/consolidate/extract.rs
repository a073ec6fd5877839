use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use sutradhar_core::fnv1a_hex;
use sutradhar_types::{PatternType, Role, Samskara, CORRECTION_PHRASES};

/// One tool call as the replay phase sees it.
#[derive(Debug, Clone)]
pub struct ReplayToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
}

/// One turn as the replay phase sees it.
#[derive(Debug, Clone)]
pub struct ReplayTurn {
    pub role: Role,
    pub content: String,
    pub tool_calls: Vec<ReplayToolCall>,
}

/// One session's replayable material.
#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub session_id: String,
    pub project: String,
    pub turns: Vec<ReplayTurn>,
}

/// A samskara together with where and how often it was observed. The
/// per-session series feeds the stability check and holdout validation.
#[derive(Debug, Clone)]
pub struct PatternObservation {
    pub samskara: Samskara,
    /// Distinct sessions the pattern appeared in, replay order.
    pub sessions: Vec<String>,
    /// Occurrence count per session in `sessions`.
    pub series: Vec<f64>,
}

static PREFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(i prefer|always use|please use|let's use|stick with)\b[^.\n]*").unwrap()
});

const FILE_PATH_KEYS: &[&str] = &["file_path", "path", "filename"];

fn normalize(content: &str) -> String {
    content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn snippet(text: &str, max: usize) -> String {
    let normalized = normalize(text);
    normalized.chars().take(max).collect()
}

#[derive(Default)]
struct Candidate {
    pattern_type: Option<PatternType>,
    content: String,
    /// (session index, count) pairs in replay order.
    per_session: Vec<(usize, f64)>,
    total: u64,
    last_session: usize,
}

impl Candidate {
    fn bump(&mut self, session_index: usize) {
        self.total += 1;
        self.last_session = session_index;
        match self.per_session.last_mut() {
            Some((index, count)) if *index == session_index => *count += 1.0,
            _ => self.per_session.push((session_index, 1.0)),
        }
    }
}

/// RECOMBINE: detect candidate patterns across the replay window.
///
/// Candidates below `min_frequency` total observations are dropped. The
/// result is deterministic for a given replay window, which keeps
/// repeated REPLAY+RECOMBINE runs idempotent under the FNV-keyed upsert.
pub fn extract_patterns(
    sessions: &[ReplaySession],
    min_frequency: u64,
) -> Vec<PatternObservation> {
    let mut candidates: HashMap<(PatternType, String), Candidate> = HashMap::new();

    let mut bump = |pattern_type: PatternType, content: String, session_index: usize| {
        let key = (pattern_type, normalize(&content));
        let entry = candidates.entry(key.clone()).or_default();
        if entry.pattern_type.is_none() {
            entry.pattern_type = Some(pattern_type);
            entry.content = key.1;
        }
        entry.bump(session_index);
    };

    for (session_index, session) in sessions.iter().enumerate() {
        let mut file_paths: Vec<String> = Vec::new();

        for (turn_index, turn) in session.turns.iter().enumerate() {
            // tool-sequence: consecutive tool invocations within a turn.
            if turn.tool_calls.len() >= 2 {
                let names: Vec<&str> =
                    turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
                bump(PatternType::ToolSequence, names.join(","), session_index);
            }

            for call in &turn.tool_calls {
                if let Some(object) = call.arguments.as_object() {
                    for key in FILE_PATH_KEYS {
                        if let Some(path) = object.get(*key).and_then(|v| v.as_str()) {
                            file_paths.push(path.to_string());
                        }
                    }
                }
            }

            if turn.role == Role::User {
                let lowered = turn.content.to_lowercase();

                // preference: recurring phrasing that selects among options.
                if let Some(found) = PREFERENCE.find(&turn.content) {
                    bump(
                        PatternType::Preference,
                        found.as_str().to_string(),
                        session_index,
                    );
                }

                // correction: same phrase list the correctness guardian uses.
                for phrase in CORRECTION_PHRASES {
                    if lowered.contains(phrase) {
                        bump(PatternType::Correction, (*phrase).to_string(), session_index);
                        break;
                    }
                }

                // decision: user prompt answered by a tool action.
                if let Some(next) = session.turns.get(turn_index + 1) {
                    if next.role == Role::Assistant {
                        if let Some(first_tool) = next.tool_calls.first() {
                            bump(
                                PatternType::Decision,
                                format!("{} -> {}", snippet(&turn.content, 40), first_tool.name),
                                session_index,
                            );
                        }
                    }
                }
            }
        }

        // convention: file-naming regularities within a session.
        if let Some(content) = naming_convention(&file_paths) {
            bump(PatternType::Convention, content, session_index);
        }
    }

    let project = sessions
        .first()
        .map(|s| s.project.clone())
        .unwrap_or_default();

    let mut observations: Vec<PatternObservation> = candidates
        .into_iter()
        .filter(|(_, candidate)| candidate.total >= min_frequency)
        .map(|((pattern_type, normalized), candidate)| {
            let sessions_hit: Vec<String> = candidate
                .per_session
                .iter()
                .map(|(index, _)| sessions[*index].session_id.clone())
                .collect();
            let series: Vec<f64> = candidate.per_session.iter().map(|(_, c)| *c).collect();
            let id = fnv1a_hex(&format!("{}:{}", pattern_type.as_str(), normalized));
            let confidence = candidate.total as f64 / (candidate.total as f64 + 2.0);

            PatternObservation {
                samskara: Samskara {
                    id,
                    session_id: sessions[candidate.last_session].session_id.clone(),
                    pattern_type,
                    content: candidate.content,
                    observation_count: candidate.total,
                    confidence,
                    project: project.clone(),
                },
                sessions: sessions_hit,
                series,
            }
        })
        .collect();

    observations.sort_by(|a, b| a.samskara.id.cmp(&b.samskara.id));
    observations
}

/// Detect a dominant naming style among observed file paths.
fn naming_convention(paths: &[String]) -> Option<String> {
    if paths.len() < 3 {
        return None;
    }

    let mut snake = 0usize;
    let mut kebab = 0usize;
    let mut camel = 0usize;
    let mut extensions: HashMap<String, usize> = HashMap::new();

    for path in paths {
        let stem = path.rsplit('/').next().unwrap_or(path);
        let (name, ext) = match stem.rsplit_once('.') {
            Some((name, ext)) => (name, ext),
            None => (stem, ""),
        };
        if !ext.is_empty() {
            *extensions.entry(ext.to_lowercase()).or_default() += 1;
        }
        if name.contains('_') {
            snake += 1;
        } else if name.contains('-') {
            kebab += 1;
        } else if name.chars().any(|c| c.is_uppercase()) {
            camel += 1;
        }
    }

    let style = [("snake_case", snake), ("kebab-case", kebab), ("camelCase", camel)]
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .filter(|(_, count)| *count >= 3)
        .map(|(style, _)| style)?;

    let extension = extensions
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(ext, _)| ext)
        .unwrap_or_default();

    Some(format!("{} files named in {}", extension, style))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, args: serde_json::Value) -> ReplayToolCall {
        ReplayToolCall {
            name: name.to_string(),
            arguments: args,
            success: true,
        }
    }

    fn session_with_sequence(id: &str) -> ReplaySession {
        ReplaySession {
            session_id: id.to_string(),
            project: "demo".to_string(),
            turns: vec![ReplayTurn {
                role: Role::Assistant,
                content: "working".to_string(),
                tool_calls: vec![
                    tool("read", serde_json::json!({"file_path": "src/lib.rs"})),
                    tool("edit", serde_json::json!({"file_path": "src/lib.rs"})),
                    tool("bash", serde_json::json!({"command": "cargo test"})),
                ],
            }],
        }
    }

    #[test]
    fn test_tool_sequence_extraction() {
        let sessions: Vec<ReplaySession> = (0..5)
            .map(|i| session_with_sequence(&format!("s{}", i)))
            .collect();

        let observations = extract_patterns(&sessions, 2);
        let seq = observations
            .iter()
            .find(|o| o.samskara.pattern_type == PatternType::ToolSequence)
            .unwrap();
        assert_eq!(seq.samskara.content, "read,edit,bash");
        assert_eq!(seq.samskara.observation_count, 5);
        assert_eq!(seq.sessions.len(), 5);
        assert_eq!(seq.series, vec![1.0; 5]);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let sessions: Vec<ReplaySession> = (0..3)
            .map(|i| session_with_sequence(&format!("s{}", i)))
            .collect();

        let first = extract_patterns(&sessions, 2);
        let second = extract_patterns(&sessions, 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.samskara.id, b.samskara.id);
            assert_eq!(a.samskara.observation_count, b.samskara.observation_count);
        }
    }

    #[test]
    fn test_below_min_frequency_dropped() {
        let sessions = vec![session_with_sequence("s0")];
        let observations = extract_patterns(&sessions, 2);
        assert!(observations.is_empty());
    }

    #[test]
    fn test_correction_and_preference_detection() {
        let sessions: Vec<ReplaySession> = (0..2)
            .map(|i| ReplaySession {
                session_id: format!("s{}", i),
                project: "demo".to_string(),
                turns: vec![
                    ReplayTurn {
                        role: Role::User,
                        content: "Please use rg for searching. That's wrong, try again."
                            .to_string(),
                        tool_calls: vec![],
                    },
                    ReplayTurn {
                        role: Role::Assistant,
                        content: "retrying".to_string(),
                        tool_calls: vec![tool("grep", serde_json::json!({"pattern": "x"}))],
                    },
                ],
            })
            .collect();

        let observations = extract_patterns(&sessions, 2);
        assert!(observations
            .iter()
            .any(|o| o.samskara.pattern_type == PatternType::Correction));
        assert!(observations
            .iter()
            .any(|o| o.samskara.pattern_type == PatternType::Preference));
        assert!(observations
            .iter()
            .any(|o| o.samskara.pattern_type == PatternType::Decision));
    }

    #[test]
    fn test_naming_convention_detection() {
        let paths = vec![
            "src/tool_registry.rs".to_string(),
            "src/policy_engine.rs".to_string(),
            "src/audit_log.rs".to_string(),
        ];
        let convention = naming_convention(&paths).unwrap();
        assert!(convention.contains("snake_case"));
        assert!(convention.contains("rs"));

        assert!(naming_convention(&paths[..2].to_vec()).is_none());
    }
}
