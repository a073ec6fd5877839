use crate::consolidate::{ConsolidatorConfig, ReplaySession};
use std::collections::{HashMap, HashSet};
use sutradhar_core::fnv1a_hex;
use sutradhar_types::{ParamSpec, Vidhi, VidhiStep};

/// Longest tool n-gram considered for proceduralization.
const MAX_SEQUENCE_LENGTH: usize = 6;

/// Sessions a sequence must span before it qualifies.
const MIN_SESSION_SPREAD: usize = 3;

/// Example values retained per discovered parameter.
const MAX_EXAMPLES: usize = 3;

#[derive(Default)]
struct SequenceStats {
    sessions: HashSet<String>,
    /// Per-instance argument values, one `Vec` per occurrence.
    instances: Vec<Vec<serde_json::Value>>,
    successes: u64,
    calls: u64,
}

/// PROCEDURALIZE: mine parameterized procedures from repeated tool-call
/// n-grams.
///
/// A sequence qualifies when it appears in at least three sessions with an
/// average success rate above the configured floor. Argument objects are
/// anti-unified position by position: keys equal across every instance stay
/// constants, diverging keys become `${stepN_param_key}` parameters.
pub fn mine_procedures(
    sessions: &[ReplaySession],
    existing_ids: &HashSet<String>,
    config: &ConsolidatorConfig,
) -> Vec<Vidhi> {
    let project = match sessions.first() {
        Some(session) => session.project.clone(),
        None => return Vec::new(),
    };

    let mut stats: HashMap<Vec<String>, SequenceStats> = HashMap::new();

    for session in sessions {
        let calls: Vec<(&str, &serde_json::Value, bool)> = session
            .turns
            .iter()
            .flat_map(|turn| turn.tool_calls.iter())
            .map(|call| (call.name.as_str(), &call.arguments, call.success))
            .collect();

        let min_len = config.min_sequence_length.max(2);
        for length in min_len..=MAX_SEQUENCE_LENGTH.min(calls.len()) {
            for window in calls.windows(length) {
                let key: Vec<String> = window.iter().map(|(name, _, _)| name.to_string()).collect();
                let entry = stats.entry(key).or_default();
                entry.sessions.insert(session.session_id.clone());
                entry
                    .instances
                    .push(window.iter().map(|(_, args, _)| (*args).clone()).collect());
                entry.calls += window.len() as u64;
                entry.successes += window.iter().filter(|(_, _, ok)| *ok).count() as u64;
            }
        }
    }

    // Qualification pass.
    let mut qualified: Vec<(Vec<String>, SequenceStats)> = stats
        .into_iter()
        .filter(|(_, stat)| {
            let avg_success = if stat.calls == 0 {
                0.0
            } else {
                stat.successes as f64 / stat.calls as f64
            };
            stat.sessions.len() >= MIN_SESSION_SPREAD && avg_success >= config.min_success_rate
        })
        .collect();

    // Prefer the longest expression of a workflow: drop sequences that are
    // contiguous subsequences of a longer qualifying one with at least the
    // same spread.
    let keys: Vec<(Vec<String>, usize)> = qualified
        .iter()
        .map(|(key, stat)| (key.clone(), stat.sessions.len()))
        .collect();
    qualified.retain(|(key, stat)| {
        !keys.iter().any(|(other, other_spread)| {
            other.len() > key.len()
                && *other_spread >= stat.sessions.len()
                && is_contiguous_subsequence(key, other)
        })
    });

    qualified.sort_by(|(a, _), (b, _)| a.join(",").cmp(&b.join(",")));

    let mut vidhis = Vec::new();
    for (names, stat) in qualified {
        let name = names.join("-then-");
        let id = fnv1a_hex(&format!("{}:{}", name, project));
        if existing_ids.contains(&id) {
            continue;
        }

        let (steps, parameters) = anti_unify(&names, &stat.instances);
        let avg_success = stat.successes as f64 / stat.calls.max(1) as f64;
        let spread = stat.sessions.len();

        let mut learned_from: Vec<String> = stat.sessions.into_iter().collect();
        learned_from.sort();

        vidhis.push(Vidhi {
            id,
            project: project.clone(),
            name,
            learned_from,
            confidence: avg_success * (spread as f64 / (spread as f64 + 1.0)),
            steps,
            triggers: triggers_for(&names),
            success_rate: avg_success,
            parameter_schema: parameters,
        });
    }

    vidhis
}

fn is_contiguous_subsequence(needle: &[String], haystack: &[String]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Anti-unify argument objects across all instances of one sequence.
fn anti_unify(
    names: &[String],
    instances: &[Vec<serde_json::Value>],
) -> (Vec<VidhiStep>, Vec<ParamSpec>) {
    let mut steps = Vec::with_capacity(names.len());
    let mut parameters = Vec::new();

    for (position, tool_name) in names.iter().enumerate() {
        let values: Vec<&serde_json::Value> = instances
            .iter()
            .filter_map(|instance| instance.get(position))
            .collect();

        let template = if values.iter().all(|v| v.is_object()) {
            let mut object = serde_json::Map::new();

            // Keys present in every instance, first-instance order.
            let shared_keys: Vec<String> = values
                .first()
                .and_then(|v| v.as_object())
                .map(|first| {
                    first
                        .keys()
                        .filter(|key| {
                            values
                                .iter()
                                .all(|v| v.as_object().is_some_and(|o| o.contains_key(*key)))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            for key in shared_keys {
                let key_values: Vec<&serde_json::Value> = values
                    .iter()
                    .filter_map(|v| v.as_object().and_then(|o| o.get(&key)))
                    .collect();
                let all_equal = key_values.windows(2).all(|pair| pair[0] == pair[1]);

                if all_equal {
                    object.insert(key, (*key_values[0]).clone());
                } else {
                    let param_name = format!("step{}_param_{}", position, key);
                    let mut examples: Vec<serde_json::Value> = Vec::new();
                    for value in &key_values {
                        if !examples.contains(*value) {
                            examples.push((*value).clone());
                        }
                        if examples.len() == MAX_EXAMPLES {
                            break;
                        }
                    }
                    parameters.push(ParamSpec {
                        name: param_name.clone(),
                        param_type: json_type_name(key_values[0]).to_string(),
                        examples,
                    });
                    object.insert(
                        key,
                        serde_json::Value::String(format!("${{{}}}", param_name)),
                    );
                }
            }
            serde_json::Value::Object(object).to_string()
        } else {
            // Non-object arguments: constant if uniform, one parameter slot
            // otherwise.
            let all_equal = values.windows(2).all(|pair| pair[0] == pair[1]);
            if all_equal {
                values
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            } else {
                let param_name = format!("step{}_param_value", position);
                parameters.push(ParamSpec {
                    name: param_name.clone(),
                    param_type: values
                        .first()
                        .map(|v| json_type_name(v))
                        .unwrap_or("string")
                        .to_string(),
                    examples: values
                        .iter()
                        .take(MAX_EXAMPLES)
                        .map(|v| (*v).clone())
                        .collect(),
                });
                format!("\"${{{}}}\"", param_name)
            }
        };

        steps.push(VidhiStep {
            index: position,
            tool_name: tool_name.clone(),
            arg_template: template,
            description: format!("run {}", tool_name),
        });
    }

    (steps, parameters)
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::String(_) => "string",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
        serde_json::Value::Null => "string",
    }
}

/// Natural-language trigger phrases for a tool sequence.
fn triggers_for(names: &[String]) -> Vec<String> {
    let mut triggers = Vec::new();
    if names.len() >= 2 {
        let mut joined = names[..names.len() - 1].join(" then ");
        joined.push_str(" and ");
        joined.push_str(&names[names.len() - 1]);
        triggers.push(joined);
    } else {
        triggers.push(names.join(" "));
    }

    let has = |tool: &str| names.iter().any(|n| n == tool);
    if has("read") && has("edit") {
        triggers.push("modify file".to_string());
    }
    if has("grep") || has("find") {
        triggers.push("search codebase".to_string());
    }
    if has("bash") {
        triggers.push("run command".to_string());
    }
    if has("write") {
        triggers.push("create file".to_string());
    }
    triggers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::{ReplayToolCall, ReplayTurn};
    use sutradhar_types::Role;

    fn session(id: &str, file: &str) -> ReplaySession {
        ReplaySession {
            session_id: id.to_string(),
            project: "demo".to_string(),
            turns: vec![ReplayTurn {
                role: Role::Assistant,
                content: String::new(),
                tool_calls: vec![
                    ReplayToolCall {
                        name: "read".to_string(),
                        arguments: serde_json::json!({"file_path": file}),
                        success: true,
                    },
                    ReplayToolCall {
                        name: "edit".to_string(),
                        arguments: serde_json::json!({"file_path": file, "dry_run": false}),
                        success: true,
                    },
                    ReplayToolCall {
                        name: "bash".to_string(),
                        arguments: serde_json::json!({"command": "cargo test"}),
                        success: true,
                    },
                ],
            }],
        }
    }

    fn five_sessions() -> Vec<ReplaySession> {
        (0..5)
            .map(|i| session(&format!("s{}", i), &format!("src/file{}.rs", i)))
            .collect()
    }

    #[test]
    fn test_mines_three_step_procedure_with_parameters() {
        let sessions = five_sessions();
        let vidhis = mine_procedures(&sessions, &HashSet::new(), &ConsolidatorConfig::default());

        let vidhi = vidhis
            .iter()
            .find(|v| v.name == "read-then-edit-then-bash")
            .expect("three-step vidhi mined");

        assert_eq!(vidhi.steps.len(), 3);
        assert_eq!(vidhi.steps[0].tool_name, "read");
        assert_eq!(vidhi.steps[2].tool_name, "bash");
        assert!(vidhi.confidence > 0.0);
        assert_eq!(vidhi.learned_from.len(), 5);

        // file_path varies per session, so it becomes a parameter.
        assert!(vidhi
            .parameter_schema
            .iter()
            .any(|p| p.name.contains("param_file_path")));
        assert!(vidhi.steps[0].arg_template.contains("${step0_param_file_path}"));

        // command is constant across sessions.
        assert!(vidhi.steps[2].arg_template.contains("cargo test"));
        // dry_run is a constant boolean.
        assert!(vidhi.steps[1].arg_template.contains("false"));
    }

    #[test]
    fn test_shorter_subsequences_subsumed_by_longest() {
        let sessions = five_sessions();
        let vidhis = mine_procedures(&sessions, &HashSet::new(), &ConsolidatorConfig::default());
        assert_eq!(vidhis.len(), 1);
        assert_eq!(vidhis[0].name, "read-then-edit-then-bash");
    }

    #[test]
    fn test_existing_ids_are_skipped() {
        let sessions = five_sessions();
        let first = mine_procedures(&sessions, &HashSet::new(), &ConsolidatorConfig::default());
        let existing: HashSet<String> = first.iter().map(|v| v.id.clone()).collect();

        let second = mine_procedures(&sessions, &existing, &ConsolidatorConfig::default());
        assert!(second.is_empty());
    }

    #[test]
    fn test_two_sessions_insufficient_spread() {
        let sessions: Vec<ReplaySession> = (0..2)
            .map(|i| session(&format!("s{}", i), "src/lib.rs"))
            .collect();
        let vidhis = mine_procedures(&sessions, &HashSet::new(), &ConsolidatorConfig::default());
        assert!(vidhis.is_empty());
    }

    #[test]
    fn test_low_success_rate_disqualifies() {
        let mut sessions = five_sessions();
        for session in sessions.iter_mut() {
            for call in session.turns[0].tool_calls.iter_mut() {
                call.success = false;
            }
        }
        let vidhis = mine_procedures(&sessions, &HashSet::new(), &ConsolidatorConfig::default());
        assert!(vidhis.is_empty());
    }

    #[test]
    fn test_triggers_include_synonyms() {
        let names = vec!["read".to_string(), "edit".to_string(), "bash".to_string()];
        let triggers = triggers_for(&names);
        assert!(triggers.contains(&"read then edit and bash".to_string()));
        assert!(triggers.contains(&"modify file".to_string()));
        assert!(triggers.contains(&"run command".to_string()));
    }
}
