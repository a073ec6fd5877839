use std::path::{Path, PathBuf};
use sutradhar_types::{StopReason, StreamEvent, TokenUsage};

fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        cache_read_tokens: None,
        cache_write_tokens: None,
    }
}

/// A clean text-only reply.
pub fn text_script(message_id: &str, text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start {
            message_id: message_id.to_string(),
        },
        StreamEvent::Text {
            text: text.to_string(),
        },
        StreamEvent::Usage(usage(120, 40)),
        StreamEvent::Done {
            stop_reason: StopReason::EndTurn,
            usage: usage(120, 40),
            cost: Some(0.001),
        },
    ]
}

/// A planner reply with a well-formed plan object.
pub fn plan_script(steps: &[&str]) -> Vec<StreamEvent> {
    let steps_json: Vec<String> = steps.iter().map(|s| format!("\"{}\"", s)).collect();
    let plan = format!(
        r#"{{"steps": [{}], "complexity": "small", "requires_new_files": false, "relevant_files": []}}"#,
        steps_json.join(", ")
    );
    text_script("plan", &plan)
}

/// A reply that requests one tool call, then stops for tool use.
pub fn tool_call_script(name: &str, arguments: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start {
            message_id: "tool-call".to_string(),
        },
        StreamEvent::ToolCall {
            id: "t1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        },
        StreamEvent::Done {
            stop_reason: StopReason::ToolUse,
            usage: usage(200, 30),
            cost: Some(0.002),
        },
    ]
}

/// Write scripts to a JSON file in the format `SUTRADHAR_SCRIPT` expects.
pub fn script_file(dir: &Path, scripts: &[Vec<StreamEvent>]) -> anyhow::Result<PathBuf> {
    let path = dir.join("scripts.json");
    std::fs::write(&path, serde_json::to_string_pretty(scripts)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_script_parses_back() {
        let script = plan_script(&["read the file", "edit it"]);
        assert_eq!(script.len(), 4);
        if let StreamEvent::Text { text } = &script[1] {
            let value: serde_json::Value = {
                let start = text.find('{').unwrap();
                serde_json::from_str(&text[start..]).unwrap()
            };
            assert_eq!(value["steps"].as_array().unwrap().len(), 2);
        } else {
            panic!("expected text event");
        }
    }

    #[test]
    fn test_script_file_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let scripts = vec![text_script("m1", "hello")];
        let path = script_file(temp.path(), &scripts).unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let back: Vec<Vec<StreamEvent>> = serde_json::from_str(&content).unwrap();
        assert_eq!(back, scripts);
    }
}
