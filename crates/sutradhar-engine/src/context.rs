use crate::router::RouterConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use sutradhar_types::{ContextVector, Turn};

// NOTE: Context Extraction Design
//
// Why heuristic markers instead of a tokenizer or classifier?
// - The router only needs coarse [0,1] features; a real tokenizer buys
//   nothing the bandit's own learning would not recover
// - chars/4 is a serviceable token estimate across the supported models
// - Marker regexes are compiled once and shared across calls

static MULTI_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(first|then|next|finally|afterwards|step \d|\d\.\s)").unwrap()
});
static URGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(urgent|asap|immediately|right now|quickly|deadline|hotfix)\b").unwrap()
});
static ERROR_CONTEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(error|failing|broken|crash|panic|regression|exception)\b").unwrap()
});
static CREATIVITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(brainstorm|design|imagine|ideas|creative|alternatives?|what if|how might)\b")
        .unwrap()
});
static PRECISION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(calculate|exact(ly)?|precise(ly)?|review|verify|prove|what is|when did|how many)\b")
        .unwrap()
});
static CODE_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(```|\bfn\b|\bimpl\b|\bclass\b|\bdef\b|=>|\{)").unwrap());

/// Approximate token count: characters divided by four.
fn approx_tokens(text: &str) -> f64 {
    text.chars().count() as f64 / 4.0
}

/// Fraction of content that sits inside fenced code blocks.
fn code_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let mut inside = false;
    let mut code_chars = 0usize;
    let total = text.chars().count().max(1);
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            continue;
        }
        if inside {
            code_chars += line.chars().count() + 1;
        }
    }
    (code_chars as f64 / total as f64).clamp(0.0, 1.0)
}

fn marker_score(regex: &Regex, text: &str, per_hit: f64) -> f64 {
    (regex.find_iter(text).count() as f64 * per_hit).clamp(0.0, 1.0)
}

/// Extract the seven routing features from a conversation.
///
/// All features land in [0, 1]; an empty conversation yields the zero
/// vector, which the router maps to its heuristic range.
pub fn extract_context(
    messages: &[Turn],
    system_prompt: &str,
    tool_count: usize,
    memory_hits: usize,
    config: &RouterConfig,
) -> ContextVector {
    let mut combined = String::with_capacity(1024);
    combined.push_str(system_prompt);
    for turn in messages {
        combined.push('\n');
        combined.push_str(&turn.text());
    }

    let tokens = approx_tokens(&combined);
    let token_score = (tokens / 2000.0).clamp(0.0, 1.0);
    let has_code = if CODE_MARKERS.is_match(&combined) { 1.0 } else { 0.0 };
    let multi_step = marker_score(&MULTI_STEP, &combined, 0.2);
    let complexity = (0.5 * token_score + 0.25 * has_code + 0.25 * multi_step).clamp(0.0, 1.0);

    let urgency = (marker_score(&URGENCY, &combined, 0.34)
        + marker_score(&ERROR_CONTEXT, &combined, 0.17))
    .clamp(0.0, 1.0);

    let creativity = marker_score(&CREATIVITY, &combined, 0.25);

    // Tool-heavy catalogs nudge precision: the caller expects exact work.
    let tool_nudge = (tool_count as f64 / 32.0).clamp(0.0, 0.2);
    let precision = (marker_score(&PRECISION, &combined, 0.25) + tool_nudge).clamp(0.0, 1.0);

    let conversation_depth =
        (messages.len() as f64 / config.max_conversation_depth.max(1) as f64).clamp(0.0, 1.0);
    let memory_load =
        (memory_hits as f64 / config.max_memory_hits.max(1) as f64).clamp(0.0, 1.0);

    ContextVector {
        complexity,
        urgency,
        creativity,
        precision,
        code_ratio: code_ratio(&combined),
        conversation_depth,
        memory_load,
    }
    .clamped()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sutradhar_types::{ContentPart, Role};

    fn turn_with_text(text: &str) -> Turn {
        let mut turn = Turn::new("s1", 0, Role::User);
        turn.parts = vec![ContentPart::Text {
            text: text.to_string(),
        }];
        turn
    }

    #[test]
    fn test_empty_conversation_is_zero_vector() {
        let config = RouterConfig::default();
        let ctx = extract_context(&[], "", 0, 0, &config);
        assert_eq!(ctx.complexity, 0.0);
        assert_eq!(ctx.urgency, 0.0);
        assert_eq!(ctx.code_ratio, 0.0);
        assert_eq!(ctx.conversation_depth, 0.0);
    }

    #[test]
    fn test_urgency_markers() {
        let config = RouterConfig::default();
        let turns = [turn_with_text("this is urgent, production is broken, fix asap")];
        let ctx = extract_context(&turns, "", 0, 0, &config);
        assert!(ctx.urgency > 0.5);
    }

    #[test]
    fn test_code_ratio_counts_fenced_blocks() {
        let config = RouterConfig::default();
        let text = "look at this\n```\nfn main() { println!(\"hi\"); }\nlet x = 1;\n```\n";
        let turns = [turn_with_text(text)];
        let ctx = extract_context(&turns, "", 0, 0, &config);
        assert!(ctx.code_ratio > 0.3);
        assert!(ctx.complexity > 0.0);
    }

    #[test]
    fn test_depth_and_memory_normalized() {
        let config = RouterConfig {
            max_conversation_depth: 10,
            max_memory_hits: 4,
            ..Default::default()
        };
        let turns: Vec<Turn> = (0..5).map(|_| turn_with_text("hello")).collect();
        let ctx = extract_context(&turns, "", 0, 2, &config);
        assert!((ctx.conversation_depth - 0.5).abs() < 1e-9);
        assert!((ctx.memory_load - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_multi_step_raises_complexity() {
        let config = RouterConfig::default();
        let plain = extract_context(&[turn_with_text("hello there")], "", 0, 0, &config);
        let steps = extract_context(
            &[turn_with_text(
                "First refactor the parser, then add tests, finally update the docs",
            )],
            "",
            0,
            0,
            &config,
        );
        assert!(steps.complexity > plain.complexity);
    }
}
