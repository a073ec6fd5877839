use crate::{Context, EventStream, ModelProvider, StreamOptions};
use std::collections::VecDeque;
use std::sync::Mutex;
use sutradhar_types::{StopReason, StreamEvent, TokenUsage};

/// Provider that replays pre-recorded event scripts, one per call.
///
/// Used by tests and offline runs: each `stream` call pops the next script
/// and emits its events in order, honoring cooperative cancellation at
/// every event boundary. When the scripts run out it emits a bare
/// `Start`/`Done` pair.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            name: "scripted".to_string(),
            scripts: Mutex::new(scripts.into()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Convenience script: a text-only reply with usage and a clean stop.
    pub fn text_reply(message_id: &str, text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::Start {
                message_id: message_id.to_string(),
            },
            StreamEvent::Text {
                text: text.to_string(),
            },
            StreamEvent::Usage(TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_read_tokens: None,
                cache_write_tokens: None,
            }),
            StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                    cache_read_tokens: None,
                    cache_write_tokens: None,
                },
                cost: Some(0.001),
            },
        ]
    }

    fn next_script(&self) -> Vec<StreamEvent> {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.pop_front().unwrap_or_else(|| {
            vec![
                StreamEvent::Start {
                    message_id: "scripted-empty".to_string(),
                },
                StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage::default(),
                    cost: None,
                },
            ]
        })
    }
}

impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, _model: &str, _context: &Context, options: &StreamOptions) -> EventStream {
        let events = self.next_script();
        let cancel = options.cancel.clone();

        let state = (events.into_iter(), cancel, false);
        Box::pin(futures::stream::unfold(
            state,
            |(mut events, cancel, finished)| async move {
                if finished {
                    return None;
                }
                if cancel.is_cancelled() {
                    let stop = StreamEvent::Done {
                        stop_reason: StopReason::StopSequence,
                        usage: TokenUsage::default(),
                        cost: None,
                    };
                    return Some((stop, (events, cancel, true)));
                }
                match events.next() {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        Some((event, (events, cancel, terminal)))
                    }
                    None => None,
                }
            },
        ))
    }
}
