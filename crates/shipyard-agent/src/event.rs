use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One message of the agent CLI's `stream-json` output.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Session initialisation, first on the stream.
    System(SystemEvent),
    Assistant(AssistantEvent),
    /// Tool results fed back into the conversation.
    User(UserEvent),
    /// Emitted once at the very end.
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Decode one stream value; shapes we do not model become `Unknown`.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_else(|e| {
            debug!(error = %e, "unrecognised agent event");
            Self::Unknown
        })
    }

    /// Text blocks of an assistant turn, joined by newlines.
    pub fn assistant_text(&self) -> Option<String> {
        let Self::Assistant(AssistantEvent {
            message: Some(AssistantMessage {
                content: Some(blocks),
                ..
            }),
        }) = self
        else {
            return None;
        };
        let text: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        (!text.is_empty()).then(|| text.join("\n"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// May be empty when the last turn was a tool call.
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    #[serde(alias = "total_cost_usd")]
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
}

/// What one agent run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    /// Final result text, or all assistant text when the result was empty.
    pub output: String,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub tool_calls: u32,
    pub num_turns: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Folds events into a [`Transcript`] as they arrive.
#[derive(Debug, Default)]
pub struct TranscriptBuilder {
    result: Option<String>,
    assistant_text: String,
    session_id: Option<String>,
    is_error: bool,
    tool_calls: u32,
    num_turns: Option<u64>,
    cost_usd: Option<f64>,
}

impl TranscriptBuilder {
    /// Record an event. Returns new assistant text, if the event carried any.
    pub fn push(&mut self, event: &AgentEvent) -> Option<String> {
        match event {
            AgentEvent::System(e) => {
                if e.session_id.is_some() {
                    self.session_id.clone_from(&e.session_id);
                }
                None
            }
            AgentEvent::Assistant(e) => {
                if let Some(blocks) = e.message.as_ref().and_then(|m| m.content.as_ref()) {
                    self.tool_calls += blocks
                        .iter()
                        .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                        .count() as u32;
                }
                let text = event.assistant_text()?;
                if !self.assistant_text.is_empty() {
                    self.assistant_text.push('\n');
                }
                self.assistant_text.push_str(&text);
                Some(text)
            }
            AgentEvent::Result(e) => {
                if e.session_id.is_some() {
                    self.session_id.clone_from(&e.session_id);
                }
                if let Some(text) = e.result.as_ref().filter(|t| !t.is_empty()) {
                    self.result = Some(text.clone());
                }
                self.is_error |= e.is_error.unwrap_or(false);
                self.num_turns = e.num_turns.or(self.num_turns);
                self.cost_usd = e.cost_usd.or(self.cost_usd);
                None
            }
            AgentEvent::User(_) | AgentEvent::Unknown => None,
        }
    }

    pub fn finish(self) -> Transcript {
        Transcript {
            output: self.result.unwrap_or(self.assistant_text),
            session_id: self.session_id,
            is_error: self.is_error,
            tool_calls: self.tool_calls,
            num_turns: self.num_turns,
            cost_usd: self.cost_usd,
        }
    }
}

/// Decode a complete NDJSON capture. Lines that are not JSON are skipped.
pub fn parse_stream(data: &str) -> Transcript {
    let mut builder = TranscriptBuilder::default();
    for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            builder.push(&AgentEvent::from_value(value));
        }
    }
    builder.finish()
}
