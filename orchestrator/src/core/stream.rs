//! Incremental decoder for the agent's newline-delimited JSON event stream.
//!
//! Lines are split at the byte level before UTF-8 decoding, so the decoded
//! event sequence does not depend on where the pipe happened to split reads.
//! Malformed lines are dropped: a line is only ever parsed once it is
//! complete, and anything that still fails to decode is protocol noise.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::types::PermissionDenial;

/// One decoded event from the agent stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Partial assistant text (streamed with partial messages enabled).
    AssistantTextDelta(String),
    /// Partial assistant reasoning.
    AssistantThinkingDelta(String),
    /// Complete text of one assistant message.
    AssistantText(String),
    /// Complete reasoning of one assistant message.
    AssistantThinking(String),
    ToolInvocationStarted {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolInvocationEnded {
        tool_use_id: Option<String>,
        is_error: bool,
    },
    FinalResult {
        session_id: Option<String>,
        result: String,
        permission_denials: Vec<PermissionDenial>,
        is_error: bool,
    },
    /// A well-formed record of a type this decoder does not interpret.
    Unknown(String),
}

/// Buffers partial lines across reads and yields decoded events.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and decode every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(decode_line(&line));
        }
        events
    }

    /// Decode whatever is left once the stream closes, then drop it.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Bytes currently held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> Vec<StreamEvent> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return Vec::new();
    };
    let line = text.trim();
    if line.is_empty() {
        return Vec::new();
    }
    parse_line(line)
}

/// Decode a single complete line. One record may carry several events.
pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Vec::new();
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Vec::new();
    };

    match kind.as_str() {
        "stream_event" => decode_as::<WireStreamEnvelope>(value)
            .map(|envelope| envelope.event.into_events())
            .unwrap_or_default(),
        "assistant" => decode_as::<WireMessageEnvelope>(value)
            .map(|envelope| assistant_events(envelope.message.content))
            .unwrap_or_default(),
        "user" => decode_as::<WireMessageEnvelope>(value)
            .map(|envelope| tool_result_events(envelope.message.content))
            .unwrap_or_default(),
        "result" => decode_as::<WireResult>(value)
            .map(|result| {
                vec![StreamEvent::FinalResult {
                    session_id: result.session_id,
                    result: result.result.unwrap_or_default(),
                    permission_denials: result.permission_denials,
                    is_error: result.is_error,
                }]
            })
            .unwrap_or_default(),
        _ => vec![StreamEvent::Unknown(kind)],
    }
}

fn decode_as<T: DeserializeOwned>(value: Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

fn assistant_events(blocks: Vec<WireContentBlock>) -> Vec<StreamEvent> {
    let mut texts = Vec::new();
    let mut thinking = Vec::new();
    let mut tools = Vec::new();
    for block in blocks {
        match block {
            WireContentBlock::Text { text } => texts.push(text),
            WireContentBlock::Thinking { thinking: body } => thinking.push(body),
            WireContentBlock::ToolUse { id, name, input } => {
                tools.push(StreamEvent::ToolInvocationStarted { id, name, input });
            }
            WireContentBlock::ToolResult { .. } | WireContentBlock::Other => {}
        }
    }

    let mut events = Vec::new();
    if !thinking.is_empty() {
        events.push(StreamEvent::AssistantThinking(thinking.join("\n")));
    }
    if !texts.is_empty() {
        events.push(StreamEvent::AssistantText(texts.join("\n")));
    }
    events.extend(tools);
    events
}

fn tool_result_events(blocks: Vec<WireContentBlock>) -> Vec<StreamEvent> {
    blocks
        .into_iter()
        .filter_map(|block| match block {
            WireContentBlock::ToolResult {
                tool_use_id,
                is_error,
            } => Some(StreamEvent::ToolInvocationEnded {
                tool_use_id,
                is_error,
            }),
            _ => None,
        })
        .collect()
}

#[derive(Deserialize)]
struct WireStreamEnvelope {
    event: WireStreamEvent,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    ContentBlockStart {
        content_block: WireContentBlock,
    },
    ContentBlockDelta {
        delta: WireDelta,
    },
    ContentBlockStop,
    #[serde(other)]
    Other,
}

impl WireStreamEvent {
    fn into_events(self) -> Vec<StreamEvent> {
        match self {
            Self::ContentBlockStart {
                content_block: WireContentBlock::ToolUse { id, name, input },
            } => vec![StreamEvent::ToolInvocationStarted { id, name, input }],
            Self::ContentBlockDelta {
                delta: WireDelta::TextDelta { text },
            } => vec![StreamEvent::AssistantTextDelta(text)],
            Self::ContentBlockDelta {
                delta: WireDelta::ThinkingDelta { thinking },
            } => vec![StreamEvent::AssistantThinkingDelta(thinking)],
            Self::ContentBlockStop => vec![StreamEvent::ToolInvocationEnded {
                tool_use_id: None,
                is_error: false,
            }],
            _ => Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireMessageEnvelope {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default, deserialize_with = "content_blocks")]
    content: Vec<WireContentBlock>,
}

/// Message content is either a block array or (for plain user turns) a bare string.
fn content_blocks<'de, D>(deserializer: D) -> Result<Vec<WireContentBlock>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap_or(WireContentBlock::Other))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    permission_denials: Vec<PermissionDenial>,
    #[serde(default)]
    is_error: bool,
}
