use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
///
/// Messages are immutable once added to memory; compaction replaces whole
/// spans rather than editing individual messages in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Preservation weight in `[0,1]`.  Messages at or above the compaction
    /// importance threshold are exempt from eviction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    /// Provenance of a system block (e.g. `"SensoryMemory"`, `"violation"`).
    /// Drivers may use this for provider-specific cache-breakpoint placement;
    /// it never affects the canonical projection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            importance: None,
            source: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            importance: None,
            source: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            importance: None,
            source: None,
        }
    }

    /// An assistant message that requests a single tool invocation.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            },
            importance: None,
            source: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
            importance: None,
            source: None,
        }
    }

    /// Tag a system block with its provenance.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Tag a message with a preservation weight, clamped to `[0,1]`.
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    /// Return the plain text of this message, if it carries any.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// The tool-call id this message participates in, for either side of a
    /// tool interaction.  `None` for plain text messages.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.content {
            MessageContent::ToolCall { tool_call_id, .. } => Some(tool_call_id),
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            MessageContent::Text(_) => None,
        }
    }

    /// Character count of the content as seen by the token estimator.
    pub fn content_chars(&self) -> usize {
        match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        }
    }
}

/// Message roles.  Each role is an independent eviction lane in virtual
/// memory: lanes carry their own weights and recency floors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::System, Role::User, Role::Assistant, Role::Tool];
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// The content of a message.
///
/// - `Text` – plain string (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.  May be malformed — consumers treat
    /// parse failure as empty args.
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Requests and stream events ───────────────────────────────────────────────

/// Request sent to a chat driver.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Model id for drivers that serve more than one model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    /// Thinking-intensity lever in `[0,1]`; drivers that support extended
    /// reasoning map it to their own budget parameter.
    pub thinking_budget: Option<f32>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// The model wants to call a tool.  `index` keys parallel tool calls
    /// whose argument chunks interleave; drivers that never interleave use 0.
    ToolCall {
        index: u32,
        id: String,
        name: String,
        /// Accumulated JSON arguments (may arrive across multiple deltas)
        arguments: String,
    },
    /// A reasoning delta (extended thinking API)
    ThinkingDelta(String),
    /// Final usage statistics
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

/// Token usage from one model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_assistant_sets_role_and_text() {
        let m = Message::assistant("reply");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.as_text(), Some("reply"));
    }

    #[test]
    fn message_system_with_source_keeps_provenance() {
        let m = Message::system("prompt").with_source("SensoryMemory");
        assert_eq!(m.role, Role::System);
        assert_eq!(m.source.as_deref(), Some("SensoryMemory"));
    }

    #[test]
    fn message_tool_call_links_both_sides() {
        let call = Message::tool_call("id-1", "shell", r#"{"command":"ls"}"#);
        let result = Message::tool_result("id-1", "file1\nfile2");
        assert_eq!(call.tool_call_id(), Some("id-1"));
        assert_eq!(result.tool_call_id(), Some("id-1"));
        assert_eq!(call.role, Role::Assistant);
        assert_eq!(result.role, Role::Tool);
    }

    #[test]
    fn plain_text_has_no_tool_call_id() {
        assert!(Message::user("hi").tool_call_id().is_none());
    }

    #[test]
    fn importance_is_clamped_to_unit_interval() {
        assert_eq!(Message::user("x").with_importance(1.7).importance, Some(1.0));
        assert_eq!(Message::user("x").with_importance(-0.3).importance, Some(0.0));
        assert_eq!(Message::user("x").with_importance(0.4).importance, Some(0.4));
    }

    // ── Content chars ─────────────────────────────────────────────────────────

    #[test]
    fn content_chars_counts_text() {
        assert_eq!(Message::user("12345678").content_chars(), 8);
    }

    #[test]
    fn content_chars_counts_tool_call_name_plus_args() {
        let m = Message::tool_call("id", "aaaa", "bbbbbbbb");
        assert_eq!(m.content_chars(), 12);
    }

    #[test]
    fn content_chars_counts_tool_result_content() {
        let m = Message::tool_result("id", "1234567890123456");
        assert_eq!(m.content_chars(), 16);
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload").with_importance(0.8);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn tool_call_round_trips_through_json() {
        let original = Message::tool_call("c1", "grep", r#"{"pattern":"x"}"#);
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn optional_fields_are_omitted_when_none() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("importance"));
        assert!(!json.contains("source"));
    }

    #[test]
    fn usage_add_accumulates_all_counters() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 2,
            cache_write_tokens: 1,
        });
        total.add(&Usage {
            input_tokens: 3,
            output_tokens: 4,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 9);
        assert_eq!(total.cache_read_tokens, 2);
        assert_eq!(total.cache_write_tokens, 1);
    }
}
