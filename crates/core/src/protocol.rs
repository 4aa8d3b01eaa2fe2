//! Request-side chat types and the tool-calling vocabulary shared by the
//! streaming and non-streaming paths.

use serde::{Deserialize, Serialize};

// ─── Messages ─────────────────────────────────────────────────────────────

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Flatten to text. Text parts are joined with newlines; other parts are skipped.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.to_string())),
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────

/// A resolved tool call as returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: generate_tool_call_id(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the parameters
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// `tool_choice` as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Named(NamedToolChoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedToolChoice {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: NamedFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

/// Generate a unique tool call ID.
pub fn generate_tool_call_id() -> String {
    let uuid_str = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &uuid_str[..24])
}

// ─── Request ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
    #[serde(default)]
    pub continuous_usage_stats: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioOptions {
    /// Response audio container: "wav" (default) or "pcm".
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub audio_chunk_size: Option<usize>,
    #[serde(default)]
    pub audio_chunk_overlap_size: Option<usize>,
}

fn default_n() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// A chat completion request as consumed by the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    #[serde(default)]
    pub echo: bool,
    #[serde(default = "default_true")]
    pub add_generation_prompt: bool,
    #[serde(default)]
    pub logprobs: bool,
    #[serde(default)]
    pub top_logprobs: Option<usize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub audio: Option<AudioOptions>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: None,
            messages: Vec::new(),
            tools: None,
            tool_choice: None,
            n: 1,
            stream: false,
            stream_options: None,
            echo: false,
            add_generation_prompt: true,
            logprobs: false,
            top_logprobs: None,
            max_tokens: None,
            audio: None,
        }
    }
}

impl ChatRequest {
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// Name of the function forced by a named `tool_choice`.
    pub fn named_tool(&self) -> Option<&str> {
        match &self.tool_choice {
            Some(ToolChoice::Named(named)) => Some(named.function.name.as_str()),
            _ => None,
        }
    }

    pub fn tool_choice_mode(&self) -> Option<ToolChoiceMode> {
        match &self.tool_choice {
            Some(ToolChoice::Mode(mode)) => Some(*mode),
            _ => None,
        }
    }

    /// Logprobs are only checked when both the flag and a top-k count were given.
    pub fn wants_logprobs(&self) -> bool {
        self.logprobs && self.top_logprobs.is_some()
    }

    pub fn include_usage(&self) -> bool {
        self.stream_options.as_ref().is_some_and(|o| o.include_usage)
    }

    pub fn include_continuous_usage(&self) -> bool {
        self.stream_options
            .as_ref()
            .is_some_and(|o| o.include_usage && o.continuous_usage_stats)
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    pub cached_tokens: usize,
}

impl UsageInfo {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
        }
    }

    pub fn with_cached_tokens(mut self, cached_tokens: Option<usize>) -> Self {
        self.prompt_tokens_details = cached_tokens.map(|cached_tokens| PromptTokensDetails {
            cached_tokens,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_deserializes_modes_and_named() {
        let auto: ToolChoice = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(auto, ToolChoice::Mode(ToolChoiceMode::Auto));

        let named: ToolChoice =
            serde_json::from_str(r#"{"type": "function", "function": {"name": "get_weather"}}"#)
                .unwrap();
        let req = ChatRequest {
            tool_choice: Some(named),
            ..Default::default()
        };
        assert_eq!(req.named_tool(), Some("get_weather"));
        assert_eq!(req.tool_choice_mode(), None);
    }

    #[test]
    fn request_defaults_from_minimal_json() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"messages": [{"role": "user", "content": "hi"}]}"#).unwrap();
        assert_eq!(req.n, 1);
        assert!(req.add_generation_prompt);
        assert!(!req.echo);
        assert!(!req.include_usage());
    }

    #[test]
    fn continuous_usage_requires_include_usage() {
        let req = ChatRequest {
            stream_options: Some(StreamOptions {
                include_usage: false,
                continuous_usage_stats: true,
            }),
            ..Default::default()
        };
        assert!(!req.include_continuous_usage());
    }

    #[test]
    fn parts_content_joins_text_with_newlines() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"role": "user", "content": [
                {"type": "text", "text": "first"},
                {"type": "image_url"},
                {"type": "text", "text": "second"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(msg.content.unwrap().as_text(), "first\nsecond");
    }

    #[test]
    fn tool_call_ids_have_fixed_shape() {
        let id = generate_tool_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), 5 + 24);
    }

    #[test]
    fn usage_totals_and_cached_details() {
        let usage = UsageInfo::new(10, 5).with_cached_tokens(Some(4));
        assert_eq!(usage.total_tokens, 15);
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["prompt_tokens_details"]["cached_tokens"], 4);

        let plain = serde_json::to_value(UsageInfo::new(1, 1)).unwrap();
        assert!(plain.get("prompt_tokens_details").is_none());
    }
}
