//! Hermes-style tool call extraction.
//!
//! ```text
//! <tool_call>{"name": "get_weather", "arguments": {"city": "NYC"}}</tool_call>
//! ```
//!
//! Streaming re-parses the accumulated text each step. Text before the first
//! `<tool_call>` is forwarded as content, holding back anything that could
//! still become the start tag. Each tool's name is sent once, with a fresh
//! id, as soon as it is a complete string; its arguments are streamed as the
//! growing compact JSON text. Text after the last closed call is content
//! again, without its leading whitespace.

use std::sync::LazyLock;

use regex::Regex;

use super::json::PartialJson;
use super::{
    DeltaMessage, DeltaToolCall, ExtractedToolCalls, ParsedToolCall, StepInput,
    ToolCallExtractor,
};
use crate::protocol::{generate_tool_call_id, ToolCall};

const START_TAG: &str = "<tool_call>";
const END_TAG: &str = "</tool_call>";

static TOOL_CALL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>")
        .expect("TOOL_CALL_REGEX pattern is invalid - this is a build-time error")
});

static TOOL_CALL_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<tool_call>[\s\S]*?</tool_call>")
        .expect("TOOL_CALL_TAG_REGEX pattern is invalid - this is a build-time error")
});

// Only matches once the name string is closed.
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*\{\s*"name"\s*:\s*"((?:[^"\\]|\\.)*)""#)
        .expect("NAME_REGEX pattern is invalid - this is a build-time error")
});

static ARGUMENTS_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""arguments"\s*:\s*"#)
        .expect("ARGUMENTS_KEY_REGEX pattern is invalid - this is a build-time error")
});

#[derive(Debug, serde::Deserialize)]
struct HermesToolCallJson {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

struct ToolBody<'a> {
    text: &'a str,
    closed: bool,
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| text.ends_with(&tag[..k]))
        .unwrap_or(0)
}

struct SplitOutput<'a> {
    /// End of the content before the first start tag.
    content_end: usize,
    bodies: Vec<ToolBody<'a>>,
    /// Text after the last closed call, minus leading whitespace and any
    /// partial start tag.
    trailing: Option<(usize, usize)>,
}

/// Split accumulated output into the streamable content prefix, the tool
/// bodies and the streamable text after the last closed body.
fn split_output(text: &str) -> SplitOutput<'_> {
    let Some(first) = text.find(START_TAG) else {
        return SplitOutput {
            content_end: text.len() - partial_tag_suffix(text, START_TAG),
            bodies: Vec::new(),
            trailing: None,
        };
    };

    let mut bodies = Vec::new();
    let mut pos = first;
    let mut trailing = None;
    loop {
        let Some(offset) = text[pos..].find(START_TAG) else {
            let rest = &text[pos..];
            let start = pos + (rest.len() - rest.trim_start().len());
            let end = text.len() - partial_tag_suffix(rest, START_TAG);
            trailing = (end > start).then_some((start, end));
            break;
        };
        let start = pos + offset + START_TAG.len();
        match text[start..].find(END_TAG) {
            Some(end) => {
                bodies.push(ToolBody {
                    text: &text[start..start + end],
                    closed: true,
                });
                pos = start + end + END_TAG.len();
            }
            None => {
                bodies.push(ToolBody {
                    text: &text[start..],
                    closed: false,
                });
                break;
            }
        }
    }
    SplitOutput {
        content_end: first,
        bodies,
        trailing,
    }
}

fn unescape_name(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}

#[derive(Debug, Default)]
pub struct HermesToolExtractor {
    prev_tool_calls: Vec<ParsedToolCall>,
    streamed_args: Vec<String>,
    name_sent: Vec<bool>,
    content_sent: usize,
    trailing_sent: usize,
}

impl HermesToolExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance_tool(&mut self, index: usize, body: &ToolBody<'_>) -> Option<DeltaToolCall> {
        if self.prev_tool_calls.len() <= index {
            self.prev_tool_calls.resize_with(index + 1, ParsedToolCall::default);
            self.streamed_args.resize_with(index + 1, String::new);
            self.name_sent.resize(index + 1, false);
        }

        let name_match = NAME_REGEX.captures(body.text)?;
        let mut fragment = DeltaToolCall {
            index,
            ..Default::default()
        };
        if !self.name_sent[index] {
            let name = unescape_name(&name_match[1]);
            self.prev_tool_calls[index].name = name.clone();
            self.name_sent[index] = true;
            fragment.id = Some(generate_tool_call_id());
            fragment.name = Some(name);
        }

        let after_name = &body.text[name_match.get(0).map_or(0, |m| m.end())..];
        if let Some(key) = ARGUMENTS_KEY_REGEX.find(after_name) {
            let scanned = PartialJson::scan(&after_name[key.end()..]);
            if let Some(best) = scanned.autocomplete() {
                self.prev_tool_calls[index].arguments = best;
            }
            let streamed = &self.streamed_args[index];
            if scanned.compact.len() > streamed.len() && scanned.compact.starts_with(streamed.as_str()) {
                fragment.arguments = Some(scanned.compact[streamed.len()..].to_string());
                self.streamed_args[index] = scanned.compact;
            }
        } else if body.closed && self.prev_tool_calls[index].arguments.is_empty() {
            self.prev_tool_calls[index].arguments = "{}".to_string();
        }

        (fragment.name.is_some() || fragment.arguments.is_some()).then_some(fragment)
    }
}

impl ToolCallExtractor for HermesToolExtractor {
    fn extract_tool_calls(&self, output: &str) -> ExtractedToolCalls {
        let mut calls = Vec::new();

        for cap in TOOL_CALL_REGEX.captures_iter(output) {
            let json_str = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            match serde_json::from_str::<HermesToolCallJson>(json_str) {
                Ok(parsed) => {
                    let arguments = match &parsed.arguments {
                        serde_json::Value::Null => "{}".to_string(),
                        other => other.to_string(),
                    };
                    calls.push(ToolCall::function(parsed.name, arguments));
                }
                Err(e) => {
                    tracing::warn!("Failed to parse tool call JSON: {}: {}", json_str, e);
                }
            }
        }

        if calls.is_empty() {
            return ExtractedToolCalls {
                tools_called: false,
                tool_calls: Vec::new(),
                content: Some(output.to_string()),
            };
        }

        let content = TOOL_CALL_TAG_REGEX.replace_all(output, "");
        let trimmed = content.trim();
        ExtractedToolCalls {
            tools_called: true,
            tool_calls: calls,
            content: (!trimmed.is_empty()).then(|| trimmed.to_string()),
        }
    }

    fn extract_tool_calls_streaming(&mut self, step: &StepInput<'_>) -> Option<DeltaMessage> {
        let text = step.current_text;
        let split = split_output(text);

        let mut delta = DeltaMessage::default();
        if split.content_end > self.content_sent {
            delta.content = Some(text[self.content_sent..split.content_end].to_string());
            self.content_sent = split.content_end;
        }
        for (index, body) in split.bodies.iter().enumerate() {
            if let Some(fragment) = self.advance_tool(index, body) {
                delta.tool_calls.push(fragment);
            }
        }
        if let Some((start, end)) = split.trailing {
            let from = start.max(self.trailing_sent);
            if end > from {
                let tail = &text[from..end];
                match delta.content.as_mut() {
                    Some(content) => content.push_str(tail),
                    None => delta.content = Some(tail.to_string()),
                }
                self.trailing_sent = end;
            }
        }

        (!delta.is_empty()).then_some(delta)
    }

    fn prev_tool_calls(&self) -> &[ParsedToolCall] {
        // Bodies whose name has not arrived yet are not tool calls yet.
        let named = self.name_sent.iter().take_while(|&&sent| sent).count();
        &self.prev_tool_calls[..named]
    }

    fn streamed_args(&self) -> &[String] {
        &self.streamed_args
    }
}
