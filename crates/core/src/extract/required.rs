//! Streaming for `tool_choice: "required"`.
//!
//! The model is constrained to emit a JSON list of `{"name", "parameters"}`
//! objects. Each tool's name is surfaced once, together with the parameters
//! text seen so far; later steps forward the parameters text with the
//! closing braces of the wrapping object and list filtered out.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::json::parse_partial;
use super::{DeltaMessage, DeltaToolCall};
use crate::protocol::{generate_tool_call_id, ToolCall};

static PARAMETERS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#".*"parameters":\s*(.*)"#)
        .expect("PARAMETERS_REGEX pattern is invalid - this is a build-time error")
});

fn bracket_level(s: &str) -> i64 {
    s.chars().fold(0, |level, c| match c {
        '{' => level + 1,
        '}' => level - 1,
        _ => level,
    })
}

/// Drop text that belongs to the wrapping `{"name", "parameters"}` object.
///
/// Returns the filtered text and whether this delta closed the current tool.
fn filter_delta_text(delta_text: &str, previous_text: &str) -> (String, bool) {
    let mut level = bracket_level(previous_text);
    let mut filtered = String::new();
    let mut passed_zero = false;
    for c in delta_text.chars() {
        match c {
            '{' => {
                level += 1;
                passed_zero = level == 0;
            }
            '}' => {
                level -= 1;
                passed_zero = level == 0;
            }
            _ => {}
        }
        if level != 0 {
            filtered.push(c);
        } else if c == ',' {
            break;
        }
    }
    (filtered, passed_zero)
}

/// Per-choice state for required-mode streaming.
#[derive(Debug, Default)]
pub struct RequiredToolStreamer {
    function_name_returned: bool,
}

impl RequiredToolStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(
        &mut self,
        previous_text: &str,
        current_text: &str,
        delta_text: &str,
    ) -> Option<DeltaMessage> {
        let parsed = parse_partial(current_text)?;
        let calls = parsed.as_array().filter(|a| !a.is_empty())?;
        let mut index = calls.len() - 1;
        let (_, finishes_previous) = filter_delta_text(delta_text, previous_text);

        let mut current = &calls[index];
        let has = |call: &Value, key: &str| call.get(key).is_some();
        if !finishes_previous && !(has(current, "name") && has(current, "parameters")) {
            return None;
        }

        if !self.function_name_returned {
            let arguments = PARAMETERS_REGEX
                .captures(current_text)
                .and_then(|c| c.get(1))
                .map_or("", |m| m.as_str());
            let (arguments, _) = filter_delta_text(arguments, previous_text);
            // The delta closed one tool and already opened the next.
            if finishes_previous && !has(current, "parameters") && index > 0 {
                index -= 1;
                current = &calls[index];
            }
            let name = current.get("name")?.as_str()?.to_string();
            self.function_name_returned = !finishes_previous;
            return Some(DeltaMessage::tool_calls(vec![DeltaToolCall {
                index,
                id: Some(generate_tool_call_id()),
                name: Some(name),
                arguments: Some(arguments),
            }]));
        }

        let (filtered, _) = filter_delta_text(delta_text, previous_text);
        if finishes_previous {
            self.function_name_returned = false;
        }
        (!filtered.is_empty())
            .then(|| DeltaMessage::tool_calls(vec![DeltaToolCall::arguments(index, filtered)]))
    }
}

#[derive(Debug, Deserialize)]
struct RequiredToolCallJson {
    name: String,
    #[serde(default)]
    parameters: Value,
}

/// Parse a complete required-mode output into tool calls.
pub fn parse_required_tool_calls(output: &str) -> Result<Vec<ToolCall>, serde_json::Error> {
    let calls: Vec<RequiredToolCallJson> = serde_json::from_str(output.trim())?;
    Ok(calls
        .into_iter()
        .map(|c| {
            let arguments = match c.parameters {
                Value::Null => "{}".to_string(),
                other => other.to_string(),
            };
            ToolCall::function(c.name, arguments)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<DeltaMessage> {
        let mut streamer = RequiredToolStreamer::new();
        let mut text = String::new();
        let mut out = Vec::new();
        for chunk in chunks {
            let previous = text.clone();
            text.push_str(chunk);
            if let Some(d) = streamer.step(&previous, &text, chunk) {
                out.push(d);
            }
        }
        out
    }

    #[test]
    fn filter_stops_at_wrapper_close() {
        let (text, closed) = filter_delta_text("1}}, {", r#"[{"name":"f","parameters":{"a":"#);
        assert_eq!(text, "1}");
        assert!(closed);

        let (text, closed) = filter_delta_text("\"x\"", r#"[{"name":"f","parameters":{"a":"#);
        assert_eq!(text, "\"x\"");
        assert!(!closed);
    }

    #[test]
    fn name_is_sent_once_and_parameters_follow() {
        let deltas = run(&[
            "[{\"name\": \"get_",
            "weather\", \"parameters\": ",
            "{\"city\": ",
            "\"Paris\"}",
            "}]",
        ]);

        let calls: Vec<_> = deltas.iter().flat_map(|d| &d.tool_calls).collect();
        let names: Vec<_> = calls.iter().filter_map(|c| c.name.as_deref()).collect();
        assert_eq!(names, vec!["get_weather"]);
        assert!(calls.iter().all(|c| c.index == 0));

        let args: String = calls.iter().filter_map(|c| c.arguments.as_deref()).collect();
        assert_eq!(args, r#"{"city": "Paris"}"#);
    }

    #[test]
    fn second_tool_gets_next_index() {
        let deltas = run(&[
            "[{\"name\": \"a\", \"parameters\": {\"x\": 1}}",
            ", {\"name\": \"b\", \"parameters\": ",
            "{\"y\": 2}}]",
        ]);
        let calls: Vec<_> = deltas.iter().flat_map(|d| &d.tool_calls).collect();
        let named: Vec<_> = calls
            .iter()
            .filter_map(|c| c.name.as_deref().map(|n| (c.index, n)))
            .collect();
        assert_eq!(named, vec![(0, "a"), (1, "b")]);
    }

    #[test]
    fn non_list_output_emits_nothing() {
        assert!(run(&["{\"name\": \"a\""]).is_empty());
    }

    #[test]
    fn full_parse_serializes_parameters() {
        let calls = parse_required_tool_calls(
            r#" [{"name": "a", "parameters": {"x": 1}}, {"name": "b"}] "#,
        )
        .unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
        assert_eq!(calls[1].function.arguments, "{}");
        assert!(parse_required_tool_calls("not json").is_err());
    }
}
