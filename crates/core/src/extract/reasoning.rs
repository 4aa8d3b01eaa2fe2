//! `<think>...</think>` reasoning extraction.
//!
//! The markers are single tokens, so streaming decisions are made on token
//! ids and the text is only split where a marker token sits inside a
//! multi-token delta. The model may omit the start marker; everything before
//! the end marker is then reasoning.

use super::{DeltaMessage, ReasoningExtractor, ReasoningOutput, StepInput};

const START_TAG: &str = "<think>";
const END_TAG: &str = "</think>";

#[derive(Debug, Clone)]
pub struct ThinkReasoningExtractor {
    start_token_id: u32,
    end_token_id: u32,
}

impl ThinkReasoningExtractor {
    pub fn new(start_token_id: u32, end_token_id: u32) -> Self {
        Self {
            start_token_id,
            end_token_id,
        }
    }

    fn non_empty(s: &str) -> Option<String> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

fn some_text(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl ReasoningExtractor for ThinkReasoningExtractor {
    fn extract_reasoning(&self, output: &str) -> ReasoningOutput {
        let body = match output.find(START_TAG) {
            Some(start) => &output[start + START_TAG.len()..],
            None => output,
        };
        match body.find(END_TAG) {
            Some(end) => ReasoningOutput {
                reasoning: Self::non_empty(&body[..end]),
                content: Self::non_empty(&body[end + END_TAG.len()..]),
            },
            // Start tag but no end tag: still thinking.
            None if body.len() != output.len() => ReasoningOutput {
                reasoning: Self::non_empty(body),
                content: None,
            },
            None => ReasoningOutput {
                reasoning: None,
                content: Self::non_empty(output),
            },
        }
    }

    fn extract_reasoning_streaming(&mut self, step: &StepInput<'_>) -> Option<DeltaMessage> {
        let ids = step.delta_token_ids;
        if ids.len() == 1 && (ids[0] == self.start_token_id || ids[0] == self.end_token_id) {
            return None;
        }
        if step.previous_token_ids.contains(&self.end_token_id) {
            return some_text(step.delta_text).map(DeltaMessage::content);
        }

        let text = if ids.contains(&self.start_token_id) {
            step.delta_text.replacen(START_TAG, "", 1)
        } else {
            step.delta_text.to_string()
        };

        if ids.contains(&self.end_token_id) {
            let (reasoning, content) = match text.find(END_TAG) {
                Some(pos) => (&text[..pos], &text[pos + END_TAG.len()..]),
                None => (text.as_str(), ""),
            };
            let delta = DeltaMessage {
                reasoning_content: some_text(reasoning),
                content: some_text(content),
                ..Default::default()
            };
            return (!delta.is_empty()).then_some(delta);
        }

        some_text(&text).map(DeltaMessage::reasoning)
    }

    fn is_reasoning_end(&self, token_ids: &[u32]) -> bool {
        token_ids.contains(&self.end_token_id)
    }

    fn extract_content_ids(&self, token_ids: &[u32]) -> Vec<u32> {
        match token_ids.iter().rposition(|&t| t == self.end_token_id) {
            Some(pos) => token_ids[pos + 1..].to_vec(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u32 = 100;
    const END: u32 = 101;

    fn extractor() -> ThinkReasoningExtractor {
        ThinkReasoningExtractor::new(START, END)
    }

    fn step<'a>(prev_ids: &'a [u32], delta_text: &'a str, delta_ids: &'a [u32]) -> StepInput<'a> {
        StepInput {
            previous_text: "",
            current_text: delta_text,
            delta_text,
            previous_token_ids: prev_ids,
            current_token_ids: delta_ids,
            delta_token_ids: delta_ids,
        }
    }

    #[test]
    fn full_extraction_splits_on_tags() {
        let out = extractor().extract_reasoning("<think>Let me work this out...</think>The answer is 42.");
        assert_eq!(out.reasoning.as_deref(), Some("Let me work this out..."));
        assert_eq!(out.content.as_deref(), Some("The answer is 42."));
    }

    #[test]
    fn full_extraction_without_start_tag() {
        let out = extractor().extract_reasoning("thinking</think>answer");
        assert_eq!(out.reasoning.as_deref(), Some("thinking"));
        assert_eq!(out.content.as_deref(), Some("answer"));
    }

    #[test]
    fn full_extraction_unterminated_and_plain() {
        let out = extractor().extract_reasoning("<think>still going");
        assert_eq!(out.reasoning.as_deref(), Some("still going"));
        assert_eq!(out.content, None);

        let out = extractor().extract_reasoning("just an answer");
        assert_eq!(out.reasoning, None);
        assert_eq!(out.content.as_deref(), Some("just an answer"));
    }

    #[test]
    fn lone_marker_tokens_are_suppressed() {
        let mut ex = extractor();
        assert!(ex.extract_reasoning_streaming(&step(&[], "<think>", &[START])).is_none());
        assert!(ex.extract_reasoning_streaming(&step(&[START, 5], "</think>", &[END])).is_none());
    }

    #[test]
    fn streaming_reasoning_then_split_then_content() {
        let mut ex = extractor();
        let d = ex.extract_reasoning_streaming(&step(&[START], "hmm", &[5])).unwrap();
        assert_eq!(d.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(d.content, None);

        let d = ex
            .extract_reasoning_streaming(&step(&[START, 5], " ok</think>Hi", &[6, END, 7]))
            .unwrap();
        assert_eq!(d.reasoning_content.as_deref(), Some(" ok"));
        assert_eq!(d.content.as_deref(), Some("Hi"));

        let d = ex
            .extract_reasoning_streaming(&step(&[START, 5, 6, END, 7], " there", &[8]))
            .unwrap();
        assert_eq!(d.content.as_deref(), Some(" there"));
        assert_eq!(d.reasoning_content, None);
    }

    #[test]
    fn content_ids_follow_the_last_end_marker() {
        let ex = extractor();
        assert!(ex.is_reasoning_end(&[1, END, 2]));
        assert!(!ex.is_reasoning_end(&[1, 2]));
        assert_eq!(ex.extract_content_ids(&[1, END, 2, 3]), vec![2, 3]);
        assert!(ex.extract_content_ids(&[1, END]).is_empty());
        assert!(ex.extract_content_ids(&[1, 2]).is_empty());
    }
}
