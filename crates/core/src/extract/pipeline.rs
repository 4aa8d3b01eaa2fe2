//! Per-choice extraction pipeline.
//!
//! The variant is chosen once per request ([`PipelineKind`]) and every
//! choice gets its own [`ChoicePipeline`] with fresh extractor instances.
//! Each step is dispatched through a single match on the variant.

use super::{
    DeltaMessage, DeltaToolCall, ReasoningExtractor, ReasoningExtractorFactory,
    RequiredToolStreamer, StepInput, ToolCallExtractor, ToolExtractorFactory,
};
use crate::error::ServeError;
use crate::protocol::{generate_tool_call_id, ChatRequest};

/// Which extraction runs for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineKind {
    Plain,
    ReasoningOnly,
    /// Auto tool choice through the tool-call extractor.
    ToolOnly,
    ReasoningThenTool,
    /// Every content delta is an argument fragment of the forced function.
    NamedTool { name: String, reasoning: bool },
    RequiredTool { reasoning: bool },
}

impl PipelineKind {
    pub fn uses_reasoning(&self) -> bool {
        match self {
            Self::ReasoningOnly | Self::ReasoningThenTool => true,
            Self::NamedTool { reasoning, .. } | Self::RequiredTool { reasoning } => *reasoning,
            Self::Plain | Self::ToolOnly => false,
        }
    }

    /// Whether the auto tool-call extractor is in play.
    pub fn uses_tool_extractor(&self) -> bool {
        matches!(self, Self::ToolOnly | Self::ReasoningThenTool)
    }
}

/// Outcome of feeding one step to the reasoning stage.
enum GateStep {
    Reasoning(Option<DeltaMessage>),
    /// The end marker arrived this step. `delta` holds only reasoning; the
    /// regular content that followed the marker is handed over separately.
    Ended {
        delta: Option<DeltaMessage>,
        leftover_text: String,
        leftover_ids: Vec<u32>,
    },
    Passed,
}

struct ReasoningGate {
    extractor: Box<dyn ReasoningExtractor>,
    ended: bool,
}

impl ReasoningGate {
    fn new(extractor: Box<dyn ReasoningExtractor>) -> Self {
        Self {
            extractor,
            ended: false,
        }
    }

    fn step(&mut self, input: &StepInput<'_>) -> GateStep {
        if self.ended {
            return GateStep::Passed;
        }
        let mut delta = self.extractor.extract_reasoning_streaming(input);
        if !self.extractor.is_reasoning_end(input.delta_token_ids) {
            return GateStep::Reasoning(delta);
        }
        self.ended = true;
        let leftover_text = delta
            .as_mut()
            .and_then(|d| d.content.take())
            .unwrap_or_default();
        GateStep::Ended {
            delta: delta.filter(|d| !d.is_empty()),
            leftover_text,
            leftover_ids: self.extractor.extract_content_ids(input.delta_token_ids),
        }
    }
}

fn without_content(delta: Option<DeltaMessage>) -> Option<DeltaMessage> {
    delta
        .map(|mut d| {
            d.content = None;
            d
        })
        .filter(|d| !d.is_empty())
}

fn merge(base: Option<DeltaMessage>, more: Option<DeltaMessage>) -> Option<DeltaMessage> {
    match (base, more) {
        (Some(mut b), Some(m)) => {
            b.merge(m);
            Some(b)
        }
        (b, m) => b.or(m),
    }
}

enum Variant {
    Plain,
    ReasoningOnly {
        gate: ReasoningGate,
    },
    ToolOnly {
        tools: Box<dyn ToolCallExtractor>,
    },
    ReasoningThenTool {
        gate: ReasoningGate,
        tools: Box<dyn ToolCallExtractor>,
    },
    NamedTool {
        gate: Option<ReasoningGate>,
        name: String,
        name_sent: bool,
    },
    RequiredTool {
        gate: Option<ReasoningGate>,
        streamer: RequiredToolStreamer,
    },
}

/// Extraction state for one choice of a streaming request.
pub struct ChoicePipeline {
    variant: Variant,
    /// Text the active stage has seen so far.
    text: String,
    token_ids: Vec<u32>,
}

impl ChoicePipeline {
    /// Create the pipeline for one choice, instantiating its extractors.
    pub fn build(
        kind: &PipelineKind,
        request: &ChatRequest,
        reasoning: Option<&dyn ReasoningExtractorFactory>,
        tools: Option<&dyn ToolExtractorFactory>,
    ) -> Result<Self, ServeError> {
        let make_gate = || -> Result<ReasoningGate, ServeError> {
            let factory = reasoning.ok_or_else(|| {
                ServeError::Internal("reasoning pipeline without a reasoning extractor".into())
            })?;
            factory
                .create(request)
                .map(ReasoningGate::new)
                .map_err(|e| ServeError::ExtractorSetup {
                    kind: "reasoning",
                    message: e.to_string(),
                })
        };
        let make_tools = || -> Result<Box<dyn ToolCallExtractor>, ServeError> {
            let factory = tools.ok_or_else(|| {
                ServeError::Internal("tool pipeline without a tool-call extractor".into())
            })?;
            factory.create(request).map_err(|e| ServeError::ExtractorSetup {
                kind: "tool",
                message: e.to_string(),
            })
        };

        let variant = match kind {
            PipelineKind::Plain => Variant::Plain,
            PipelineKind::ReasoningOnly => Variant::ReasoningOnly { gate: make_gate()? },
            PipelineKind::ToolOnly => Variant::ToolOnly {
                tools: make_tools()?,
            },
            PipelineKind::ReasoningThenTool => Variant::ReasoningThenTool {
                gate: make_gate()?,
                tools: make_tools()?,
            },
            PipelineKind::NamedTool { name, reasoning } => Variant::NamedTool {
                gate: if *reasoning { Some(make_gate()?) } else { None },
                name: name.clone(),
                name_sent: false,
            },
            PipelineKind::RequiredTool { reasoning } => Variant::RequiredTool {
                gate: if *reasoning { Some(make_gate()?) } else { None },
                streamer: RequiredToolStreamer::new(),
            },
        };
        Ok(Self {
            variant,
            text: String::new(),
            token_ids: Vec::new(),
        })
    }

    /// The auto tool-call extractor, when this pipeline runs one.
    pub fn tool_extractor(&self) -> Option<&dyn ToolCallExtractor> {
        match &self.variant {
            Variant::ToolOnly { tools } | Variant::ReasoningThenTool { tools, .. } => {
                Some(tools.as_ref())
            }
            _ => None,
        }
    }

    /// Whether the auto tool-call path has produced at least one call.
    pub fn auto_tools_called(&self) -> bool {
        self.tool_extractor()
            .is_some_and(|t| !t.prev_tool_calls().is_empty())
    }

    /// Run one generation step. `None` means nothing to emit.
    pub fn step(&mut self, delta_text: &str, delta_token_ids: &[u32]) -> Option<DeltaMessage> {
        let previous_text = std::mem::take(&mut self.text);
        let previous_ids = std::mem::take(&mut self.token_ids);
        let mut current_text = previous_text.clone();
        current_text.push_str(delta_text);
        let mut current_ids = previous_ids.clone();
        current_ids.extend_from_slice(delta_token_ids);

        let input = StepInput {
            previous_text: &previous_text,
            current_text: &current_text,
            delta_text,
            previous_token_ids: &previous_ids,
            current_token_ids: &current_ids,
            delta_token_ids,
        };

        // Set when reasoning ends: the leftover becomes the new baseline.
        let mut rebase: Option<(String, Vec<u32>)> = None;

        let out = match &mut self.variant {
            Variant::Plain => Some(DeltaMessage::content(delta_text)),

            Variant::ReasoningOnly { gate } => match gate.step(&input) {
                GateStep::Reasoning(delta) => delta,
                GateStep::Ended {
                    delta,
                    leftover_text,
                    leftover_ids,
                } => {
                    let content = (!leftover_text.is_empty())
                        .then(|| DeltaMessage::content(leftover_text.clone()));
                    rebase = Some((leftover_text, leftover_ids));
                    merge(delta, content)
                }
                GateStep::Passed => {
                    (!delta_text.is_empty()).then(|| DeltaMessage::content(delta_text))
                }
            },

            Variant::ToolOnly { tools } => tools.extract_tool_calls_streaming(&input),

            Variant::ReasoningThenTool { gate, tools } => match gate.step(&input) {
                GateStep::Reasoning(delta) => delta,
                GateStep::Ended {
                    delta,
                    leftover_text,
                    leftover_ids,
                } => {
                    // Nothing reached the tool stage yet: the leftover is its
                    // first delta and its whole history.
                    let handoff = StepInput {
                        previous_text: "",
                        current_text: &leftover_text,
                        delta_text: &leftover_text,
                        previous_token_ids: &[],
                        current_token_ids: &leftover_ids,
                        delta_token_ids: &leftover_ids,
                    };
                    let tool_delta = tools.extract_tool_calls_streaming(&handoff);
                    rebase = Some((leftover_text, leftover_ids));
                    merge(delta, tool_delta)
                }
                GateStep::Passed => tools.extract_tool_calls_streaming(&input),
            },

            Variant::NamedTool {
                gate,
                name,
                name_sent,
            } => {
                let mut fragment = |args: &str| -> Option<DeltaMessage> {
                    let call = if !*name_sent {
                        *name_sent = true;
                        DeltaToolCall {
                            index: 0,
                            id: Some(generate_tool_call_id()),
                            name: Some(name.clone()),
                            arguments: Some(args.to_string()),
                        }
                    } else if args.is_empty() {
                        return None;
                    } else {
                        DeltaToolCall::arguments(0, args)
                    };
                    Some(DeltaMessage::tool_calls(vec![call]))
                };
                match gate.as_mut().map(|g| g.step(&input)) {
                    Some(GateStep::Reasoning(delta)) => without_content(delta),
                    Some(GateStep::Ended {
                        delta,
                        leftover_text,
                        leftover_ids,
                    }) => {
                        let args = fragment(&leftover_text);
                        rebase = Some((leftover_text, leftover_ids));
                        merge(without_content(delta), args)
                    }
                    None | Some(GateStep::Passed) => fragment(delta_text),
                }
            }

            Variant::RequiredTool { gate, streamer } => {
                match gate.as_mut().map(|g| g.step(&input)) {
                    Some(GateStep::Reasoning(delta)) => without_content(delta),
                    Some(GateStep::Ended {
                        delta,
                        leftover_text,
                        leftover_ids,
                    }) => {
                        let calls = streamer.step("", &leftover_text, &leftover_text);
                        rebase = Some((leftover_text, leftover_ids));
                        merge(without_content(delta), calls)
                    }
                    None | Some(GateStep::Passed) => {
                        streamer.step(&previous_text, &current_text, delta_text)
                    }
                }
            }
        };

        match rebase {
            Some((text, ids)) => {
                self.text = text;
                self.token_ids = ids;
            }
            None => {
                self.text = current_text;
                self.token_ids = current_ids;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{HermesToolExtractor, ThinkReasoningExtractor};

    const THINK_START: u32 = 100;
    const THINK_END: u32 = 101;

    fn reasoning_factory(_: &ChatRequest) -> anyhow::Result<Box<dyn ReasoningExtractor>> {
        Ok(Box::new(ThinkReasoningExtractor::new(THINK_START, THINK_END)))
    }

    fn tool_factory(_: &ChatRequest) -> anyhow::Result<Box<dyn ToolCallExtractor>> {
        Ok(Box::new(HermesToolExtractor::new()))
    }

    fn failing_tool_factory(_: &ChatRequest) -> anyhow::Result<Box<dyn ToolCallExtractor>> {
        anyhow::bail!("tokenizer lacks tool tokens")
    }

    fn pipeline(kind: PipelineKind) -> ChoicePipeline {
        ChoicePipeline::build(
            &kind,
            &ChatRequest::default(),
            Some(&reasoning_factory),
            Some(&tool_factory),
        )
        .unwrap()
    }

    #[test]
    fn plain_passes_text_through_even_when_empty() {
        let mut p = pipeline(PipelineKind::Plain);
        assert_eq!(p.step("Hello", &[1]).unwrap().content.as_deref(), Some("Hello"));
        assert_eq!(p.step("", &[2]).unwrap().content.as_deref(), Some(""));
    }

    #[test]
    fn reasoning_only_rebases_on_leftover_content() {
        let mut p = pipeline(PipelineKind::ReasoningOnly);
        let d = p.step("<think>", &[THINK_START]);
        assert!(d.is_none());
        let d = p.step("plan", &[5]).unwrap();
        assert_eq!(d.reasoning_content.as_deref(), Some("plan"));

        let d = p.step("</think>The", &[THINK_END, 6]).unwrap();
        assert_eq!(d.reasoning_content, None);
        assert_eq!(d.content.as_deref(), Some("The"));
        assert_eq!(p.text, "The");
        assert_eq!(p.token_ids, vec![6]);

        let d = p.step(" end", &[7]).unwrap();
        assert_eq!(d.content.as_deref(), Some(" end"));
        assert_eq!(p.text, "The end");
    }

    #[test]
    fn reasoning_then_tool_hands_leftover_to_tool_stage_once() {
        let mut p = pipeline(PipelineKind::ReasoningThenTool);
        p.step("<think>", &[THINK_START]);
        let d = p.step("let me call", &[5]).unwrap();
        assert_eq!(d.reasoning_content.as_deref(), Some("let me call"));

        // Step k: end marker plus leftover that opens a tool call.
        let d = p
            .step("</think>Ok <tool_call>{\"name\": \"f\"", &[THINK_END, 6, 7, 8])
            .unwrap();
        assert_eq!(d.reasoning_content, None);
        assert_eq!(d.content.as_deref(), Some("Ok "));
        assert_eq!(d.tool_calls.len(), 1);
        assert_eq!(d.tool_calls[0].name.as_deref(), Some("f"));

        // Step k+1 must not repeat the leftover.
        let d = p.step(", \"arguments\": {\"x\": 1}}", &[9]).unwrap();
        assert_eq!(d.content, None);
        assert!(d.tool_calls.iter().all(|c| c.name.is_none()));
        let args: String = d
            .tool_calls
            .iter()
            .filter_map(|c| c.arguments.as_deref())
            .collect();
        assert_eq!(args, r#"{"x":1}"#);
        assert!(p.auto_tools_called());
    }

    #[test]
    fn tool_only_without_calls_streams_content() {
        let mut p = pipeline(PipelineKind::ToolOnly);
        let d = p.step("Hi there", &[1, 2]).unwrap();
        assert_eq!(d.content.as_deref(), Some("Hi there"));
        assert!(!p.auto_tools_called());
        assert!(p.tool_extractor().is_some());
    }

    #[test]
    fn named_tool_sends_name_once_and_raw_arguments() {
        let mut p = pipeline(PipelineKind::NamedTool {
            name: "get_weather".into(),
            reasoning: false,
        });
        let d = p.step("{\"city\"", &[1]).unwrap();
        assert_eq!(d.tool_calls[0].name.as_deref(), Some("get_weather"));
        assert!(d.tool_calls[0].id.is_some());
        assert_eq!(d.tool_calls[0].arguments.as_deref(), Some("{\"city\""));

        let d = p.step(": \"Paris\"}", &[2]).unwrap();
        assert_eq!(d.tool_calls[0].name, None);
        assert_eq!(d.tool_calls[0].arguments.as_deref(), Some(": \"Paris\"}"));

        assert!(p.step("", &[3]).is_none());
        assert!(p.tool_extractor().is_none());
    }

    #[test]
    fn named_tool_discards_content_during_reasoning() {
        let mut p = pipeline(PipelineKind::NamedTool {
            name: "f".into(),
            reasoning: true,
        });
        let d = p.step("<think>hmm", &[THINK_START, 5]).unwrap();
        assert_eq!(d.reasoning_content.as_deref(), Some("hmm"));
        assert!(d.tool_calls.is_empty());

        let d = p.step("</think>{\"a\":", &[THINK_END, 6]).unwrap();
        assert_eq!(d.content, None);
        assert_eq!(d.tool_calls[0].name.as_deref(), Some("f"));
        assert_eq!(d.tool_calls[0].arguments.as_deref(), Some("{\"a\":"));

        let d = p.step(" 1}", &[7]).unwrap();
        assert_eq!(d.tool_calls[0].arguments.as_deref(), Some(" 1}"));
    }

    #[test]
    fn required_tool_streams_through_streamer() {
        let mut p = pipeline(PipelineKind::RequiredTool { reasoning: false });
        assert!(p.step("[{\"name\": \"f\", ", &[1]).is_none());
        let d = p.step("\"parameters\": {\"a\": ", &[2]).unwrap();
        assert_eq!(d.tool_calls[0].name.as_deref(), Some("f"));
    }

    #[test]
    fn extractor_setup_failure_is_reported() {
        let err = ChoicePipeline::build(
            &PipelineKind::ToolOnly,
            &ChatRequest::default(),
            None,
            Some(&failing_tool_factory),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServeError::ExtractorSetup { kind: "tool", .. }));
    }
}
