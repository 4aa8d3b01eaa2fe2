//! Configuration persistence for the higgs server.
//!
//! Configuration is loaded with the following priority:
//! 1. Explicit overrides (highest priority)
//! 2. Config file (~/.config/higgs-server/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use higgs_core::audio::AudioCodec;
use higgs_core::config::AudioStreamIds;
use higgs_core::engine::EngineClient;
use higgs_core::extract::{reasoning_factory_by_name, tool_factory_by_name};
use higgs_core::{ChatServing, ServingConfig};

const DEFAULT_TOOL_CALL_PARSER: &str = "hermes";
const DEFAULT_REASONING_PARSER: &str = "think";

/// Persistent server configuration. Every field is optional so a file only
/// needs to name what it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Requests naming any other model are rejected when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_model_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_role: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_auto_tools: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_reasoning: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_prompt_tokens_details: Option<bool>,

    /// Tool-call extractor name, e.g. "hermes".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_parser: Option<String>,

    /// Reasoning extractor name, e.g. "think".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_parser: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub think_start_token_id: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub think_end_token_id: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_bos_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_eos_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_chunk_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_chunk_overlap_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub crossfade_samples: Option<usize>,
}

impl ServerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("higgs-server").join("config.toml"))
    }

    /// Load from the default path. Missing or unreadable files yield defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Overlay every field that `other` sets.
    pub fn merge(&mut self, other: &ServerConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.host, &other.host);
        take(&mut self.port, &other.port);
        take(&mut self.served_model_name, &other.served_model_name);
        take(&mut self.response_role, &other.response_role);
        take(&mut self.enable_auto_tools, &other.enable_auto_tools);
        take(&mut self.enable_reasoning, &other.enable_reasoning);
        take(
            &mut self.enable_prompt_tokens_details,
            &other.enable_prompt_tokens_details,
        );
        take(&mut self.tool_call_parser, &other.tool_call_parser);
        take(&mut self.reasoning_parser, &other.reasoning_parser);
        take(&mut self.think_start_token_id, &other.think_start_token_id);
        take(&mut self.think_end_token_id, &other.think_end_token_id);
        take(&mut self.audio_stream_bos_id, &other.audio_stream_bos_id);
        take(&mut self.audio_stream_eos_id, &other.audio_stream_eos_id);
        take(&mut self.audio_chunk_size, &other.audio_chunk_size);
        take(&mut self.audio_chunk_overlap_size, &other.audio_chunk_overlap_size);
        take(&mut self.crossfade_samples, &other.crossfade_samples);
    }

    pub fn bind_address(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(8000)
        )
    }

    pub fn to_serving_config(&self) -> ServingConfig {
        let defaults = ServingConfig::default();
        let ids = AudioStreamIds::default();
        ServingConfig {
            response_role: self
                .response_role
                .clone()
                .unwrap_or(defaults.response_role),
            enable_auto_tools: self.enable_auto_tools.unwrap_or(defaults.enable_auto_tools),
            enable_reasoning: self.enable_reasoning.unwrap_or(defaults.enable_reasoning),
            enable_prompt_tokens_details: self
                .enable_prompt_tokens_details
                .unwrap_or(defaults.enable_prompt_tokens_details),
            audio_stream: AudioStreamIds {
                bos: self.audio_stream_bos_id.unwrap_or(ids.bos),
                eos: self.audio_stream_eos_id.unwrap_or(ids.eos),
            },
            audio_chunk_size: self.audio_chunk_size.or(defaults.audio_chunk_size),
            audio_chunk_overlap_size: self
                .audio_chunk_overlap_size
                .or(defaults.audio_chunk_overlap_size),
            crossfade_samples: self.crossfade_samples.unwrap_or(defaults.crossfade_samples),
        }
    }

    /// Bind the configured extractors and audio codec to an engine.
    ///
    /// Extractors are only looked up for features that are switched on, so an
    /// unknown parser name fails only when it would be used.
    pub fn build_serving(
        &self,
        engine: Arc<dyn EngineClient>,
        codec: Option<Arc<dyn AudioCodec>>,
    ) -> Result<ChatServing, ConfigError> {
        let serving_config = self.to_serving_config();
        let auto_tools = serving_config.enable_auto_tools;
        let reasoning = serving_config.enable_reasoning;
        let mut serving = ChatServing::new(serving_config, engine);

        // Named and required tool choices use the parser too, so load it whenever it resolves.
        let tool_parser = self
            .tool_call_parser
            .as_deref()
            .unwrap_or(DEFAULT_TOOL_CALL_PARSER);
        match tool_factory_by_name(tool_parser) {
            Some(factory) => serving = serving.with_tools(factory),
            None if auto_tools => {
                return Err(ConfigError::UnknownParser {
                    kind: "tool_call_parser",
                    name: tool_parser.to_string(),
                })
            }
            None => {}
        }

        if reasoning {
            let name = self
                .reasoning_parser
                .as_deref()
                .unwrap_or(DEFAULT_REASONING_PARSER);
            let (start, end) = self
                .think_start_token_id
                .zip(self.think_end_token_id)
                .ok_or(ConfigError::MissingThinkTokens)?;
            let factory = reasoning_factory_by_name(name, start, end).ok_or_else(|| {
                ConfigError::UnknownParser {
                    kind: "reasoning_parser",
                    name: name.to_string(),
                }
            })?;
            serving = serving.with_reasoning(factory);
        }

        if let Some(codec) = codec {
            serving = serving.with_codec(codec);
        }
        Ok(serving)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available")]
    NoConfigDir,
    #[error("unknown {kind}: {name}")]
    UnknownParser { kind: &'static str, name: String },
    #[error("enable_reasoning requires think_start_token_id and think_end_token_id")]
    MissingThinkTokens,
}
