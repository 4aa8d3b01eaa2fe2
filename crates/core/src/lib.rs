//! Response assembly for chat completions with interleaved text, reasoning,
//! tool calls and delay-patterned audio tokens.

pub mod aggregate;
pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod protocol;
pub mod request;
pub mod serving;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use aggregate::{FullAggregator, FullResponse};
pub use config::ServingConfig;
pub use error::ServeError;
pub use serving::{ChatServing, ChatStream, StreamingResponse};
pub use stream::{DeltaFrame, StreamAssembler, StreamItem};
