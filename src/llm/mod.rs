// LLM abstraction layer

pub mod openai;
pub mod provider;

pub use openai::OpenAICompatAdapter;
pub use provider::*;
pub use crate::types::{LLMMessage, LLMRequest, LLMResponse, TokenUsage};
