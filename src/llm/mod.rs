pub mod openai;

pub use openai::{ChatModel, LlmClient, LlmConfig, LlmError, LlmMessage, LlmResponse};
