pub mod base;
pub mod errors;
pub mod openai;

pub use base::{
    ChatMessage, ChatRequest, CompletionProvider, CompletionResponse, FinishReason, RetryConfig,
    ToolCallRequest, ToolSpec, Usage,
};
pub use openai::OpenAiProvider;
