pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use request::{ChatCompletionRequest, StopSequences};
pub use response::{ChatCompletionResponse, Choice, ModelInfo, ModelList, Usage};
pub use stream::{ChatCompletionChunk, Delta, StreamChoice};
pub use types::{
    ChatMessage, ContentPart, FunctionCall, FunctionDefinition, ImageUrl, MessageContent,
    MessageRole, ResponseFormat, ToolCall, ToolDefinition,
};
