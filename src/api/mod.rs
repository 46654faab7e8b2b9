use serde::{Deserialize, Serialize};

#[derive(Serialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Generation knobs forwarded to the runtime verbatim. Everything is
/// optional; the runtime applies its own defaults for missing fields.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
}

impl GenerationOptions {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_ctx.is_none() && self.num_predict.is_none()
    }
}

#[derive(Serialize, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerationOptions>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ChatChunkMessage {
    #[serde(default)]
    pub content: String,
}

/// One newline-delimited JSON chunk of a streamed chat response. The
/// terminal chunk carries `done == true`; runtime-side failures arrive as
/// an `error` field instead of a message.
#[derive(Deserialize, Debug, Default)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChatChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub modified_at: Option<String>,
    pub size: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub struct TagsResponse {
    pub models: Vec<ModelInfo>,
}

pub mod models;
