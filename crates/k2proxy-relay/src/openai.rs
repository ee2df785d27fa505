//! OpenAI Chat Completions wire types.
//!
//! The request side tolerates the full client surface (string or multi-part
//! content, both tool_choice shapes, arbitrary passthrough fields); the
//! response side emits exactly the subset the proxy produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── client request ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDecl>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    /// Everything else (temperature, top_p, max_tokens, stop, ...) is
    /// forwarded to the upstream body verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageRef },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

/// Reduce message content to one text string. Text parts concatenate in
/// order; image parts become a `[image: <uri>]` placeholder so the upstream
/// still receives a well-formed prompt.
pub fn flatten_content(content: &Option<MessageContent>) -> String {
    match content {
        None => String::new(),
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => out.push_str(text),
                    ContentPart::ImageUrl { image_url } => {
                        out.push_str(&format!("[image: {}]", image_url.url));
                    }
                    ContentPart::Unknown => out.push_str("[attachment]"),
                }
            }
            out
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDecl {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: ToolFunctionDecl,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolFunctionDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// `tool_choice` as it arrives on the wire: a mode string, the OpenAI
/// `{type:"function", function:{name}}` object, or a bare `{name}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named { function: NamedFunction },
    Bare { name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedFunction {
    pub name: String,
}

/// Normalized tool-choice policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPolicy {
    Auto,
    None,
    Required,
    Named(String),
}

impl ToolPolicy {
    /// Normalize the wire shape; absent tool_choice means `auto` when tools
    /// are declared. Unknown mode strings are a client error.
    pub fn from_choice(choice: &Option<ToolChoice>) -> std::result::Result<Self, String> {
        match choice {
            None => Ok(ToolPolicy::Auto),
            Some(ToolChoice::Mode(mode)) => match mode.as_str() {
                "auto" => Ok(ToolPolicy::Auto),
                "none" => Ok(ToolPolicy::None),
                "required" => Ok(ToolPolicy::Required),
                other => Err(format!("unknown tool_choice mode: {other}")),
            },
            Some(ToolChoice::Named { function }) => Ok(ToolPolicy::Named(function.name.clone())),
            Some(ToolChoice::Bare { name }) => Ok(ToolPolicy::Named(name.clone())),
        }
    }
}

// ── emitted completion ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallOut {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionCallOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallOut {
    pub name: String,
    /// Always a JSON-serialized string, never an object.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ── emitted stream chunks ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionCallOut,
}
