use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

// ── Text generation ───────────────────────────────────────────────────────────

/// One user turn headed for the text provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub instruction: String,
    pub prior_document: Option<String>,
}

impl GenerationRequest {
    /// Trims the instruction and rejects it when nothing is left.
    pub fn new(
        instruction: impl AsRef<str>,
        prior_document: Option<String>,
    ) -> Result<Self, AppError> {
        let instruction = instruction.as_ref().trim();
        if instruction.is_empty() {
            return Err(AppError::invalid_input("instruction cannot be empty"));
        }
        Ok(Self {
            instruction: instruction.to_string(),
            prior_document,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(String),
    Completed(String),
    Failed(String),
}

impl StreamState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamState::Streaming(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub text: String,
    pub elapsed_ms: u64,
}

// ── Extraction / iteration ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedDocument {
    pub raw: String,
    pub html: String,
    pub is_valid: bool,
}

/// A committed version as handed to the preview surface.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentVersion {
    pub version: usize,
    pub document: ExtractedDocument,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub version: usize,
    pub length: usize,
    pub committed_at: DateTime<Utc>,
}

impl From<&DocumentVersion> for VersionSummary {
    fn from(v: &DocumentVersion) -> Self {
        Self {
            version: v.version,
            length: v.document.html.len(),
            committed_at: v.committed_at,
        }
    }
}

// ── Image generation ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRequest {
    /// Sketch as a `data:` URI.
    pub sketch: String,
    #[serde(default)]
    pub text_hint: String,
    #[serde(default)]
    pub image_size: Option<u32>,
}

impl ImageRequest {
    pub fn from_png(png: &[u8], text_hint: impl Into<String>) -> Self {
        Self {
            sketch: crate::provider::image::data_uri("image/png", png),
            text_hint: text_hint.into(),
            image_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedImage {
    pub url: String,
}

// ── Voice conversation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Listening,
    Speaking,
}

// ── Host API ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub instruction: String,
}

#[derive(Debug, Serialize)]
pub struct IterationResponse {
    pub version: usize,
    pub elapsed_ms: u64,
    pub length: usize,
}

/// Text commands accepted on the voice socket.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceCommand {
    /// Turn the conversation so far into a generation request.
    Finalize,
}

/// Events pushed over the streaming sockets.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart { instruction: String },
    StreamChunk { content: String },
    StreamEnd { version: usize, elapsed_ms: u64 },
    VoiceState {
        status: ConnectionStatus,
        mode: AgentMode,
        transcript: Vec<ConversationTurn>,
    },
    Error { kind: String, message: String },
}

impl From<&AppError> for WsEvent {
    fn from(e: &AppError) -> Self {
        WsEvent::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}
