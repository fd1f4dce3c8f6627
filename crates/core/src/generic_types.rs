use crate::{
    codec::AudioChunk,
    tools::{ToolCall, ToolResponse},
    transcript::Speaker,
};

/// A function the remote model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Generic configuration for initializing a real-time session with any provider.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    pub instructions: String,
    /// Name of the prebuilt voice to speak with.
    pub voice: String,
    pub tools: Vec<FunctionDeclaration>,
    pub input_sample_rate: u32,
}

/// Events the session sends towards the provider.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A captured PCM16 chunk.
    Audio(AudioChunk),
    /// Answers to earlier tool calls.
    ToolResponses(Vec<ToolResponse>),
    /// Flush what is queued and close the connection.
    Close,
}

/// Generic events that any real-time provider can emit back to the application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A chunk of spoken audio from the AI (base64 encoded PCM16).
    Audio(String),
    /// Transcribed speech, from either side of the conversation.
    Transcript { speaker: Speaker, text: String },
    /// One or more function calls the client must answer.
    ToolCalls(Vec<ToolCall>),
    /// The user started talking over the AI.
    Interrupted,
    /// The AI has finished its turn.
    TurnComplete,
    /// The provider no longer needs answers for these call ids.
    ToolCallCancellation(Vec<String>),
    /// The provider will drop the connection soon.
    GoingAway,
    /// The connection was closed.
    Closed { reason: Option<String> },
    /// An error from the provider.
    Error(String),
}
