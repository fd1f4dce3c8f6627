//! Wire types of the Gemini Live `BidiGenerateContent` protocol, and their
//! mapping to the provider-neutral session events.

use focus_core::{
    generic_types::{ClientEvent, ServerEvent, SessionSetup},
    tools::ToolCall,
    transcript::Speaker,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(BidiGenerateContentRealtimeInput),
    ToolResponse(BidiGenerateContentToolResponse),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    pub output_audio_transcription: AudioTranscriptionConfig,
    pub input_audio_transcription: AudioTranscriptionConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Serializes as `{}`, which switches the feature on.
#[derive(Serialize, Debug, Default)]
pub struct AudioTranscriptionConfig {}

#[derive(Serialize, Debug)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters_json_schema: serde_json::Value,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentRealtimeInput {
    pub audio: Blob,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Serialize, Debug)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<LiveServerContent>,
    pub tool_call: Option<LiveServerToolCall>,
    pub tool_call_cancellation: Option<LiveServerToolCallCancellation>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerContent {
    pub model_turn: Option<ServerContentTurn>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
    pub input_transcription: Option<ServerTranscription>,
    pub output_transcription: Option<ServerTranscription>,
}

#[derive(Deserialize, Debug)]
pub struct ServerContentTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug)]
pub struct ServerTranscription {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Deserialize, Debug)]
pub struct LiveServerToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Builds the opening `setup` message for a session.
pub fn setup_message(model: &str, setup: &SessionSetup) -> ClientMessage {
    let tools = if setup.tools.is_empty() {
        Vec::new()
    } else {
        vec![Tool {
            function_declarations: setup
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters_json_schema: tool.parameters.clone(),
                })
                .collect(),
        }]
    };

    ClientMessage::Setup(BidiGenerateContentSetup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec![ResponseModality::Audio],
            speech_config: (!setup.voice.is_empty()).then(|| SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: setup.voice.clone(),
                    },
                },
            }),
        },
        system_instruction: (!setup.instructions.is_empty()).then(|| Content {
            parts: vec![Part {
                text: setup.instructions.clone(),
            }],
        }),
        tools,
        output_audio_transcription: AudioTranscriptionConfig::default(),
        input_audio_transcription: AudioTranscriptionConfig::default(),
    })
}

/// Maps an outbound session event to its wire message. `Close` has none; it
/// is a WebSocket close frame.
pub fn client_message(event: ClientEvent) -> Option<ClientMessage> {
    match event {
        ClientEvent::Audio(chunk) => Some(ClientMessage::RealtimeInput(
            BidiGenerateContentRealtimeInput {
                audio: Blob {
                    mime_type: chunk.format.mime_type(),
                    data: chunk.data,
                },
            },
        )),
        ClientEvent::ToolResponses(responses) => Some(ClientMessage::ToolResponse(
            BidiGenerateContentToolResponse {
                function_responses: responses
                    .iter()
                    .map(|response| FunctionResponse {
                        id: response.id.clone(),
                        name: response.name.clone(),
                        response: response.payload(),
                    })
                    .collect(),
            },
        )),
        ClientEvent::Close => None,
    }
}

/// Splits one server message into session events, in the order they should
/// be handled.
pub fn server_events(message: ServerMessage) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if content.interrupted == Some(true) {
            events.push(ServerEvent::Interrupted);
        }
        if let Some(transcription) = content.input_transcription {
            events.push(ServerEvent::Transcript {
                speaker: Speaker::User,
                text: transcription.text,
            });
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    events.push(ServerEvent::Audio(blob.data));
                }
            }
        }
        if let Some(transcription) = content.output_transcription {
            events.push(ServerEvent::Transcript {
                speaker: Speaker::Assistant,
                text: transcription.text,
            });
        }
        if content.turn_complete == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(tool_call) = message.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect();
        if !calls.is_empty() {
            events.push(ServerEvent::ToolCalls(calls));
        }
    }
    if let Some(cancellation) = message.tool_call_cancellation {
        events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
    }
    if message.go_away.is_some() {
        events.push(ServerEvent::GoingAway);
    }

    events
}
