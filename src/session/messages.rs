//! Control channel protocol.
//!
//! The server speaks two tagged families over the same socket: pipeline
//! events tagged `event` and connection frames tagged `type`. Inbound
//! parsing joins them untagged; anything that matches neither is a
//! protocol violation, logged and dropped by the caller.

use serde::{Deserialize, Serialize};

/// Outbound pipeline events, tagged `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// One captured audio frame, base64 PCM16
    AudioData {
        session_id: String,
        audio_data: String,
        is_final: bool,
    },
    StartListening {
        session_id: String,
    },
    TriggerLlm {
        session_id: String,
        final_transcript: String,
    },
    GreetingRequest {
        session_id: String,
    },
}

/// Outbound connection frames, tagged `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
}

/// Everything the client sends.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundMessage {
    Event(ClientEvent),
    Frame(ClientFrame),
}

/// Inbound pipeline events, tagged `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Greeting {
        #[serde(default)]
        text: String,
    },
    ListeningStarted {
        #[serde(default)]
        session_id: Option<String>,
    },
    InterimTranscript {
        #[serde(default)]
        text: String,
    },
    FinalTranscript {
        #[serde(default)]
        text: String,
    },
    LlmResponseText {
        #[serde(default)]
        text: String,
    },
    /// One chunk of synthesized speech, base64 PCM16. Empty payload
    /// marks the end of the utterance. Some backend versions emit the
    /// shorter `tts_audio` tag for the same shape.
    #[serde(alias = "tts_audio")]
    TtsAudioChunk {
        #[serde(default)]
        audio_data: String,
    },
    Error {
        #[serde(default)]
        text: String,
    },
}

/// Inbound connection frames, tagged `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ping,
    Pong,
    ConnectionEstablished {
        #[serde(default)]
        session_id: Option<String>,
    },
    PipelineStateUpdate {
        #[serde(default)]
        state: String,
    },
}

/// Everything the server sends.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InboundMessage {
    Event(ServerEvent),
    Frame(ServerFrame),
}
