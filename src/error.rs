use thiserror::Error;

/// Errors surfaced by the voice client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Microphone access denied: {0}")]
    Permission(String),
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("Media negotiation failed: {0}")]
    Negotiation(String),
    #[error("Audio decode failed: {0}")]
    Decode(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Terminal errors are not retried; the session goes straight to `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientError::Permission(_) | ClientError::Config(_))
    }
}
