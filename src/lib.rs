//! Real-time full-duplex voice client.
//!
//! Captures microphone audio, detects speech, streams frames to a voice
//! agent backend over a WebSocket control channel (optionally a WHIP
//! media channel), and plays synthesized replies through an adaptive
//! jitter buffer with barge-in support.

pub mod audio;
pub mod config;
pub mod error;
pub mod net;
pub mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use net::NetworkStats;
pub use session::{AgentStatus, ConnectionState, SessionEvent, SessionManager};
