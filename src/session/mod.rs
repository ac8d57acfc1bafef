mod manager;
mod messages;
mod state;
mod whip;

pub use manager::{SessionEvent, SessionManager};
pub use messages::{ClientEvent, ClientFrame, InboundMessage, OutboundMessage, ServerEvent, ServerFrame};
pub use state::{AgentStatus, ConnectionState, RetryPolicy};
pub use whip::{probe_endpoint, MediaSession, OutboundAudioTrack};
