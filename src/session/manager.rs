//! Session lifecycle and the control-channel event loop.
//!
//! One cooperative loop per connection: WebSocket traffic, captured
//! frames, heartbeat, playback release and stats refresh all multiplex
//! through a single `select!`. The cpal callbacks stay on their own
//! threads and only reach the loop through channels.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::audio::{CaptureService, FrameEvent, PlaybackPoll, PlaybackScheduler};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::net::{AdaptiveJitterBuffer, InboundChunk, NetworkQualityEstimator, NetworkStats};

use super::messages::{ClientEvent, ClientFrame, InboundMessage, ServerEvent, ServerFrame};
use super::state::{AgentStatus, ConnectionState, RetryPolicy};
use super::whip::MediaSession;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    StatusChanged(AgentStatus),
    Greeting(String),
    InterimTranscript(String),
    FinalTranscript(String),
    AgentResponse(String),
    Stats(NetworkStats),
    SessionError(String),
}

enum CloseReason {
    /// Local disconnect requested
    Shutdown,
    /// Socket closed or errored underneath us
    ConnectionLost,
}

/// Everything torn down together on disconnect.
struct SessionResources {
    task: tokio::task::JoinHandle<()>,
}

pub struct SessionManager {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    status: RwLock<AgentStatus>,
    session_id: RwLock<String>,
    capture: Arc<CaptureService>,
    playback: Arc<PlaybackScheduler>,
    http: reqwest::Client,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    resources: Mutex<Option<SessionResources>>,
    shutdown: watch::Sender<bool>,
}

impl SessionManager {
    pub fn new(config: ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let capture = Arc::new(CaptureService::new(config.capture_enhancement));
        capture.set_device(config.input_device.clone());
        let playback = Arc::new(PlaybackScheduler::new());
        playback.set_device(config.output_device.clone());

        let manager = Arc::new(Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            status: RwLock::new(AgentStatus::Idle),
            session_id: RwLock::new(Uuid::new_v4().to_string()),
            capture,
            playback,
            http: reqwest::Client::new(),
            event_tx,
            command_tx: Mutex::new(None),
            resources: Mutex::new(None),
            shutdown: watch::channel(false).0,
        });

        (manager, event_rx)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn agent_status(&self) -> AgentStatus {
        *self.status.read()
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    /// Normalized microphone level for observability.
    pub fn input_level(&self) -> f32 {
        self.capture.current_level()
    }

    /// Start the session. No-op unless disconnected or errored.
    pub fn connect(self: &Arc<Self>) {
        {
            let state = self.state.read();
            if !matches!(*state, ConnectionState::Disconnected | ConnectionState::Error) {
                tracing::warn!("Connect ignored in state {:?}", *state);
                return;
            }
        }

        self.shutdown.send_replace(false);
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            manager.run_loop(&mut shutdown_rx).await;
        });
        *self.resources.lock() = Some(SessionResources { task });
    }

    /// Tear everything down: loop, streams, timers, queued audio.
    pub async fn disconnect(&self) {
        self.shutdown.send_replace(true);

        let resources = self.resources.lock().take();
        if let Some(resources) = resources {
            if resources.task.await.is_err() {
                tracing::warn!("Session task ended abnormally");
            }
        }

        *self.command_tx.lock() = None;
        self.capture.stop();
        self.playback.stop();
        self.set_state(ConnectionState::Disconnected);
        self.set_status(AgentStatus::Idle);
        tracing::info!("Session disconnected");
    }

    /// Ask the server to start the listening pipeline.
    pub fn start_listening(&self) {
        self.send_command(ClientEvent::StartListening {
            session_id: self.session_id(),
        });
    }

    /// Hand a final transcript to the language model stage.
    pub fn trigger_llm(&self, final_transcript: String) {
        self.send_command(ClientEvent::TriggerLlm {
            session_id: self.session_id(),
            final_transcript,
        });
    }

    /// Ask the agent to speak its greeting.
    pub fn request_greeting(&self) {
        self.send_command(ClientEvent::GreetingRequest {
            session_id: self.session_id(),
        });
    }

    fn send_command(&self, event: ClientEvent) {
        if let Some(tx) = self.command_tx.lock().as_ref() {
            let _ = tx.send(event);
        } else {
            tracing::warn!("Command dropped, no active connection");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.write();
            if *current != state {
                tracing::info!("Connection state: {:?} -> {:?}", *current, state);
                *current = state.clone();
                true
            } else {
                false
            }
        };
        if changed {
            let _ = self.event_tx.send(SessionEvent::StateChanged(state));
        }
    }

    fn set_status(&self, status: AgentStatus) {
        let changed = {
            let mut current = self.status.write();
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        };
        if changed {
            let _ = self.event_tx.send(SessionEvent::StatusChanged(status));
        }
    }

    /// Connect/retry loop. Each outage gets a fresh attempt budget; the
    /// budget spent without a successful dial ends in `Error`.
    async fn run_loop(self: Arc<Self>, shutdown_rx: &mut watch::Receiver<bool>) {
        let policy = RetryPolicy {
            base: self.config.backoff_base(),
            cap: self.config.backoff_cap(),
            max_attempts: self.config.max_retries,
        };
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Recovering { attempt }
            });

            match self.run_connection(shutdown_rx).await {
                Ok(CloseReason::Shutdown) => return,
                Ok(CloseReason::ConnectionLost) => {
                    tracing::warn!("Control channel lost, attempting recovery");
                    attempt = 0;
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!("Fatal session error: {}", e);
                    let _ = self.event_tx.send(SessionEvent::SessionError(e.to_string()));
                    self.set_state(ConnectionState::Error);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Connection attempt failed: {}", e);
                    let _ = self.event_tx.send(SessionEvent::SessionError(e.to_string()));
                }
            }

            match policy.delay_for(attempt) {
                Some(delay) => {
                    attempt += 1;
                    self.set_state(ConnectionState::Recovering { attempt });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                }
                None => {
                    tracing::error!("Retries exhausted after {} attempts", policy.max_attempts);
                    self.set_state(ConnectionState::Error);
                    return;
                }
            }
        }
    }

    /// Dial, negotiate and run one connection to completion.
    async fn run_connection(
        self: &Arc<Self>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<CloseReason, ClientError> {
        let dial = tokio_tungstenite::connect_async(self.config.control_url.as_str());
        let (ws, _) = tokio::time::timeout(self.config.connect_timeout(), dial)
            .await
            .map_err(|_| {
                ClientError::Transport(format!(
                    "Timed out connecting to {} after {}s",
                    self.config.control_url, self.config.connect_timeout_secs
                ))
            })?
            .map_err(|e| ClientError::Transport(format!("WebSocket connect failed: {}", e)))?;

        tracing::info!("Control channel connected: {}", self.config.control_url);
        let (mut ws_tx, mut ws_rx) = ws.split();

        // Media channel is best-effort: audio falls back to the control
        // channel when negotiation fails
        let media = match &self.config.whip_url {
            Some(url) => {
                let session_id = self.session_id();
                match MediaSession::connect(&self.http, url, &self.config.ice_servers, &session_id)
                    .await
                {
                    Ok((session, server_id)) => {
                        if let Some(id) = server_id {
                            tracing::info!("Server-issued session id: {}", id);
                            *self.session_id.write() = id;
                        }
                        Some(session)
                    }
                    Err(e) => {
                        tracing::warn!("WHIP negotiation failed, using control channel audio: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<FrameEvent>();
        self.capture.start(frame_tx)?;
        if let Err(e) = self.playback.start() {
            tracing::warn!("Playback unavailable: {}", e);
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientEvent>();
        *self.command_tx.lock() = Some(command_tx);

        self.set_state(ConnectionState::Connected);

        let mut jitter = AdaptiveJitterBuffer::default();
        let mut stats = NetworkQualityEstimator::new();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut release_tick = tokio::time::interval(self.config.release_tick());
        release_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stats_tick = tokio::time::interval(self.config.stats_interval());
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason = loop {
            if *shutdown_rx.borrow() {
                let _ = ws_tx.send(Message::Close(None)).await;
                break CloseReason::Shutdown;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break CloseReason::Shutdown;
                }

                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_text(&text, &mut jitter, &mut stats) {
                            if ws_tx.send(Message::Text(reply)).await.is_err() {
                                break CloseReason::ConnectionLost;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.handle_chunk(data.to_vec(), &mut jitter, &mut stats);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break CloseReason::ConnectionLost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Control channel closed by server");
                        break CloseReason::ConnectionLost;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Control channel error: {}", e);
                        break CloseReason::ConnectionLost;
                    }
                    Some(Ok(_)) => {}
                },

                frame = frame_rx.recv() => {
                    if let Some(event) = frame {
                        if let Some(text) =
                            self.handle_frame(&event, media.as_ref(), &mut jitter, &mut stats).await
                        {
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                break CloseReason::ConnectionLost;
                            }
                        }
                    }
                }

                command = command_rx.recv() => {
                    if let Some(event) = command {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if ws_tx.send(Message::Text(json)).await.is_err() {
                                    break CloseReason::ConnectionLost;
                                }
                            }
                            Err(e) => tracing::error!("Failed to serialize command: {}", e),
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Ok(ping) = serde_json::to_string(&ClientFrame::Ping) {
                        if ws_tx.send(Message::Text(ping)).await.is_err() {
                            break CloseReason::ConnectionLost;
                        }
                    }
                }

                _ = release_tick.tick() => {
                    self.drive_playback(&mut jitter);
                }

                _ = stats_tick.tick() => {
                    let snapshot = stats.snapshot(jitter.target_depth(), jitter.len());
                    jitter.adapt(&snapshot);
                    // Loss counters are per-interval; lifetime totals would
                    // saturate the estimate on a healthy link
                    stats.reset_interval();
                    let _ = self.event_tx.send(SessionEvent::Stats(snapshot));
                }
            }
        };

        // Connection-scoped teardown; the retry loop decides what's next
        *self.command_tx.lock() = None;
        self.capture.stop();
        self.playback.cancel();
        if let Some(media) = &media {
            media.close();
        }

        Ok(reason)
    }

    /// Route one inbound text message. Returns a serialized reply when
    /// the protocol demands one (ping/pong).
    fn handle_text(
        &self,
        text: &str,
        jitter: &mut AdaptiveJitterBuffer,
        stats: &mut NetworkQualityEstimator,
    ) -> Option<String> {
        let msg: InboundMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Ignoring malformed control message: {}", e);
                return None;
            }
        };

        match msg {
            InboundMessage::Frame(frame) => match frame {
                ServerFrame::Ping => serde_json::to_string(&ClientFrame::Pong).ok(),
                ServerFrame::Pong => None,
                ServerFrame::ConnectionEstablished { session_id } => {
                    if let Some(id) = session_id {
                        tracing::info!("Server-issued session id: {}", id);
                        *self.session_id.write() = id;
                    }
                    None
                }
                ServerFrame::PipelineStateUpdate { state } => {
                    if let Some(status) = parse_pipeline_state(&state) {
                        self.set_status(status);
                    } else {
                        tracing::debug!("Unknown pipeline state: {}", state);
                    }
                    None
                }
            },
            InboundMessage::Event(event) => {
                self.handle_server_event(event, jitter, stats);
                None
            }
        }
    }

    fn handle_server_event(
        &self,
        event: ServerEvent,
        jitter: &mut AdaptiveJitterBuffer,
        stats: &mut NetworkQualityEstimator,
    ) {
        match event {
            ServerEvent::Greeting { text } => {
                let _ = self.event_tx.send(SessionEvent::Greeting(text));
            }
            ServerEvent::ListeningStarted { session_id } => {
                if let Some(id) = session_id {
                    *self.session_id.write() = id;
                }
                self.set_status(AgentStatus::Listening);
            }
            ServerEvent::InterimTranscript { text } => {
                let _ = self.event_tx.send(SessionEvent::InterimTranscript(text));
            }
            ServerEvent::FinalTranscript { text } => {
                self.set_status(AgentStatus::Thinking);
                let _ = self.event_tx.send(SessionEvent::FinalTranscript(text.clone()));
                // The pipeline waits for an explicit handoff to the LLM
                self.trigger_llm(text);
            }
            ServerEvent::LlmResponseText { text } => {
                let _ = self.event_tx.send(SessionEvent::AgentResponse(text));
            }
            ServerEvent::TtsAudioChunk { audio_data } => {
                if audio_data.is_empty() {
                    self.handle_chunk(Vec::new(), jitter, stats);
                    return;
                }
                match base64::engine::general_purpose::STANDARD.decode(&audio_data) {
                    Ok(payload) => self.handle_chunk(payload, jitter, stats),
                    Err(e) => tracing::warn!("Dropping undecodable audio chunk: {}", e),
                }
            }
            ServerEvent::Error { text } => {
                tracing::warn!("Server error: {}", text);
                let _ = self.event_tx.send(SessionEvent::SessionError(text));
            }
        }
    }

    fn handle_chunk(
        &self,
        payload: Vec<u8>,
        jitter: &mut AdaptiveJitterBuffer,
        stats: &mut NetworkQualityEstimator,
    ) {
        let chunk = InboundChunk::new(payload);
        if !chunk.is_completion_signal() {
            stats.record_arrival(chunk.arrival);
        }
        jitter.push(chunk);
        self.drive_playback(jitter);
    }

    /// Handle one captured frame: barge-in first, then ship the audio
    /// over the media channel or, failing that, the control channel.
    async fn handle_frame(
        &self,
        event: &FrameEvent,
        media: Option<&MediaSession>,
        jitter: &mut AdaptiveJitterBuffer,
        stats: &mut NetworkQualityEstimator,
    ) -> Option<String> {
        if event.voice_active && self.playback.is_speaking() {
            tracing::info!("Barge-in: user speech during playback");
            self.playback.cancel();
            jitter.clear();
            self.set_status(AgentStatus::Listening);
        }

        stats.record_sent();

        if let Some(media) = media {
            if let Err(e) = media.send_frame(&event.frame.samples).await {
                tracing::warn!("Failed to send media frame: {}", e);
            }
            return None;
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(event.frame.to_le_bytes());
        let msg = ClientEvent::AudioData {
            session_id: self.session_id(),
            audio_data: encoded,
            is_final: !event.voice_active,
        };
        serde_json::to_string(&msg).ok()
    }

    /// One scheduling step: reap the active unit, then release the next.
    fn drive_playback(&self, jitter: &mut AdaptiveJitterBuffer) {
        match self.playback.poll() {
            PlaybackPoll::Completed | PlaybackPoll::TimedOut => {
                if jitter.is_empty() {
                    self.set_status(AgentStatus::Idle);
                }
            }
            PlaybackPoll::Playing => return,
            PlaybackPoll::Idle => {}
        }

        if let Some(unit) = jitter.take_release() {
            match self.playback.play(&unit) {
                Ok(()) => self.set_status(AgentStatus::Speaking),
                Err(e) => {
                    tracing::warn!("Dropping unplayable unit: {}", e);
                }
            }
        }
    }
}

fn parse_pipeline_state(state: &str) -> Option<AgentStatus> {
    match state {
        "idle" => Some(AgentStatus::Idle),
        "listening" => Some(AgentStatus::Listening),
        "processing" | "thinking" => Some(AgentStatus::Thinking),
        "speaking" => Some(AgentStatus::Speaking),
        _ => None,
    }
}
