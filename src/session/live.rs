//! Gemini Live session over WebSocket
//!
//! Opens the BidiGenerateContent stream, performs the setup handshake, then
//! writes uplink audio and reads server messages on separate tasks until
//! either side closes.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::messages::{Blob, ClientMessage, Content, GenerationConfig, ServerMessage, Setup};
use super::{close_pair, AudioPayload, CloseSignal, RemoteSession, SessionConnector, SessionEvent};
use crate::config::{PipelineConfig, SessionConfig};
use crate::error::SessionError;

/// Connector for the Gemini Live API
#[derive(Debug, Clone)]
pub struct LiveConnector {
    uplink_depth: usize,
    event_depth: usize,
}

impl LiveConnector {
    pub fn new(limits: &PipelineConfig) -> Self {
        Self {
            uplink_depth: limits.uplink_queue_depth,
            event_depth: limits.event_queue_depth,
        }
    }
}

impl SessionConnector for LiveConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<RemoteSession, SessionError> {
        let url = session_url(config)?;
        tracing::info!(
            "Opening live session on {} with model {}",
            url.host_str().unwrap_or("unknown host"),
            config.model
        );

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&setup_message(config))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        tokio::time::timeout(
            Duration::from_millis(config.setup_timeout_ms),
            wait_for_setup(&mut read),
        )
        .await
        .map_err(|_| SessionError::SetupTimeout(config.setup_timeout_ms))??;

        tracing::info!("Live session opened");

        let (audio_tx, audio_rx) = mpsc::channel(self.uplink_depth);
        let (event_tx, event_rx) = mpsc::channel(self.event_depth);
        let (closer, signal) = close_pair();

        tokio::spawn(run_session(write, read, audio_rx, event_tx, signal));

        Ok(RemoteSession::new(audio_tx, event_rx, closer))
    }
}

/// Endpoint URL with the API key attached
pub fn session_url(config: &SessionConfig) -> Result<Url, SessionError> {
    let key = config
        .api_key
        .as_deref()
        .ok_or(SessionError::MissingApiKey)?;
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| SessionError::ConnectFailed(format!("invalid endpoint: {}", e)))?;
    url.query_pairs_mut().append_pair("key", key);
    Ok(url)
}

/// First message of every session: model, audio responses, persona
pub fn setup_message(config: &SessionConfig) -> ClientMessage {
    let system_instruction = if config.system_instruction.trim().is_empty() {
        None
    } else {
        Some(Content::text(config.system_instruction.clone()))
    };

    ClientMessage::setup(Setup {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
        },
        system_instruction,
    })
}

/// Parse a text or binary frame; control frames yield `None`
fn parse_server_message(msg: &Message) -> Result<Option<ServerMessage>, SessionError> {
    let raw = match msg {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data.as_slice(),
        _ => return Ok(None),
    };
    Ok(Some(serde_json::from_slice(raw)?))
}

async fn wait_for_setup<R, E>(read: &mut R) -> Result<(), SessionError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = read.next().await {
        let msg = msg.map_err(|e| SessionError::Protocol(e.to_string()))?;
        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .unwrap_or_else(|| "closed during setup".to_string());
            return Err(SessionError::SetupRejected(reason));
        }
        if let Some(server) = parse_server_message(&msg)? {
            if server.setup_complete.is_some() {
                return Ok(());
            }
        }
    }
    Err(SessionError::Closed)
}

/// Forward the events carried by one server message
async fn forward_events(
    server: &ServerMessage,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), mpsc::error::SendError<SessionEvent>> {
    match server.audio_chunks() {
        Ok(chunks) => {
            for chunk in chunks {
                events.send(SessionEvent::Audio(chunk)).await?;
            }
        }
        Err(e) => tracing::warn!("Dropping undecodable audio part: {}", e),
    }

    if let Some(content) = &server.server_content {
        if content.interrupted {
            events.send(SessionEvent::Interrupted).await?;
        }
        if content.turn_complete {
            events.send(SessionEvent::TurnComplete).await?;
        }
    }

    if let Some(go_away) = &server.go_away {
        tracing::warn!(
            "Live session is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }

    Ok(())
}

/// Own the socket until close: uplink audio out, server events in.
///
/// Server messages are read on their own task so a slow event consumer
/// never holds up uplink writes.
pub(crate) async fn run_session<W, R, E>(
    mut write: W,
    read: R,
    mut audio: mpsc::Receiver<AudioPayload>,
    events: mpsc::Sender<SessionEvent>,
    mut signal: CloseSignal,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let mut reader = tokio::spawn(read_server(read, events.clone()));

    let reason = loop {
        tokio::select! {
            _ = signal.closed() => break None,

            finished = &mut reader => {
                break finished.unwrap_or_else(|e| Some(format!("reader failed: {}", e)));
            }

            payload = audio.recv() => {
                let Some(payload) = payload else {
                    break None;
                };
                let msg = ClientMessage::audio(Blob {
                    mime_type: payload.mime_type,
                    data: payload.data,
                });
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => break Some(format!("serialization failed: {}", e)),
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    break Some(format!("send failed: {}", e));
                }
            }
        }
    };
    reader.abort();

    match &reason {
        Some(reason) => tracing::warn!("Live session ended: {}", reason),
        None => tracing::info!("Live session closed"),
    }

    let _ = write.send(Message::Close(None)).await;
    let _ = events.try_send(SessionEvent::Closed { reason });
}

/// Deliver server messages as events. Returns the close reason, or `None`
/// when the event consumer went away.
async fn read_server<R, E>(mut read: R, events: mpsc::Sender<SessionEvent>) -> Option<String>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Close(frame))) => {
                return Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by remote".to_string()));
            }
            Some(Ok(msg)) => match parse_server_message(&msg) {
                Ok(Some(server)) => {
                    if forward_events(&server, &events).await.is_err() {
                        return None;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Ignoring unparseable server message: {}", e),
            },
            Some(Err(e)) => return Some(e.to_string()),
            None => return Some("connection lost".to_string()),
        }
    }
}
