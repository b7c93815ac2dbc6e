//! Remote conversational audio session
//!
//! The relay only needs four things from the remote side: open a session,
//! push audio into it, receive its audio events, close it. A session is
//! represented by bounded channels to a task that owns the actual
//! connection, plus an idempotent close handle.

pub mod live;
pub mod messages;

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::SessionConfig;
use crate::error::SessionError;

pub use live::LiveConnector;

/// Audio chunk ready for the remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    /// Base64 of the little-endian PCM bytes
    pub data: String,
    pub mime_type: String,
}

/// Events emitted by the remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw audio to forward to the client unmodified
    Audio(Bytes),
    /// The model finished its turn
    TurnComplete,
    /// The model's output was interrupted by user speech
    Interrupted,
    /// The session ended; no further events follow
    Closed { reason: Option<String> },
}

/// Idempotent close handle shared by everyone who may end a session
#[derive(Debug, Clone)]
pub struct SessionCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl SessionCloser {
    /// Request close. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving side of a [`SessionCloser`], held by the session task
#[derive(Debug)]
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once close was requested or every closer was dropped
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

/// Create a linked closer/signal pair
pub fn close_pair() -> (SessionCloser, CloseSignal) {
    let (tx, rx) = watch::channel(false);
    (SessionCloser { tx: Arc::new(tx) }, CloseSignal { rx })
}

/// Handle to an open remote session
pub struct RemoteSession {
    audio: mpsc::Sender<AudioPayload>,
    events: mpsc::Receiver<SessionEvent>,
    closer: SessionCloser,
}

impl RemoteSession {
    pub fn new(
        audio: mpsc::Sender<AudioPayload>,
        events: mpsc::Receiver<SessionEvent>,
        closer: SessionCloser,
    ) -> Self {
        Self {
            audio,
            events,
            closer,
        }
    }

    pub fn closer(&self) -> SessionCloser {
        self.closer.clone()
    }

    /// Split into the uplink sender, the event receiver and the closer
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<AudioPayload>,
        mpsc::Receiver<SessionEvent>,
        SessionCloser,
    ) {
        (self.audio, self.events, self.closer)
    }
}

/// Opens remote sessions
pub trait SessionConnector: Send + Sync + 'static {
    fn connect(
        &self,
        config: &SessionConfig,
    ) -> impl Future<Output = Result<RemoteSession, SessionError>> + Send;
}
