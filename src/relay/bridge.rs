//! Transport bridge
//!
//! Pairs one client transport with one remote session for the lifetime of
//! the connection. Inbound binary messages go through the
//! [`InboundPipeline`]; remote audio is forwarded back unmodified while the
//! transport is open. Whichever side ends first tears down the other.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::OpusFrameDecoder;
use crate::config::AppConfig;
use crate::container::WebmDemuxer;
use crate::error::{Error, Result, TransportError};
use crate::relay::pipeline::{FeedReport, InboundPipeline, PipelineStats};
use crate::relay::uplink::UplinkRelay;
use crate::session::{SessionCloser, SessionConnector, SessionEvent};

/// How long teardown waits for the downlink task to drain
const DOWNLINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed its transport
    ClientClosed,
    Transport(String),
    /// The inbound byte stream was not a valid container
    MalformedStream(String),
    SessionConnectFailed(String),
    /// The remote session ended, with its reason if it gave one
    SessionEnded(Option<String>),
    Internal(String),
}

/// Remote-to-client forwarding statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownlinkStats {
    pub chunks_forwarded: u64,
    pub bytes_forwarded: u64,
    /// Chunks that arrived after the transport closed
    pub chunks_dropped: u64,
}

/// Final record of one connection
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub id: Uuid,
    pub reason: CloseReason,
    pub pipeline: PipelineStats,
    pub downlink: DownlinkStats,
}

/// State shared by both directions of one connection
pub struct ConnectionSession {
    id: Uuid,
    pipeline: InboundPipeline,
    closer: SessionCloser,
    transport_open: Arc<AtomicBool>,
}

impl ConnectionSession {
    pub fn new(id: Uuid, pipeline: InboundPipeline, closer: SessionCloser) -> Self {
        Self {
            id,
            pipeline,
            closer,
            transport_open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle one inbound transport message
    pub fn on_inbound(&mut self, data: &[u8]) -> Result<FeedReport> {
        self.pipeline.on_inbound(data)
    }

    pub fn is_transport_open(&self) -> bool {
        self.transport_open.load(Ordering::Acquire)
    }

    /// Mark the transport closed and close the remote session.
    /// Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        let was_open = self.transport_open.swap(false, Ordering::AcqRel);
        let closed_session = self.closer.close();
        was_open || closed_session
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    fn transport_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.transport_open)
    }
}

/// Result of the downlink task
struct DownlinkReport {
    stats: DownlinkStats,
    /// `Some` when the remote session reported its own end
    remote_end: Option<Option<String>>,
}

/// Runs connections against remote sessions from one connector
pub struct TransportBridge<C> {
    connector: Arc<C>,
    config: Arc<AppConfig>,
}

impl<C> Clone for TransportBridge<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C: SessionConnector> TransportBridge<C> {
    pub fn new(connector: Arc<C>, config: Arc<AppConfig>) -> Self {
        Self { connector, config }
    }

    /// Serve one client connection until either side closes
    pub async fn run<S, K>(&self, id: Uuid, mut inbound: S, mut outbound: K) -> ConnectionSummary
    where
        S: Stream<Item = std::result::Result<Bytes, TransportError>> + Unpin + Send,
        K: Sink<Bytes, Error = TransportError> + Unpin + Send + 'static,
    {
        tracing::info!(connection = %id, "Client connected");

        let (mut session, mut downlink) = match self.open(id).await {
            Ok((session, events)) => {
                let transport_open = session.transport_flag();
                let downlink = tokio::spawn(forward_downlink(id, events, outbound, transport_open));
                (session, downlink)
            }
            Err(e) => {
                tracing::error!(connection = %id, "Failed to open remote session: {}", e);
                let _ = outbound.close().await;
                return ConnectionSummary {
                    id,
                    reason: CloseReason::SessionConnectFailed(e.to_string()),
                    pipeline: PipelineStats::default(),
                    downlink: DownlinkStats::default(),
                };
            }
        };

        let ending = loop {
            tokio::select! {
                msg = inbound.next() => match msg {
                    Some(Ok(data)) => {
                        if let Err(e) = session.on_inbound(&data) {
                            break Ending::Inbound(close_reason(e));
                        }
                    }
                    Some(Err(e)) => break Ending::Inbound(CloseReason::Transport(e.to_string())),
                    None => break Ending::Inbound(CloseReason::ClientClosed),
                },
                result = &mut downlink => break Ending::Downlink(result),
            }
        };

        session.close();

        let (reason, report) = match ending {
            Ending::Inbound(reason) => {
                let report = match tokio::time::timeout(DOWNLINK_DRAIN_TIMEOUT, &mut downlink).await {
                    Ok(Ok(report)) => Some(report),
                    Ok(Err(e)) => {
                        tracing::error!(connection = %id, "Downlink task failed: {}", e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!(connection = %id, "Downlink did not drain in time");
                        downlink.abort();
                        None
                    }
                };
                (reason, report)
            }
            Ending::Downlink(Ok(report)) => {
                let reason = CloseReason::SessionEnded(report.remote_end.clone().flatten());
                (reason, Some(report))
            }
            Ending::Downlink(Err(e)) => (CloseReason::Internal(e.to_string()), None),
        };

        let summary = ConnectionSummary {
            id,
            reason,
            pipeline: session.stats(),
            downlink: report.map(|r| r.stats).unwrap_or_default(),
        };

        tracing::info!(
            connection = %id,
            "Connection closed ({:?}): {} frames decoded, {} skipped, {} chunks returned",
            summary.reason,
            summary.pipeline.frames_decoded,
            summary.pipeline.frames_skipped,
            summary.downlink.chunks_forwarded
        );

        summary
    }

    async fn open(&self, id: Uuid) -> Result<(ConnectionSession, mpsc::Receiver<SessionEvent>)> {
        let session = self.connector.connect(&self.config.session).await?;
        let (audio, events, closer) = session.into_parts();

        let decoder = match OpusFrameDecoder::new(self.config.session.input_sample_rate) {
            Ok(decoder) => decoder,
            Err(e) => {
                closer.close();
                return Err(e.into());
            }
        };

        let pipeline = InboundPipeline::new(
            WebmDemuxer::with_max_element_size(self.config.pipeline.max_element_size),
            decoder,
            UplinkRelay::new(audio, self.config.session.input_mime_type()),
        );

        Ok((ConnectionSession::new(id, pipeline, closer), events))
    }
}

enum Ending {
    Inbound(CloseReason),
    Downlink(std::result::Result<DownlinkReport, tokio::task::JoinError>),
}

fn close_reason(error: Error) -> CloseReason {
    match error {
        Error::Container(e) => CloseReason::MalformedStream(e.to_string()),
        Error::Session(e) => CloseReason::SessionEnded(Some(e.to_string())),
        other => CloseReason::Internal(other.to_string()),
    }
}

/// Writes remote audio to the client transport while it is open
struct DownlinkForwarder<K> {
    id: Uuid,
    outbound: K,
    transport_open: Arc<AtomicBool>,
    stats: DownlinkStats,
}

impl<K> DownlinkForwarder<K>
where
    K: Sink<Bytes, Error = TransportError> + Unpin,
{
    /// Forward one chunk unmodified; after close it is dropped silently
    async fn on_remote_audio(&mut self, data: Bytes) {
        if !self.transport_open.load(Ordering::Acquire) {
            self.stats.chunks_dropped += 1;
            return;
        }

        let len = data.len() as u64;
        match self.outbound.send(data).await {
            Ok(()) => {
                self.stats.chunks_forwarded += 1;
                self.stats.bytes_forwarded += len;
            }
            Err(e) => {
                tracing::debug!(connection = %self.id, "Client transport gone: {}", e);
                self.transport_open.store(false, Ordering::Release);
                self.stats.chunks_dropped += 1;
            }
        }
    }

    async fn close(mut self) -> DownlinkStats {
        self.transport_open.store(false, Ordering::Release);
        let _ = self.outbound.close().await;
        self.stats
    }
}

/// Drain remote events until the session ends
async fn forward_downlink<K>(
    id: Uuid,
    mut events: mpsc::Receiver<SessionEvent>,
    outbound: K,
    transport_open: Arc<AtomicBool>,
) -> DownlinkReport
where
    K: Sink<Bytes, Error = TransportError> + Unpin,
{
    let mut forwarder = DownlinkForwarder {
        id,
        outbound,
        transport_open,
        stats: DownlinkStats::default(),
    };
    let mut remote_end = None;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Audio(data) => forwarder.on_remote_audio(data).await,
            SessionEvent::TurnComplete => tracing::debug!(connection = %id, "Turn complete"),
            SessionEvent::Interrupted => tracing::debug!(connection = %id, "Turn interrupted"),
            SessionEvent::Closed { reason } => {
                remote_end = Some(reason);
                break;
            }
        }
    }

    // Event channel dropped without a close event while we were still open
    if remote_end.is_none() && forwarder.transport_open.load(Ordering::Acquire) {
        remote_end = Some(None);
    }

    DownlinkReport {
        stats: forwarder.close().await,
        remote_end,
    }
}
