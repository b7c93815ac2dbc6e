//! Client driver
//!
//! Runs the conversation state machine against real resources: the
//! microphone, the relay WebSocket and the speaker. Every resource is
//! touched only from the driver task; helper tasks (connect, socket
//! reader) report back over one channel, tagged with the connection
//! generation so stale reports are ignored.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::audio::MicrophoneCapture;
use crate::client::recorder::Recorder;
use crate::client::state::{CaptureFailure, ClientAction, ClientEvent, ClientMachine, ClientState};
use crate::config::ClientConfig;
use crate::constants::CAPTURE_SAMPLE_RATE;
use crate::error::{AudioError, Result, TransportError};
use crate::playback::{DeviceOutput, OutputDevice, PlaybackScheduler};

/// How long Stopping waits for the relay to confirm the close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of a relay connection
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = TransportError> + Send>>;

/// Receiving half of a relay connection
pub type MessageStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, TransportError>> + Send>>;

/// Microphone as driven by the client
pub trait Microphone {
    /// Take every sample captured since the last call
    fn drain(&self) -> Vec<f32>;

    fn check_errors(&self) -> Option<AudioError>;

    fn stop(&mut self);
}

impl Microphone for MicrophoneCapture {
    fn drain(&self) -> Vec<f32> {
        MicrophoneCapture::drain(self)
    }

    fn check_errors(&self) -> Option<AudioError> {
        MicrophoneCapture::check_errors(self)
    }

    fn stop(&mut self) {
        MicrophoneCapture::stop(self)
    }
}

/// Opens the resources a conversation needs
pub trait ClientBackend: Clone + Send + Sync + 'static {
    type Microphone: Microphone;
    type Output: OutputDevice;

    /// Start capturing mono audio at `sample_rate`
    fn open_microphone(&self, sample_rate: u32) -> std::result::Result<Self::Microphone, AudioError>;

    /// Open an output for mono audio at `sample_rate`
    fn open_output(&self, sample_rate: u32) -> std::result::Result<Self::Output, AudioError>;

    /// Connect to the relay
    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = std::result::Result<(MessageSink, MessageStream), TransportError>> + Send;
}

/// Default devices and a tokio-tungstenite WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBackend;

impl ClientBackend for DeviceBackend {
    type Microphone = MicrophoneCapture;
    type Output = DeviceOutput;

    fn open_microphone(&self, sample_rate: u32) -> std::result::Result<MicrophoneCapture, AudioError> {
        MicrophoneCapture::start(None, sample_rate)
    }

    fn open_output(&self, sample_rate: u32) -> std::result::Result<DeviceOutput, AudioError> {
        DeviceOutput::open(sample_rate)
    }

    async fn connect(&self, url: &str) -> std::result::Result<(MessageSink, MessageStream), TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();

        let sink: MessageSink = Box::pin(sink.sink_map_err(|e| TransportError::SendFailed(e.to_string())));
        let stream: MessageStream =
            Box::pin(stream.map(|msg| msg.map_err(|e| TransportError::ReceiveFailed(e.to_string()))));
        Ok((sink, stream))
    }
}

/// Reports from helper tasks
enum DriverInput {
    Connected(u64, MessageSink, MessageStream),
    ConnectFailed(u64, String),
    Audio(u64, Bytes),
    Closed(u64),
    Failed(u64, String),
}

/// Owns every client-side resource for one conversation at a time
pub struct ClientDriver<B: ClientBackend = DeviceBackend> {
    config: ClientConfig,
    backend: B,
    machine: ClientMachine,
    microphone: Option<B::Microphone>,
    recorder: Option<Recorder>,
    scheduler: Option<PlaybackScheduler<B::Output>>,
    sink: Option<MessageSink>,
    streaming: bool,
    /// Incremented for every transport opened or abandoned
    generation: u64,
    /// Set while Stopping waits for the relay
    close_deadline: Option<Instant>,
    input_tx: mpsc::Sender<DriverInput>,
    input_rx: mpsc::Receiver<DriverInput>,
}

impl ClientDriver {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_backend(config, DeviceBackend)
    }
}

impl<B: ClientBackend> ClientDriver<B> {
    pub fn with_backend(config: ClientConfig, backend: B) -> Self {
        let (input_tx, input_rx) = mpsc::channel(256);
        Self {
            config,
            backend,
            machine: ClientMachine::new(),
            microphone: None,
            recorder: None,
            scheduler: None,
            sink: None,
            streaming: false,
            generation: 0,
            close_deadline: None,
            input_tx,
            input_rx,
        }
    }

    pub fn state(&self) -> ClientState {
        self.machine.state()
    }

    pub fn status(&self) -> &'static str {
        self.machine.status()
    }

    /// Run until `toggles` closes. Each message toggles the conversation.
    pub async fn run(mut self, mut toggles: mpsc::Receiver<()>) -> Result<()> {
        let mut tick = tokio::time::interval(Duration::from_millis(
            self.config.frame_duration_ms as u64,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        println!("{}", self.machine.status());

        loop {
            let deadline = self.close_deadline;
            tokio::select! {
                toggle = toggles.recv() => match toggle {
                    Some(()) => {
                        let event = self.machine.toggle_event();
                        self.dispatch(event).await;
                    }
                    None => break,
                },
                Some(input) = self.input_rx.recv() => self.on_input(input).await,
                _ = tick.tick(), if self.streaming => self.pump_capture().await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_close_timeout().await;
                }
            }
        }

        if self.machine.state() != ClientState::Idle {
            self.dispatch(ClientEvent::StopRequested).await;
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        Ok(())
    }

    /// Feed an event and everything it triggers through the state machine
    async fn dispatch(&mut self, event: ClientEvent) {
        let before = self.machine.status();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(action).await {
                    queue.push_back(follow_up);
                }
            }
        }

        match (self.machine.state(), self.close_deadline) {
            (ClientState::Stopping, None) => self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT),
            (ClientState::Stopping, Some(_)) => {}
            _ => self.close_deadline = None,
        }

        if self.machine.status() != before {
            println!("{}", self.machine.status());
        }
    }

    async fn perform(&mut self, action: ClientAction) -> Option<ClientEvent> {
        tracing::debug!("Performing {:?}", action);
        match action {
            ClientAction::AcquireMicrophone => Some(self.acquire_microphone()),
            ClientAction::OpenTransport => {
                self.open_transport();
                None
            }
            ClientAction::StartPlayback => self.start_playback(),
            ClientAction::StartStreaming => {
                self.streaming = true;
                None
            }
            ClientAction::ReleaseMicrophone => {
                self.release_microphone().await;
                None
            }
            ClientAction::CloseTransport => self.close_transport().await,
            ClientAction::StopPlayback => {
                if let Some(mut scheduler) = self.scheduler.take() {
                    scheduler.stop();
                    let stats = scheduler.stats();
                    tracing::info!(
                        "Playback stopped: {} chunks, {:.1}s scheduled, {} resyncs",
                        stats.chunks_scheduled,
                        stats.seconds_scheduled,
                        stats.resyncs
                    );
                }
                None
            }
        }
    }

    fn acquire_microphone(&mut self) -> ClientEvent {
        let recorder = match Recorder::new(
            CAPTURE_SAMPLE_RATE,
            self.config.frame_duration_ms,
            self.config.bitrate,
            self.config.timeslice_ms,
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                tracing::error!("Voice encoding unavailable: {}", e);
                return ClientEvent::CaptureFailed(CaptureFailure::Unsupported);
            }
        };

        match self.backend.open_microphone(CAPTURE_SAMPLE_RATE) {
            Ok(microphone) => {
                self.microphone = Some(microphone);
                self.recorder = Some(recorder);
                ClientEvent::CaptureReady
            }
            Err(e) => {
                tracing::error!("Microphone unavailable: {}", e);
                let failure = match e {
                    AudioError::AccessDenied(_) => CaptureFailure::Denied,
                    _ => CaptureFailure::Unsupported,
                };
                ClientEvent::CaptureFailed(failure)
            }
        }
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let url = self.config.server_url.clone();
        let backend = self.backend.clone();
        let tx = self.input_tx.clone();

        tokio::spawn(async move {
            tracing::info!("Connecting to {}", url);
            let input = match backend.connect(&url).await {
                Ok((sink, stream)) => DriverInput::Connected(generation, sink, stream),
                Err(e) => DriverInput::ConnectFailed(generation, e.to_string()),
            };
            let _ = tx.send(input).await;
        });
    }

    /// Close the open socket, or abandon a connect still in flight
    async fn close_transport(&mut self) -> Option<ClientEvent> {
        match self.sink.take() {
            Some(mut sink) => {
                let _ = sink.close().await;
                None
            }
            None => {
                // Whatever the pending connect yields is now stale
                self.generation += 1;
                Some(ClientEvent::TransportClosed)
            }
        }
    }

    fn start_playback(&mut self) -> Option<ClientEvent> {
        let rate = self.config.playback_sample_rate;
        match self.backend.open_output(rate) {
            Ok(output) => {
                let mut scheduler = PlaybackScheduler::new(output, rate);
                scheduler.start();
                self.scheduler = Some(scheduler);
                None
            }
            Err(e) => {
                tracing::error!("Audio output unavailable: {}", e);
                Some(ClientEvent::StopRequested)
            }
        }
    }

    async fn release_microphone(&mut self) {
        self.streaming = false;

        // Hand out the tail of the recording while the socket is still up
        if let Some(mut recorder) = self.recorder.take() {
            self.pump_capture_into(&mut recorder).await;
            match recorder.finish() {
                Ok(Some(fragment)) => self.send_fragment(fragment).await,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to finish recording: {}", e),
            }
            tracing::info!(
                "Recorded {} frames in {} fragments",
                recorder.frames_written(),
                recorder.fragments()
            );
        }

        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
    }

    async fn on_close_timeout(&mut self) {
        tracing::warn!("Relay did not confirm the close, giving up on it");
        self.close_deadline = None;
        self.generation += 1;
        self.sink = None;
        self.dispatch(ClientEvent::CloseTimedOut).await;
    }

    async fn on_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::Connected(generation, mut sink, stream) => {
                if generation != self.generation {
                    tracing::debug!("Closing stale connection {}", generation);
                    tokio::spawn(async move {
                        let _ = sink.close().await;
                    });
                    return;
                }
                self.sink = Some(sink);
                self.spawn_reader(generation, stream);
                self.dispatch(ClientEvent::TransportOpened).await;
            }
            DriverInput::ConnectFailed(generation, reason) => {
                if generation == self.generation {
                    tracing::error!("Could not connect: {}", reason);
                    self.dispatch(ClientEvent::TransportFailed).await;
                }
            }
            DriverInput::Audio(generation, data) => {
                if generation != self.generation {
                    return;
                }
                if let Some(scheduler) = self.scheduler.as_mut() {
                    if let Some(e) = scheduler.output().check_errors() {
                        tracing::warn!("Output error: {}", e);
                    }
                    if let Err(e) = scheduler.on_chunk(&data) {
                        tracing::warn!("Skipping downlink chunk: {}", e);
                    }
                }
            }
            DriverInput::Closed(generation) => {
                if generation == self.generation {
                    self.sink = None;
                    self.dispatch(ClientEvent::TransportClosed).await;
                }
            }
            DriverInput::Failed(generation, reason) => {
                if generation == self.generation {
                    tracing::warn!("Connection failed: {}", reason);
                    self.sink = None;
                    self.dispatch(ClientEvent::TransportFailed).await;
                }
            }
        }
    }

    /// Forward socket messages to the driver until the socket ends
    fn spawn_reader(&self, generation: u64, mut stream: MessageStream) {
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            let end = loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if tx.send(DriverInput::Audio(generation, Bytes::from(data))).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break DriverInput::Closed(generation),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break DriverInput::Failed(generation, e.to_string()),
                }
            };
            let _ = tx.send(end).await;
        });
    }

    /// Encode captured audio and send completed fragments
    async fn pump_capture(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            self.pump_capture_into(&mut recorder).await;
            self.recorder = Some(recorder);
        }
    }

    async fn pump_capture_into(&mut self, recorder: &mut Recorder) {
        let Some(microphone) = self.microphone.as_ref() else {
            return;
        };
        if let Some(e) = microphone.check_errors() {
            tracing::warn!("Capture error: {}", e);
        }

        let samples = microphone.drain();
        match recorder.push_samples(&samples) {
            Ok(fragments) => {
                for fragment in fragments {
                    self.send_fragment(fragment).await;
                }
            }
            Err(e) => tracing::warn!("Dropping audio that failed to encode: {}", e),
        }
    }

    async fn send_fragment(&mut self, fragment: Bytes) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.send(Message::Binary(fragment.to_vec())).await {
            tracing::warn!("Failed to send audio: {}", e);
            self.sink = None;
            self.streaming = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::WebmDemuxer;
    use crate::error::PlaybackError;
    use futures::channel::mpsc as fmpsc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct MicLog {
        samples: Vec<f32>,
        stopped: bool,
    }

    struct MockMic(Arc<Mutex<MicLog>>);

    impl Microphone for MockMic {
        fn drain(&self) -> Vec<f32> {
            std::mem::take(&mut self.0.lock().samples)
        }

        fn check_errors(&self) -> Option<AudioError> {
            None
        }

        fn stop(&mut self) {
            self.0.lock().stopped = true;
        }
    }

    #[derive(Default)]
    struct OutputLog {
        scheduled: usize,
        flushes: usize,
    }

    struct MockOutput(Arc<Mutex<OutputLog>>);

    impl OutputDevice for MockOutput {
        fn current_time(&self) -> Option<f64> {
            Some(0.0)
        }

        fn schedule(&mut self, _start_at: f64, _samples: Vec<f32>, _rate: u32) -> std::result::Result<(), PlaybackError> {
            self.0.lock().scheduled += 1;
            Ok(())
        }

        fn flush(&mut self) {
            self.0.lock().flushes += 1;
        }
    }

    /// Connects never complete on their own; tests hand sockets in
    #[derive(Clone, Default)]
    struct MockBackend {
        mic: Arc<Mutex<MicLog>>,
        output: Arc<Mutex<OutputLog>>,
    }

    impl ClientBackend for MockBackend {
        type Microphone = MockMic;
        type Output = MockOutput;

        fn open_microphone(&self, _rate: u32) -> std::result::Result<MockMic, AudioError> {
            self.mic.lock().stopped = false;
            Ok(MockMic(self.mic.clone()))
        }

        fn open_output(&self, _rate: u32) -> std::result::Result<MockOutput, AudioError> {
            Ok(MockOutput(self.output.clone()))
        }

        async fn connect(&self, _url: &str) -> std::result::Result<(MessageSink, MessageStream), TransportError> {
            futures::future::pending().await
        }
    }

    /// Relay side of an in-memory socket
    struct Peer {
        sent: fmpsc::UnboundedReceiver<Message>,
        #[allow(dead_code)]
        inbound: fmpsc::UnboundedSender<std::result::Result<Message, TransportError>>,
    }

    fn socket() -> (MessageSink, MessageStream, Peer) {
        let (sent_tx, sent_rx) = fmpsc::unbounded();
        let (in_tx, in_rx) = fmpsc::unbounded();
        let sink: MessageSink = Box::pin(sent_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string())));
        let stream: MessageStream = Box::pin(in_rx);
        (sink, stream, Peer { sent: sent_rx, inbound: in_tx })
    }

    fn driver() -> (ClientDriver<MockBackend>, MockBackend) {
        let backend = MockBackend::default();
        (ClientDriver::with_backend(ClientConfig::default(), backend.clone()), backend)
    }

    /// Start, then hand in the socket the connect produced
    async fn active(driver: &mut ClientDriver<MockBackend>) -> Peer {
        driver.dispatch(ClientEvent::StartRequested).await;
        let (sink, stream, peer) = socket();
        driver
            .on_input(DriverInput::Connected(driver.generation, sink, stream))
            .await;
        assert_eq!(driver.state(), ClientState::Active);
        peer
    }

    #[tokio::test]
    async fn test_stop_while_connecting_ignores_late_open() {
        let (mut driver, backend) = driver();

        driver.dispatch(ClientEvent::StartRequested).await;
        assert_eq!(driver.state(), ClientState::Connecting);
        let pending = driver.generation;

        driver.dispatch(ClientEvent::StopRequested).await;
        assert_eq!(driver.state(), ClientState::Idle);
        assert!(backend.mic.lock().stopped);
        assert!(driver.close_deadline.is_none());

        // The abandoned connect completes after the user gave up
        let (sink, stream, mut peer) = socket();
        driver.on_input(DriverInput::Connected(pending, sink, stream)).await;
        assert_eq!(driver.state(), ClientState::Idle);
        assert!(driver.sink.is_none());
        assert_eq!(driver.status(), crate::client::state::STATUS_IDLE);

        // Its socket is closed rather than kept
        assert!(peer.sent.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_open_does_not_hijack_new_attempt() {
        let (mut driver, _backend) = driver();

        driver.dispatch(ClientEvent::StartRequested).await;
        let stale = driver.generation;
        driver.dispatch(ClientEvent::StopRequested).await;
        driver.dispatch(ClientEvent::StartRequested).await;
        assert_eq!(driver.state(), ClientState::Connecting);

        let (sink, stream, _peer) = socket();
        driver.on_input(DriverInput::Connected(stale, sink, stream)).await;
        assert_eq!(driver.state(), ClientState::Connecting);

        let (sink, stream, _peer) = socket();
        driver
            .on_input(DriverInput::Connected(driver.generation, sink, stream))
            .await;
        assert_eq!(driver.state(), ClientState::Active);
    }

    #[tokio::test]
    async fn test_server_close_while_active_returns_to_idle() {
        let (mut driver, backend) = driver();
        let _peer = active(&mut driver).await;
        assert!(driver.scheduler.is_some());

        driver
            .on_input(DriverInput::Audio(driver.generation, Bytes::from(vec![0u8; 480])))
            .await;
        assert_eq!(backend.output.lock().scheduled, 1);

        driver.on_input(DriverInput::Closed(driver.generation)).await;

        assert_eq!(driver.state(), ClientState::Idle);
        assert_eq!(driver.status(), crate::client::state::STATUS_CLOSED);
        assert!(driver.scheduler.is_none());
        assert_eq!(backend.output.lock().flushes, 1);
        assert!(backend.mic.lock().stopped);
        assert!(!driver.streaming);
    }

    #[tokio::test]
    async fn test_audio_from_stale_generation_is_ignored() {
        let (mut driver, backend) = driver();
        let _peer = active(&mut driver).await;

        driver
            .on_input(DriverInput::Audio(driver.generation - 1, Bytes::from(vec![0u8; 480])))
            .await;
        assert_eq!(backend.output.lock().scheduled, 0);
    }

    #[tokio::test]
    async fn test_recorded_fragments_reach_the_transport() {
        let (mut driver, backend) = driver();
        let mut peer = active(&mut driver).await;
        assert!(driver.streaming);

        // One timeslice of captured audio
        backend.mic.lock().samples = vec![0.1; CAPTURE_SAMPLE_RATE as usize / 4];
        driver.pump_capture().await;

        let Some(Message::Binary(fragment)) = peer.sent.next().await else {
            panic!("expected a binary fragment");
        };
        let elements = WebmDemuxer::new().feed(&fragment).unwrap();
        assert!(elements.iter().filter(|e| e.is_block()).count() > 0);
    }

    #[tokio::test]
    async fn test_close_timeout_forces_idle() {
        let (mut driver, _backend) = driver();
        let _peer = active(&mut driver).await;

        driver.dispatch(ClientEvent::StopRequested).await;
        assert_eq!(driver.state(), ClientState::Stopping);
        let deadline = driver.close_deadline.expect("deadline set while stopping");
        assert!(deadline <= Instant::now() + CLOSE_TIMEOUT);

        // The relay never acknowledges
        driver.on_close_timeout().await;
        assert_eq!(driver.state(), ClientState::Idle);
        assert!(driver.close_deadline.is_none());

        // A late close report for the old socket changes nothing
        driver.on_input(DriverInput::Closed(driver.generation - 1)).await;
        assert_eq!(driver.state(), ClientState::Idle);

        driver.dispatch(driver.machine.toggle_event()).await;
        assert_eq!(driver.state(), ClientState::Connecting);
    }
}
