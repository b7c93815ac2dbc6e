//! Client conversation state machine
//!
//! Pure transitions: the driver feeds events in and performs the returned
//! actions. The microphone is acquired before the transport is opened, so
//! a capture failure never opens a connection.
//!
//! ```text
//!          StartRequested            CaptureReady           TransportOpened
//!  Idle ─────────────────► Connecting ───(OpenTransport)───────────────► Active
//!   ▲                          │                                            │
//!   │      CaptureFailed /     │ StopRequested              StopRequested   │
//!   ├──── TransportFailed ─────┤                                            ▼
//!   │                          └──────────────────────► Stopping ◄──────────┘
//!   └──────── TransportClosed / TransportFailed / CloseTimedOut ─┘
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Active,
    Stopping,
}

/// Why the microphone could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailure {
    Denied,
    /// No usable recording or encoding format
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    StartRequested,
    CaptureReady,
    CaptureFailed(CaptureFailure),
    TransportOpened,
    TransportClosed,
    TransportFailed,
    StopRequested,
    /// The transport did not confirm its close in time
    CloseTimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    AcquireMicrophone,
    OpenTransport,
    StartPlayback,
    StartStreaming,
    ReleaseMicrophone,
    CloseTransport,
    StopPlayback,
}

pub const STATUS_IDLE: &str = "Status: Idle";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_CONNECTED: &str = "Connected. Start speaking...";
pub const STATUS_STOPPING: &str = "Stopping...";
pub const STATUS_CLOSED: &str = "Connection closed.";
pub const STATUS_CONNECT_ERROR: &str = "Error: Could not connect.";
pub const STATUS_MIC_DENIED: &str = "Error: Microphone access denied.";
pub const STATUS_UNSUPPORTED: &str = "Error: Recording format not supported.";

/// Conversation lifecycle with the resources each state holds
#[derive(Debug, Clone)]
pub struct ClientMachine {
    state: ClientState,
    status: &'static str,
    microphone: bool,
    /// Transport requested or open
    transport: bool,
    playback: bool,
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMachine {
    pub fn new() -> Self {
        Self {
            state: ClientState::Idle,
            status: STATUS_IDLE,
            microphone: false,
            transport: false,
            playback: false,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// User-visible status line
    pub fn status(&self) -> &'static str {
        self.status
    }

    /// Event for a single start/stop toggle
    pub fn toggle_event(&self) -> ClientEvent {
        match self.state {
            ClientState::Idle => ClientEvent::StartRequested,
            _ => ClientEvent::StopRequested,
        }
    }

    /// Apply one event and return the actions to perform, in order
    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientAction::*;
        use ClientEvent::*;
        use ClientState::*;

        let before = self.state;
        let actions = match (self.state, event) {
            (Idle, StartRequested) => {
                self.enter(Connecting, STATUS_CONNECTING);
                self.microphone = true;
                vec![AcquireMicrophone]
            }

            (Connecting, CaptureReady) => {
                self.transport = true;
                vec![OpenTransport]
            }
            (Connecting, CaptureFailed(failure)) => {
                let status = match failure {
                    CaptureFailure::Denied => STATUS_MIC_DENIED,
                    CaptureFailure::Unsupported => STATUS_UNSUPPORTED,
                };
                self.microphone = false;
                let actions = self.teardown();
                self.enter(Idle, status);
                actions
            }
            (Connecting, TransportOpened) => {
                self.enter(Active, STATUS_CONNECTED);
                self.playback = true;
                vec![StartPlayback, StartStreaming]
            }
            (Connecting | Active, TransportFailed) => {
                self.transport = false;
                let actions = self.teardown();
                self.enter(Idle, STATUS_CONNECT_ERROR);
                actions
            }
            (Connecting | Active, TransportClosed) => {
                self.transport = false;
                let actions = self.teardown();
                self.enter(Idle, STATUS_CLOSED);
                actions
            }
            (Connecting | Active, StopRequested) => {
                let actions = self.teardown();
                if self.transport {
                    self.enter(Stopping, STATUS_STOPPING);
                } else {
                    self.enter(Idle, STATUS_IDLE);
                }
                actions
            }

            // Late arrivals after a stop
            (Stopping, TransportOpened) => vec![CloseTransport],
            (Stopping | Idle, CaptureReady) => vec![ReleaseMicrophone],
            (Stopping, TransportClosed | TransportFailed | CloseTimedOut) => {
                self.transport = false;
                self.enter(Idle, STATUS_IDLE);
                Vec::new()
            }

            (state, event) => {
                tracing::debug!("Ignoring {:?} in {:?}", event, state);
                Vec::new()
            }
        };

        if self.state != before {
            tracing::debug!("Client {:?} -> {:?} on {:?}", before, self.state, event);
        }
        actions
    }

    fn enter(&mut self, state: ClientState, status: &'static str) {
        self.state = state;
        self.status = status;
    }

    /// Release everything currently held
    fn teardown(&mut self) -> Vec<ClientAction> {
        let mut actions = Vec::new();
        if self.microphone {
            actions.push(ClientAction::ReleaseMicrophone);
            self.microphone = false;
        }
        if self.playback {
            actions.push(ClientAction::StopPlayback);
            self.playback = false;
        }
        if self.transport {
            actions.push(ClientAction::CloseTransport);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientAction::*;
    use ClientEvent::*;

    fn active() -> ClientMachine {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);
        m.handle(CaptureReady);
        m.handle(TransportOpened);
        m
    }

    #[test]
    fn test_happy_path() {
        let mut m = ClientMachine::new();
        assert_eq!(m.handle(StartRequested), vec![AcquireMicrophone]);
        assert_eq!(m.state(), ClientState::Connecting);
        assert_eq!(m.status(), STATUS_CONNECTING);

        assert_eq!(m.handle(CaptureReady), vec![OpenTransport]);
        assert_eq!(m.handle(TransportOpened), vec![StartPlayback, StartStreaming]);
        assert_eq!(m.state(), ClientState::Active);
        assert_eq!(m.status(), STATUS_CONNECTED);

        assert_eq!(
            m.handle(StopRequested),
            vec![ReleaseMicrophone, StopPlayback, CloseTransport]
        );
        assert_eq!(m.state(), ClientState::Stopping);

        assert!(m.handle(TransportClosed).is_empty());
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.status(), STATUS_IDLE);
    }

    #[test]
    fn test_unsupported_encoding_never_opens_transport() {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);
        let actions = m.handle(CaptureFailed(CaptureFailure::Unsupported));

        assert!(!actions.contains(&OpenTransport));
        assert!(!actions.contains(&CloseTransport));
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.status(), STATUS_UNSUPPORTED);
    }

    #[test]
    fn test_microphone_denied() {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);
        m.handle(CaptureFailed(CaptureFailure::Denied));
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.status(), STATUS_MIC_DENIED);
    }

    #[test]
    fn test_stop_during_connect_then_late_open() {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);
        m.handle(CaptureReady);

        assert_eq!(m.handle(StopRequested), vec![ReleaseMicrophone, CloseTransport]);
        assert_eq!(m.state(), ClientState::Stopping);

        // The connection completes after the user gave up
        assert_eq!(m.handle(TransportOpened), vec![CloseTransport]);
        assert_eq!(m.state(), ClientState::Stopping);

        m.handle(TransportClosed);
        assert_eq!(m.state(), ClientState::Idle);
    }

    #[test]
    fn test_stop_before_capture_is_ready() {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);

        assert_eq!(m.handle(StopRequested), vec![ReleaseMicrophone]);
        assert_eq!(m.state(), ClientState::Idle);

        // A capture that completes late is released straight away
        assert_eq!(m.handle(CaptureReady), vec![ReleaseMicrophone]);
        assert_eq!(m.state(), ClientState::Idle);
    }

    #[test]
    fn test_remote_close_while_active() {
        let mut m = active();
        assert_eq!(m.handle(TransportClosed), vec![ReleaseMicrophone, StopPlayback]);
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.status(), STATUS_CLOSED);
    }

    #[test]
    fn test_connect_failure() {
        let mut m = ClientMachine::new();
        m.handle(StartRequested);
        m.handle(CaptureReady);
        assert_eq!(m.handle(TransportFailed), vec![ReleaseMicrophone]);
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.status(), STATUS_CONNECT_ERROR);
    }

    #[test]
    fn test_close_timeout_returns_to_idle() {
        let mut m = active();
        m.handle(StopRequested);
        assert_eq!(m.state(), ClientState::Stopping);
        assert_eq!(m.toggle_event(), StopRequested);

        assert!(m.handle(CloseTimedOut).is_empty());
        assert_eq!(m.state(), ClientState::Idle);
        assert_eq!(m.handle(StartRequested), vec![AcquireMicrophone]);
    }

    #[test]
    fn test_close_timeout_outside_stopping_is_ignored() {
        let mut m = active();
        assert!(m.handle(CloseTimedOut).is_empty());
        assert_eq!(m.state(), ClientState::Active);
    }

    #[test]
    fn test_toggle() {
        let mut m = ClientMachine::new();
        assert_eq!(m.toggle_event(), StartRequested);
        m.handle(StartRequested);
        assert_eq!(m.toggle_event(), StopRequested);
    }

    #[test]
    fn test_start_ignored_while_busy() {
        let mut m = active();
        assert!(m.handle(StartRequested).is_empty());
        assert_eq!(m.state(), ClientState::Active);
    }
}
