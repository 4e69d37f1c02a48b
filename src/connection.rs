//! Socket lifecycle: connect, handshake, dispatch, reconnect.
//!
//! ```text
//! Connecting ──open──▶ Open ──close──▶ Closed ──timeout──▶ Connecting
//!                        │                ▲
//!                        └──error──▶ Errored
//! ```
//!
//! There is no terminal state. A closed socket is retried after a fixed
//! timeout, forever, with the same URL. Everything happens inside
//! [`Connection::poll`], which the owner calls with the time elapsed since
//! it started.

use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::TransportError;
use crate::loader::GltfLoader;
use crate::protocol::handshake_frame;
use crate::scene_graph::SceneRegistry;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(String),
    Close(String),
    Error(String),
}

/// A WebSocket-like transport. Connection attempts and incoming data are
/// reported through [`poll_event`](Transport::poll_event) in arrival order.
pub trait Transport {
    /// Start a connection attempt. `Ok` means the attempt is under way; the
    /// transport reports `Open` (or `Close`/`Error`) later.
    fn open(&mut self, url: &str) -> Result<(), TransportError>;

    fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the socket if one is open. Must be safe to call repeatedly.
    fn close(&mut self);

    /// Next pending event, or `None` if nothing is ready.
    fn poll_event(&mut self) -> Option<SocketEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Errored,
    /// `reconnect_at` is `None` once the connection has been destroyed.
    Closed { reconnect_at: Option<Duration> },
}

pub struct Connection<T, L> {
    config: ConnectionConfig,
    transport: T,
    dispatcher: Dispatcher<L>,
    state: ConnectionState,
    connect_attempts: u32,
    frames_handled: u64,
    parse_errors: u64,
    destroyed: bool,
}

impl<T: Transport, L: GltfLoader> Connection<T, L> {
    /// Create the connection and start the first attempt. Times passed to
    /// [`poll`](Self::poll) are measured from this call.
    pub fn new(config: ConnectionConfig, transport: T, dispatcher: Dispatcher<L>) -> Self {
        let mut connection = Self {
            config,
            transport,
            dispatcher,
            state: ConnectionState::Connecting,
            connect_attempts: 0,
            frames_handled: 0,
            parse_errors: 0,
            destroyed: false,
        };
        connection.connect(Duration::ZERO);
        connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Number of connection attempts made, including the first.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Frames that decoded and were dispatched.
    pub fn frames_handled(&self) -> u64 {
        self.frames_handled
    }

    /// Frames dropped because they were not a JSON object.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    pub fn next_reconnect(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Closed { reconnect_at } => reconnect_at,
            _ => None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn dispatcher(&self) -> &Dispatcher<L> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<L> {
        &mut self.dispatcher
    }

    fn connect(&mut self, now: Duration) {
        self.state = ConnectionState::Connecting;
        self.connect_attempts += 1;
        log::info!("Connecting to {} (attempt {})", self.config.url, self.connect_attempts);

        if let Err(e) = self.transport.open(&self.config.url) {
            log::warn!("{}", e);
            self.on_close(now, &e.to_string());
        }
    }

    /// Run one cooperative step: fire a due reconnect, drain socket events in
    /// order, then apply finished GLTF loads. Returns one report per frame
    /// dispatched, plus one for loads if any completed.
    pub fn poll(&mut self, now: Duration, registry: &mut SceneRegistry) -> Vec<DispatchReport> {
        let mut reports = Vec::new();
        if self.destroyed {
            return reports;
        }

        if let ConnectionState::Closed { reconnect_at: Some(at) } = self.state {
            if now >= at {
                self.connect(now);
            }
        }

        while let Some(event) = self.transport.poll_event() {
            if let Some(report) = self.on_event(now, event, registry) {
                reports.push(report);
            }
        }

        let loads = self.dispatcher.poll_loads(registry);
        if !loads.is_empty() {
            reports.push(loads);
        }
        reports
    }

    fn on_event(&mut self, now: Duration, event: SocketEvent, registry: &mut SceneRegistry) -> Option<DispatchReport> {
        match event {
            SocketEvent::Open => {
                log::info!("Connected to {}", self.config.url);
                self.state = ConnectionState::Open;
                let frame = handshake_frame(&self.config.client_name);
                if let Err(e) = self.transport.send(&frame) {
                    self.on_error(now, &e.to_string());
                }
                None
            }
            SocketEvent::Message(text) => {
                log::debug!("Got message: {}", text);
                match self.dispatcher.handle_frame(registry, &text) {
                    Ok(report) => {
                        self.frames_handled += 1;
                        Some(report)
                    }
                    Err(e) => {
                        self.parse_errors += 1;
                        log::warn!("Dropping frame: {}", e);
                        None
                    }
                }
            }
            SocketEvent::Close(reason) => {
                self.on_close(now, &reason);
                None
            }
            SocketEvent::Error(reason) => {
                self.on_error(now, &reason);
                None
            }
        }
    }

    fn on_error(&mut self, now: Duration, reason: &str) {
        log::warn!("Socket encountered error, closing: {}", reason);
        self.state = ConnectionState::Errored;
        self.transport.close();
        self.on_close(now, reason);
    }

    fn on_close(&mut self, now: Duration, reason: &str) {
        if matches!(self.state, ConnectionState::Closed { .. }) {
            log::debug!("Ignoring repeated close: {}", reason);
            return;
        }
        let timeout = self.config.reconnect_timeout();
        log::info!(
            "Socket is closed. Reconnect will be attempted in {} ms. Reason: {}",
            timeout.as_millis(),
            reason
        );
        self.state = ConnectionState::Closed {
            reconnect_at: Some(now + timeout),
        };
    }

    /// Close the socket and cancel any pending reconnect. Later polls do nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        log::info!("Closing connection to {}", self.config.url);
        self.destroyed = true;
        self.transport.close();
        self.state = ConnectionState::Closed { reconnect_at: None };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ManualLoader;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockTransport {
        opened: Vec<String>,
        sent: Vec<String>,
        closes: usize,
        events: VecDeque<SocketEvent>,
        refuse: bool,
    }

    impl Transport for MockTransport {
        fn open(&mut self, url: &str) -> Result<(), TransportError> {
            self.opened.push(url.to_string());
            if self.refuse {
                return Err(TransportError::Connect {
                    url: url.to_string(),
                    reason: "refused".into(),
                });
            }
            self.events.push_back(SocketEvent::Open);
            Ok(())
        }

        fn send(&mut self, text: &str) -> Result<(), TransportError> {
            self.sent.push(text.to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
        }

        fn poll_event(&mut self) -> Option<SocketEvent> {
            self.events.pop_front()
        }
    }

    fn connection(transport: MockTransport) -> Connection<MockTransport, ManualLoader> {
        Connection::new(
            ConnectionConfig::default(),
            transport,
            Dispatcher::new(ManualLoader::new()),
        )
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_open_sends_handshake() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport::default());
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.poll(ms(0), &mut registry);
        assert!(conn.is_open());
        assert_eq!(conn.transport().sent, vec![r#"{"type":"init","client":"visualizer"}"#.to_string()]);
    }

    #[test]
    fn test_bad_frame_keeps_socket_open() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport::default());
        conn.transport_mut().events.push_back(SocketEvent::Message("not json".into()));
        conn.transport_mut().events.push_back(SocketEvent::Message(r#"{"noop": true}"#.into()));

        let reports = conn.poll(ms(0), &mut registry);
        assert!(conn.is_open());
        assert_eq!(conn.parse_errors(), 1);
        assert_eq!(conn.frames_handled(), 1);
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_close_reconnects_once_after_timeout() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport::default());
        conn.poll(ms(0), &mut registry);

        conn.transport_mut().events.push_back(SocketEvent::Close("server restart".into()));
        conn.transport_mut().events.push_back(SocketEvent::Close("duplicate".into()));
        conn.poll(ms(100), &mut registry);
        assert_eq!(conn.next_reconnect(), Some(ms(1100)));

        conn.poll(ms(1099), &mut registry);
        assert_eq!(conn.connect_attempts(), 1);

        conn.poll(ms(1100), &mut registry);
        assert_eq!(conn.connect_attempts(), 2);
        assert!(conn.is_open());
        assert_eq!(conn.transport().sent.len(), 2);
        assert_eq!(conn.transport().opened, vec!["ws://localhost:8001/"; 2]);
    }

    #[test]
    fn test_error_forces_close() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport::default());
        conn.poll(ms(0), &mut registry);

        conn.transport_mut().events.push_back(SocketEvent::Error("reset".into()));
        conn.transport_mut().events.push_back(SocketEvent::Close("reset".into()));
        conn.poll(ms(10), &mut registry);

        assert_eq!(conn.transport().closes, 1);
        assert_eq!(conn.state(), ConnectionState::Closed { reconnect_at: Some(ms(1010)) });
    }

    #[test]
    fn test_refused_connect_retries() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport {
            refuse: true,
            ..Default::default()
        });
        assert_eq!(conn.next_reconnect(), Some(ms(1000)));

        conn.poll(ms(1000), &mut registry);
        assert_eq!(conn.connect_attempts(), 2);
        assert_eq!(conn.next_reconnect(), Some(ms(2000)));
    }

    #[test]
    fn test_destroy_cancels_reconnect() {
        let mut registry = SceneRegistry::new();
        let mut conn = connection(MockTransport::default());
        conn.poll(ms(0), &mut registry);
        conn.transport_mut().events.push_back(SocketEvent::Close("bye".into()));
        conn.poll(ms(5), &mut registry);

        conn.destroy();
        conn.poll(ms(5000), &mut registry);
        assert_eq!(conn.connect_attempts(), 1);
        assert_eq!(conn.next_reconnect(), None);
        assert_eq!(conn.transport().closes, 1);
    }
}
