//! Native runtime: a blocking `tungstenite` transport and the loop that
//! drives a [`Connection`].
//!
//! The socket gets a short read timeout so one thread can interleave frame
//! reads with reconnect timers, GLTF completions and camera/animation updates.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, SocketEvent, Transport};
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::TransportError;
use crate::gltf_import::FileGltfLoader;
use crate::scene_graph::SceneRegistry;

/// How long a read may block before the loop gets control back.
pub const READ_TIMEOUT: Duration = Duration::from_millis(16);

/// Sleep between iterations while there is no socket to block on.
const IDLE_SLEEP: Duration = Duration::from_millis(16);

pub struct TungsteniteTransport {
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
    events: VecDeque<SocketEvent>,
    read_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            socket: None,
            events: VecDeque::new(),
            read_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(READ_TIMEOUT)
    }
}

impl Transport for TungsteniteTransport {
    fn open(&mut self, url: &str) -> Result<(), TransportError> {
        self.close();
        let (socket, _response) = tungstenite::connect(url).map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            if let Err(e) = stream.set_read_timeout(Some(self.read_timeout)) {
                log::warn!("Failed to set socket read timeout: {}", e);
            }
        }
        self.socket = Some(socket);
        self.events.push_back(SocketEvent::Open);
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;
        socket
            .send(Message::Text(text.into()))
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            // Best effort; the peer may already be gone
            let _ = socket.close(None);
            let _ = socket.flush();
        }
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        let socket = self.socket.as_mut()?;

        match socket.read() {
            Ok(Message::Text(text)) => Some(SocketEvent::Message(text.to_string())),
            Ok(Message::Binary(data)) => {
                log::debug!("Ignoring {} byte binary frame", data.len());
                None
            }
            Ok(Message::Close(frame)) => {
                self.socket = None;
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                Some(SocketEvent::Close(reason))
            }
            // Ping/pong are answered inside tungstenite
            Ok(_) => None,
            Err(tungstenite::Error::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                self.socket = None;
                Some(SocketEvent::Close("connection closed".to_string()))
            }
            Err(e) => Some(SocketEvent::Error(e.to_string())),
        }
    }
}

/// Connect and keep the registry in sync until `max_duration` elapses (or
/// forever).
pub fn run(config: ConnectionConfig, max_duration: Option<Duration>) -> Result<SceneRegistry> {
    let mut registry = SceneRegistry::new();
    let loader = FileGltfLoader::new(config.asset_root.clone());
    let mut connection = Connection::new(config, TungsteniteTransport::default(), Dispatcher::new(loader));

    let start = Instant::now();
    let mut last = start;
    loop {
        let now = Instant::now();
        let elapsed = now - start;
        if max_duration.is_some_and(|limit| elapsed >= limit) {
            break;
        }

        connection.poll(elapsed, &mut registry);
        registry.advance((now - last).as_secs_f32());
        last = now;

        if registry.take_update() {
            log::trace!("Scene changed ({} objects)", registry.object_count());
        }
        if !connection.transport().is_connected() {
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    connection.destroy();
    Ok(registry)
}

/// Result of replaying a capture.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub frames: usize,
    pub parse_errors: usize,
    pub command_errors: usize,
    pub reports: Vec<DispatchReport>,
}

/// Apply a newline-delimited file of frames to `registry`, waiting up to
/// `load_timeout` for any GLTF loads it started.
pub fn replay(
    path: &Path,
    asset_root: Option<&Path>,
    registry: &mut SceneRegistry,
    load_timeout: Duration,
) -> Result<ReplaySummary> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut dispatcher = Dispatcher::new(FileGltfLoader::new(asset_root.map(Path::to_path_buf)));
    let mut summary = ReplaySummary::default();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        summary.frames += 1;
        match dispatcher.handle_frame(registry, line) {
            Ok(report) => {
                summary.command_errors += report.errors().count();
                summary.reports.push(report);
            }
            Err(e) => {
                log::warn!("Frame {}: {}", summary.frames, e);
                summary.parse_errors += 1;
            }
        }
    }

    let deadline = Instant::now() + load_timeout;
    while dispatcher.pending_loads() > 0 {
        if Instant::now() >= deadline {
            log::warn!("Gave up waiting for {} GLTF loads", dispatcher.pending_loads());
            break;
        }
        let report = dispatcher.poll_loads(registry);
        if report.is_empty() {
            std::thread::sleep(IDLE_SLEEP);
        } else {
            summary.command_errors += report.errors().count();
            summary.reports.push(report);
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_socket() {
        let mut transport = TungsteniteTransport::default();
        assert_eq!(transport.send("{}"), Err(TransportError::Closed));
        assert_eq!(transport.poll_event(), None);
        transport.close();
    }

    #[test]
    fn test_connect_refused() {
        // Port 9 (discard) is not expected to host a websocket server
        let mut transport = TungsteniteTransport::default();
        let err = transport.open("ws://127.0.0.1:9/").unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_replay_file() {
        let dir = std::env::temp_dir().join(format!("vizlink-replay-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"add_geometry": {"name": "g1", "type": "BoxGeometry"}}"#,
                "\n\n",
                "garbage\n",
                r#"{"add_material": {"name": "m1", "type": "MeshBasicMaterial", "color": 16711680}}"#,
                "\n",
                r#"{"add_mesh": {"name": "obj1", "geometry_name": "g1", "material_name": "m1", "parent_name": "nope"}}"#,
                "\n",
            ),
        )
        .unwrap();

        let mut registry = SceneRegistry::new();
        let summary = replay(&path, None, &mut registry, Duration::from_secs(1)).unwrap();
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.command_errors, 1);
        assert!(registry.contains("m1"));
        assert!(!registry.contains("obj1"));
    }
}
