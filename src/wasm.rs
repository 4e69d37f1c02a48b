use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{CloseEvent, Event, MessageEvent, Response, WebSocket};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionState, SocketEvent, Transport};
use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::gltf_import::{asset_url, import_event, import_slice, url_file_stem};
use crate::loader::{GltfLoader, LoadEvent, LoadId};
use crate::scene_graph::SceneRegistry;

type EventQueue = Rc<RefCell<VecDeque<SocketEvent>>>;

/// Browser WebSocket. Callbacks only queue events; the connection drains
/// them from `tick`.
struct BrowserSocket {
    socket: WebSocket,
    _on_open: Closure<dyn FnMut()>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
    _on_error: Closure<dyn FnMut(Event)>,
}

#[derive(Default)]
pub struct WebSocketTransport {
    current: Option<BrowserSocket>,
    events: EventQueue,
}

impl Transport for WebSocketTransport {
    fn open(&mut self, url: &str) -> Result<(), TransportError> {
        self.close();
        let socket = WebSocket::new(url).map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: format!("{:?}", e),
        })?;

        let events = self.events.clone();
        let on_open = Closure::<dyn FnMut()>::new(move || {
            events.borrow_mut().push_back(SocketEvent::Open);
        });
        let events = self.events.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |e: MessageEvent| match e.data().as_string() {
            Some(text) => events.borrow_mut().push_back(SocketEvent::Message(text)),
            None => log::debug!("Ignoring non-text frame"),
        });
        let events = self.events.clone();
        let on_close = Closure::<dyn FnMut(CloseEvent)>::new(move |e: CloseEvent| {
            events.borrow_mut().push_back(SocketEvent::Close(e.reason()));
        });
        let events = self.events.clone();
        let on_error = Closure::<dyn FnMut(Event)>::new(move |e: Event| {
            events.borrow_mut().push_back(SocketEvent::Error(e.type_()));
        });

        socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));
        socket.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        self.current = Some(BrowserSocket {
            socket,
            _on_open: on_open,
            _on_message: on_message,
            _on_close: on_close,
            _on_error: on_error,
        });
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let current = self.current.as_ref().ok_or(TransportError::Closed)?;
        current
            .socket
            .send_with_str(text)
            .map_err(|e| TransportError::Send(format!("{:?}", e)))
    }

    fn close(&mut self) {
        if let Some(current) = self.current.take() {
            // Detach first so the dropped closures are never invoked
            current.socket.set_onopen(None);
            current.socket.set_onmessage(None);
            current.socket.set_onclose(None);
            current.socket.set_onerror(None);
            let _ = current.socket.close();
        }
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.borrow_mut().pop_front()
    }
}

type LoadQueue = Rc<RefCell<VecDeque<LoadEvent>>>;

/// GLTF loader backed by `fetch`. Relative paths are resolved against
/// `base_url`; responses are parsed as `.glb` or self-contained `.gltf`.
#[derive(Default)]
pub struct FetchGltfLoader {
    base_url: Option<String>,
    events: LoadQueue,
}

impl FetchGltfLoader {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url,
            events: LoadQueue::default(),
        }
    }

}

impl GltfLoader for FetchGltfLoader {
    fn load(&mut self, id: LoadId, path: &str) {
        let url = asset_url(self.base_url.as_deref(), path);
        let events = self.events.clone();
        log::info!("Fetching GLTF {:?} from {}", id, url);

        wasm_bindgen_futures::spawn_local(async move {
            let event = match fetch_bytes(&url).await {
                Ok(bytes) => {
                    let size = bytes.len() as u64;
                    events.borrow_mut().push_back(LoadEvent::Progress {
                        id,
                        loaded: size,
                        total: Some(size),
                    });
                    import_event(id, || import_slice(&bytes, url_file_stem(&url)))
                }
                Err(e) => LoadEvent::Failed {
                    id,
                    reason: format!("fetching {} failed: {}", url, describe_js_error(&e)),
                },
            };
            events.borrow_mut().push_back(event);
        });
    }

    fn poll(&mut self) -> Vec<LoadEvent> {
        self.events.borrow_mut().drain(..).collect()
    }
}

async fn fetch_bytes(url: &str) -> Result<Vec<u8>, JsValue> {
    let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
    let response: Response = JsFuture::from(window.fetch_with_str(url)).await?.dyn_into()?;
    if !response.ok() {
        return Err(JsValue::from_str(&format!("HTTP {}", response.status())));
    }
    let buffer = JsFuture::from(response.array_buffer()?).await?;
    Ok(js_sys::Uint8Array::new(&buffer).to_vec())
}

fn describe_js_error(e: &JsValue) -> String {
    e.as_string().unwrap_or_else(|| format!("{:?}", e))
}

#[wasm_bindgen]
pub fn init_panic_hook() {
    console_error_panic_hook::set_once();
    let _ = console_log::init_with_level(log::Level::Info);
}

#[derive(Serialize)]
struct ObjectSummary<'a> {
    name: &'a str,
    kind: String,
    in_scene: bool,
}

/// Scene client driven from JavaScript's animation frame callback.
#[wasm_bindgen]
pub struct WasmClient {
    connection: Connection<WebSocketTransport, FetchGltfLoader>,
    registry: SceneRegistry,
    last_ms: Option<f64>,
}

#[wasm_bindgen]
impl WasmClient {
    /// Connect to `url`, or the default server when omitted. GLTF paths are
    /// fetched relative to `asset_base_url` when given.
    #[wasm_bindgen(constructor)]
    pub fn new(url: Option<String>, reconnect_timeout_ms: Option<u32>, asset_base_url: Option<String>) -> WasmClient {
        init_panic_hook();
        let mut config = url.map(ConnectionConfig::new).unwrap_or_default();
        if let Some(timeout) = reconnect_timeout_ms {
            config.reconnect_timeout_ms = u64::from(timeout);
        }
        log::info!("Rust client connecting to {}", config.url);

        WasmClient {
            connection: Connection::new(
                config,
                WebSocketTransport::default(),
                Dispatcher::new(FetchGltfLoader::new(asset_base_url)),
            ),
            registry: SceneRegistry::new(),
            last_ms: None,
        }
    }

    /// Process pending socket events and advance animations. `now_ms` is the
    /// `requestAnimationFrame` timestamp. Returns true if the scene needs a
    /// redraw.
    pub fn tick(&mut self, now_ms: f64) -> bool {
        let start = *self.last_ms.get_or_insert(now_ms);
        let dt = ((now_ms - start) / 1000.0) as f32;
        self.last_ms = Some(now_ms);

        let elapsed = std::time::Duration::from_secs_f64(now_ms.max(0.0) / 1000.0);
        self.connection.poll(elapsed, &mut self.registry);
        self.registry.advance(dt);
        self.registry.take_update()
    }

    pub fn is_open(&self) -> bool {
        self.connection.state() == ConnectionState::Open
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connection.connect_attempts()
    }

    /// Registered objects as a JSON array.
    pub fn objects_json(&self) -> String {
        let summaries: Vec<ObjectSummary> = self
            .registry
            .names()
            .into_iter()
            .filter_map(|name| {
                let id = self.registry.id_of(name)?;
                let object = self.registry.get(id)?;
                Some(ObjectSummary {
                    name,
                    kind: format!("{:?}", object.kind()),
                    in_scene: object.node().is_some() && self.registry.is_in_scene(id),
                })
            })
            .collect();
        serde_json::to_string(&summaries).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn destroy(&mut self) {
        self.connection.destroy();
    }
}
