//! Server façade: accepts upgraded transports, wires channels into the
//! registries, and exposes the broadcast/query surface.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::channel::{Channel, RequestInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::{event, HandlerRegistry, HandlerResult};
use crate::protocol::{codec, Frame, Message, OpenHeader, DEFAULT_NSP};
use crate::registry::{RoomRegistry, SessionRegistry};
use crate::transport::{split_socket, Transport};

/// The server. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Server {
    state: Arc<ServerState>,
}

pub(crate) struct ServerState {
    config: Config,
    headers: RwLock<HashMap<String, String>>,
    pub(crate) rooms: RoomRegistry,
    pub(crate) sids: SessionRegistry,
    pub(crate) handlers: HandlerRegistry,
    transport: RwLock<Transport>,
}

impl Server {
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, Config::default())
    }

    pub fn with_config(transport: Transport, config: Config) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                headers: RwLock::new(HashMap::new()),
                rooms: RoomRegistry::new(),
                sids: SessionRegistry::new(),
                handlers: HandlerRegistry::new(),
                transport: RwLock::new(transport),
            }),
        }
    }

    /// Register a handler for a wire event or one of the reserved
    /// pseudo-events (`connection`, `disconnection`, `error`). Setup-time
    /// only: registration is ignored once the server accepts connections.
    pub fn on<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Arc<Channel>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.state.handlers.on(name, handler);
    }

    /// Build the router serving the WebSocket mount point. Freezes the
    /// handler registry: the server is now accepting.
    pub fn router(&self) -> Router {
        self.state.handlers.freeze();
        Router::new()
            .route(&self.state.config.path, get(ws_upgrade))
            .with_state(self.state.clone())
    }

    pub fn get(&self, sid: &str) -> Result<Arc<Channel>> {
        self.state.sids.get(sid).ok_or(Error::ConnectionNotFound)
    }

    /// Broadcast an EVENT to every member of `room`.
    pub fn broadcast_to(&self, room: &str, method: &str, args: Vec<Value>) {
        self.state.broadcast_to_room(room, method, args, None);
    }

    /// Broadcast an EVENT to every live channel.
    pub fn broadcast_all(&self, method: &str, args: Vec<Value>) {
        self.state.broadcast_all(method, args);
    }

    pub fn amount(&self, room: &str) -> usize {
        self.state.rooms.count(room)
    }

    pub fn amount_of_sids(&self) -> usize {
        self.state.sids.len()
    }

    pub fn amount_of_rooms(&self) -> usize {
        self.state.rooms.count_rooms()
    }

    /// Set the two CORS response headers for `domain`.
    pub fn enable_cors(&self, domain: &str) {
        let mut headers = self.state.headers.write();
        headers.insert("Access-Control-Allow-Origin".to_string(), domain.to_string());
        headers.insert(
            "Access-Control-Allow-Credentials".to_string(),
            "true".to_string(),
        );
    }

    /// Add a header sent on every response from the mount point.
    pub fn add_header(&self, name: &str, value: &str) {
        self.state
            .headers
            .write()
            .insert(name.to_string(), value.to_string());
    }

    /// Swap the negotiated transport used for future connections.
    pub fn update_transport(&self, transport: Transport) {
        *self.state.transport.write() = transport;
    }
}

impl ServerState {
    /// Snapshot the room under the read lock, then spawn one emission task
    /// per living recipient with no lock held.
    pub(crate) fn broadcast_to_room(
        &self,
        room: &str,
        method: &str,
        args: Vec<Value>,
        skip_sid: Option<&str>,
    ) {
        let members = self.rooms.members(room);
        self.dispatch_emissions(members, method, args, skip_sid);
    }

    pub(crate) fn broadcast_all(&self, method: &str, args: Vec<Value>) {
        let members = self.sids.snapshot();
        self.dispatch_emissions(members, method, args, None);
    }

    fn dispatch_emissions(
        &self,
        members: Vec<Arc<Channel>>,
        method: &str,
        args: Vec<Value>,
        skip_sid: Option<&str>,
    ) {
        for channel in members {
            if !channel.is_alive() || skip_sid == Some(channel.id()) {
                continue;
            }
            let method = method.to_string();
            let args = args.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.emit(&method, args).await {
                    tracing::debug!(sid = %channel.id(), error = %e, "broadcast emit dropped");
                }
            });
        }
    }

    /// Remove every trace of the channel: room memberships first, then the
    /// sid entry.
    pub(crate) fn disconnect_cleanup(&self, sid: &str) {
        self.rooms.remove_channel(sid);
        self.sids.remove(sid);
    }

    /// Dispatch a pseudo-event to its registered handler, if any.
    pub(crate) fn fire_event(self: Arc<Self>, name: &str, channel: Arc<Channel>, args: Vec<Value>) {
        let Some(handler) = self.handlers.get(name) else {
            return;
        };
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = handler(channel.clone(), args).await {
                if name == event::ERROR {
                    tracing::warn!(sid = %channel.id(), error = %e, "error handler failed");
                } else {
                    self.report_handler_error(channel, &name, &e);
                }
            }
        });
    }

    /// Route a failed user callback to the `error` pseudo-event. The
    /// channel stays alive.
    pub(crate) fn report_handler_error(
        self: Arc<Self>,
        channel: Arc<Channel>,
        method: &str,
        err: &Error,
    ) {
        tracing::debug!(sid = %channel.id(), method, error = %err, "handler failed");
        self.fire_event(
            event::ERROR,
            channel,
            vec![json!(method), json!(err.to_string())],
        );
    }
}

async fn ws_upgrade(
    State(state): State<Arc<ServerState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let peer_addr = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "0.0.0.0:0".to_string());

    let mut response = match ws {
        Some(upgrade) => {
            let request = RequestInfo {
                uri: uri.to_string(),
                headers,
                peer_addr,
            };
            let state = state.clone();
            upgrade
                .on_upgrade(move |socket| handle_socket(state, socket, request))
                .into_response()
        }
        None => StatusCode::BAD_REQUEST.into_response(),
    };

    apply_headers(&state.headers.read(), &mut response);
    response
}

fn apply_headers(configured: &HashMap<String, String>, response: &mut Response) {
    for (name, value) in configured {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = %name, "invalid configured header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(header = %name, "invalid configured header value");
            continue;
        };
        response.headers_mut().insert(name, value);
    }
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, request: RequestInfo) {
    let transport = state.transport.read().clone();
    let (read, write) = split_socket(socket);
    let sid = generate_sid(&request.peer_addr);
    let peer = request.peer_addr.clone();

    let (out_tx, out_rx) = mpsc::channel(state.config.outbound_queue);
    let channel = Channel::new(sid, transport.clone(), request, out_tx);
    channel.attach(Arc::downgrade(&state));

    state.sids.insert(channel.clone());

    if let Err(e) = send_open_sequence(&channel, &transport) {
        tracing::warn!(sid = %channel.id(), error = %e, "open sequence failed");
        channel.terminate("open sequence failed");
        return;
    }

    channel.spawn_workers(read, write, out_rx);
    channel.fire_connection_once();
    tracing::info!(sid = %channel.id(), %peer, "channel connected");
}

/// The open sequence: the handshake header, then the CONNECT carrying the
/// sid on the default namespace. On a binary transport the CONNECT goes out
/// as a MessagePack record; the header frame is text either way.
fn send_open_sequence(channel: &Arc<Channel>, transport: &Transport) -> Result<()> {
    let (interval, timeout) = transport.ping_params();
    let header = OpenHeader {
        sid: channel.id().to_string(),
        upgrades: Vec::new(),
        ping_interval: interval.as_millis() as u64,
        ping_timeout: timeout.as_millis() as u64,
    };
    channel.enqueue_frame(Frame::Text(codec::encode_open(&header)?))?;

    let connect = Message::connect(DEFAULT_NSP, Some(json!({ "sid": channel.id() })));
    channel.enqueue_packet(connect)
}

/// Session id: MD5 over (peer address, now, two random words), url-safe
/// base64, truncated to 20 characters.
fn generate_sid(seed: &str) -> String {
    let raw = format!(
        "{seed} {:?} {} {}",
        std::time::SystemTime::now(),
        rand::random::<u32>(),
        rand::random::<u32>()
    );
    let digest = md5::compute(raw.as_bytes());
    URL_SAFE.encode(digest.0)[..20].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_is_twenty_url_safe_chars() {
        let sid = generate_sid("127.0.0.1:5000");
        assert_eq!(sid.len(), 20);
        assert!(sid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
        assert_ne!(sid, generate_sid("127.0.0.1:5000"));
    }

    #[test]
    fn enable_cors_sets_exactly_the_two_headers() {
        let server = Server::new(Transport::v4());
        server.enable_cors("https://app.example");

        let headers = server.state.headers.read();
        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("Access-Control-Allow-Origin").map(String::as_str),
            Some("https://app.example")
        );
        assert_eq!(
            headers
                .get("Access-Control-Allow-Credentials")
                .map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn add_header_does_not_clobber_cors() {
        let server = Server::new(Transport::v4());
        server.enable_cors("*");
        server.add_header("X-Backend", "wavelink");

        let mut response = Response::new(axum::body::Body::empty());
        apply_headers(&server.state.headers.read(), &mut response);

        assert_eq!(
            response.headers().get("Access-Control-Allow-Origin").unwrap(),
            "*"
        );
        assert_eq!(
            response
                .headers()
                .get("Access-Control-Allow-Credentials")
                .unwrap(),
            "true"
        );
        assert_eq!(response.headers().get("X-Backend").unwrap(), "wavelink");
    }

    #[test]
    fn get_unknown_sid_is_connection_not_found() {
        let server = Server::new(Transport::v4());
        assert!(matches!(server.get("nope"), Err(Error::ConnectionNotFound)));
    }
}
