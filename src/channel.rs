//! Per-peer session: the channel object, its worker tasks, and the
//! application-facing surface.
//!
//! While a channel is alive exactly two tasks service it (the inbound
//! reader and the outbound writer) plus, on v4, a ping scheduler. The
//! outbound queue is bounded and single-consumer, so frames reach the wire
//! in enqueue order. Teardown runs once: the first closer flips the
//! liveness state, releases the ACK waiters, and unhooks the registries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use axum::http::HeaderMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};

use crate::ack::AckRegistry;
use crate::error::{Error, Result};
use crate::handler::{ack_args, event};
use crate::liveness::Liveness;
use crate::protocol::{binary, codec, Decoded, Frame, Message, MessageKind, ProtocolVersion};
use crate::server::ServerState;
use crate::transport::{BoxFrameRead, BoxFrameWrite, Transport};

/// Header carrying the original client IP when the server sits behind a
/// proxy.
const HEADER_FORWARD: &str = "X-Forwarded-For";

/// Metadata captured from the upgrade request for the application to
/// inspect.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub uri: String,
    pub headers: HeaderMap,
    pub peer_addr: String,
}

/// One item on the outbound queue: a frame encoded ahead of time, or a
/// structured message the writer encodes just before the write.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    Packet(Message),
}

pub struct Channel {
    sid: String,
    transport: Transport,
    request: RequestInfo,
    out_tx: mpsc::Sender<Outbound>,
    acks: AckRegistry,
    liveness: Mutex<Liveness>,
    /// Level-triggered close signal; workers watch it so none can miss a
    /// teardown that races their own awaits.
    closed_tx: watch::Sender<bool>,
    /// Set once the `connection` pseudo-event has fired.
    connected: AtomicBool,
    /// Namespaces this peer has connected to, explicitly or by first packet.
    namespaces: Mutex<HashSet<String>>,
    /// When the last protocol-level PONG arrived (v4 liveness).
    last_pong: Mutex<Instant>,
    server: OnceLock<Weak<ServerState>>,
    self_ref: Weak<Channel>,
}

impl Channel {
    pub(crate) fn new(
        sid: String,
        transport: Transport,
        request: RequestInfo,
        out_tx: mpsc::Sender<Outbound>,
    ) -> Arc<Self> {
        let (interval, timeout) = transport.ping_params();
        let (closed_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            sid,
            transport,
            request,
            out_tx,
            acks: AckRegistry::new(),
            liveness: Mutex::new(Liveness::new(interval, timeout)),
            closed_tx,
            connected: AtomicBool::new(false),
            namespaces: Mutex::new(HashSet::new()),
            last_pong: Mutex::new(Instant::now()),
            server: OnceLock::new(),
            self_ref: weak.clone(),
        })
    }

    pub(crate) fn attach(&self, server: Weak<ServerState>) {
        let _ = self.server.set(server);
    }

    // -----------------------------------------------------------------
    // Application surface
    // -----------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.sid
    }

    /// Client IP: `X-Forwarded-For` when present, else the peer socket
    /// address.
    pub fn ip(&self) -> String {
        self.request
            .headers
            .get(HEADER_FORWARD)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.request.peer_addr.clone())
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.lock().is_alive()
    }

    /// Namespaces seen on this connection.
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().iter().cloned().collect()
    }

    /// Outstanding `emit_ack` waiters. Drops to zero on delivery, timeout,
    /// and close.
    pub fn pending_acks(&self) -> usize {
        self.acks.pending()
    }

    /// Send an EVENT to this peer.
    pub async fn emit(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.send_packet(Message::event(method, args)).await
    }

    /// Send an EVENT requesting a correlated reply, and await it for at
    /// most `timeout`. Resolves to the reply args as one JSON array.
    pub async fn emit_ack(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.acks.next_id();
        let (tx, rx) = oneshot::channel();
        self.acks.park(id, tx);

        let msg = Message::event(method, args).with_ack_id(id);
        if let Err(e) = self.send_packet(msg).await {
            self.acks.cancel(id);
            return Err(e);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Slot dropped: the channel closed underneath us.
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.acks.cancel(id);
                Err(Error::AckTimeout)
            }
        }
    }

    pub fn join(&self, room: &str) -> Result<()> {
        let server = self.server()?;
        let chan = self.arc()?;
        server.rooms.join(&chan, room);
        Ok(())
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        let server = self.server()?;
        server.rooms.leave(&self.sid, room);
        Ok(())
    }

    /// Member count of `room`; 0 when detached.
    pub fn amount(&self, room: &str) -> usize {
        self.server().map(|s| s.rooms.count(room)).unwrap_or(0)
    }

    /// Members of `room`; empty when detached.
    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.server()
            .map(|s| s.rooms.members(room))
            .unwrap_or_default()
    }

    /// Broadcast to a room, excluding this channel.
    pub fn broadcast_to(&self, room: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let server = self.server()?;
        server.broadcast_to_room(room, method, args, Some(&self.sid));
        Ok(())
    }

    /// Broadcast to every live channel on the server.
    pub fn broadcast_all(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let server = self.server()?;
        server.broadcast_all(method, args);
        Ok(())
    }

    /// Close this channel from application code.
    pub fn close(&self) {
        self.terminate("closed by application");
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn server(&self) -> Result<Arc<ServerState>> {
        self.server
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::ServerNotSet)
    }

    fn arc(&self) -> Result<Arc<Channel>> {
        self.self_ref.upgrade().ok_or(Error::Closed)
    }

    /// Fire the `connection` pseudo-event at most once.
    pub(crate) fn fire_connection_once(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let (Ok(server), Ok(chan)) = (self.server(), self.arc()) {
            server.fire_event(event::CONNECTION, chan, Vec::new());
        }
    }

    fn note_namespace(&self, nsp: &str) {
        self.namespaces.lock().insert(nsp.to_string());
    }

    /// Blocking (bounded) enqueue, used by application emits and handler
    /// replies.
    pub(crate) async fn send_packet(&self, msg: Message) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::Closed);
        }
        self.out_tx
            .send(Outbound::Packet(msg))
            .await
            .map_err(|_| Error::Closed)
    }

    /// Non-blocking enqueue for control frames and reader-side replies. A
    /// saturated queue closes the channel, like the original's overflow
    /// policy.
    fn enqueue(&self, item: Outbound) -> Result<()> {
        match self.out_tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(sid = %self.sid, "outbound queue saturated");
                self.terminate("outbound queue saturated");
                Err(Error::Closed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Closed),
        }
    }

    pub(crate) fn enqueue_frame(&self, frame: Frame) -> Result<()> {
        self.enqueue(Outbound::Frame(frame))
    }

    pub(crate) fn enqueue_packet(&self, msg: Message) -> Result<()> {
        self.enqueue(Outbound::Packet(msg))
    }

    /// Run the close sequence exactly once: flip to Closing, push a CLOSE
    /// frame, stop the workers, release ACK waiters, unhook registries,
    /// then fire `disconnection`.
    pub(crate) fn terminate(&self, reason: &str) {
        if !self.liveness.lock().begin_close() {
            return;
        }
        tracing::debug!(sid = %self.sid, reason, "channel closing");

        let _ = self
            .out_tx
            .try_send(Outbound::Frame(Frame::Text(codec::encode_close())));
        let _ = self.closed_tx.send(true);
        self.acks.fail_all();

        if let Ok(server) = self.server() {
            server.disconnect_cleanup(&self.sid);
        }
        self.liveness.lock().finish_close();

        if let (Ok(server), Ok(chan)) = (self.server(), self.arc()) {
            server.fire_event(event::DISCONNECTION, chan, Vec::new());
        }
    }

    // -----------------------------------------------------------------
    // Worker tasks
    // -----------------------------------------------------------------

    pub(crate) fn spawn_workers(
        &self,
        read: BoxFrameRead,
        write: BoxFrameWrite,
        out_rx: mpsc::Receiver<Outbound>,
    ) {
        let Ok(chan) = self.arc() else { return };

        let reader = chan.clone();
        tokio::spawn(async move { reader.read_loop(read).await });

        let writer = chan.clone();
        tokio::spawn(async move { writer.write_loop(write, out_rx).await });

        if self.transport.protocol == ProtocolVersion::V4 {
            tokio::spawn(async move { chan.ping_loop().await });
        }
    }

    async fn read_loop(self: Arc<Self>, mut read: BoxFrameRead) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            if *closed.borrow() || !self.is_alive() {
                break;
            }
            let deadline = self.liveness.lock().deadline();
            let frame = tokio::select! {
                _ = closed.changed() => continue,
                _ = time::sleep_until(deadline) => {
                    self.terminate("liveness deadline expired");
                    break;
                }
                frame = read.read_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if !self.handle_frame(frame) {
                        break;
                    }
                }
                Ok(None) => {
                    self.terminate("peer ended the stream");
                    break;
                }
                Err(e) => {
                    tracing::debug!(sid = %self.sid, error = %e, "read failed");
                    self.terminate("read error");
                    break;
                }
            }
        }
    }

    /// Dispatch one inbound frame. Returns false when the reader should
    /// exit.
    fn handle_frame(&self, frame: Frame) -> bool {
        let decoded = match codec::decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Decode errors are local: drop the frame, stay alive.
                tracing::warn!(sid = %self.sid, error = %e, "dropping undecodable frame");
                return true;
            }
        };

        match decoded {
            Decoded::Ping(data) => {
                self.liveness.lock().refresh();
                self.enqueue_frame(Frame::Text(codec::encode_pong(&data)))
                    .is_ok()
            }
            Decoded::Pong(_) => {
                self.liveness.lock().refresh();
                *self.last_pong.lock() = Instant::now();
                true
            }
            Decoded::Close => {
                self.terminate("peer sent close");
                false
            }
            Decoded::Open(_) | Decoded::Upgrade => true,
            Decoded::Message(msg) => self.handle_message(msg),
        }
    }

    fn handle_message(&self, msg: Message) -> bool {
        self.note_namespace(&msg.nsp);
        match msg.kind {
            MessageKind::Connect => {
                if self.transport.protocol == ProtocolVersion::V4 {
                    let reply = Message::connect(
                        msg.nsp.clone(),
                        Some(serde_json::json!({ "sid": self.sid })),
                    );
                    if self.enqueue_packet(reply).is_err() {
                        return false;
                    }
                }
                self.fire_connection_once();
                true
            }
            MessageKind::Disconnect => {
                self.terminate("peer disconnected");
                false
            }
            MessageKind::Event | MessageKind::BinaryEvent => {
                self.dispatch_event(msg);
                true
            }
            MessageKind::Ack | MessageKind::BinaryAck => {
                if let Some(id) = msg.ack_id {
                    match self.acks.deliver(id, Value::Array(msg.args)) {
                        Ok(()) => {}
                        // Reply without a parked waiter: ignored.
                        Err(Error::WaiterNotFound(id)) => {
                            tracing::trace!(sid = %self.sid, ack_id = id, "ack without waiter");
                        }
                        Err(_) => {}
                    }
                }
                true
            }
            MessageKind::ConnectError => {
                tracing::debug!(sid = %self.sid, nsp = %msg.nsp, "peer reported connect error");
                true
            }
        }
    }

    /// Invoke the registered handler on its own task so a slow callback
    /// never stalls the reader. Handlers start in receive order.
    fn dispatch_event(&self, msg: Message) {
        let Ok(server) = self.server() else {
            return;
        };
        let Ok(chan) = self.arc() else {
            return;
        };
        let Some(method) = msg.method else {
            return;
        };
        let Some(handler) = server.handlers.get(&method) else {
            tracing::debug!(sid = %self.sid, method = %method, "no handler for event");
            return;
        };

        let nsp = msg.nsp;
        let ack_id = msg.ack_id;
        tokio::spawn(async move {
            match handler(chan.clone(), msg.args).await {
                Ok(ret) => {
                    if let Some(id) = ack_id {
                        let reply = Message::ack(nsp, id, ack_args(ret));
                        if let Err(e) = chan.send_packet(reply).await {
                            tracing::debug!(sid = %chan.sid, error = %e, "ack reply not sent");
                        }
                    }
                }
                Err(e) => {
                    if let Ok(server) = chan.server() {
                        server.report_handler_error(chan.clone(), &method, &e);
                    }
                }
            }
        });
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write: BoxFrameWrite,
        mut out_rx: mpsc::Receiver<Outbound>,
    ) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            if *closed.borrow() {
                break;
            }
            let item = tokio::select! {
                _ = closed.changed() => continue,
                item = out_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            if !self.write_item(&mut write, item).await {
                return;
            }
        }

        // Drain what was enqueued before the stop signal, then close the
        // transport.
        while let Ok(item) = out_rx.try_recv() {
            if !self.write_item(&mut write, item).await {
                return;
            }
        }
        write.close().await;
    }

    async fn write_item(&self, write: &mut BoxFrameWrite, item: Outbound) -> bool {
        let frame = match self.encode_outbound(item) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(sid = %self.sid, error = %e, "dropping unencodable packet");
                return true;
            }
        };
        match write.write_frame(frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(sid = %self.sid, error = %e, "write failed");
                self.terminate("write error");
                false
            }
        }
    }

    fn encode_outbound(&self, item: Outbound) -> Result<Frame> {
        match item {
            Outbound::Frame(frame) => Ok(frame),
            Outbound::Packet(msg) => {
                if self.transport.binary && self.transport.protocol == ProtocolVersion::V4 {
                    Ok(Frame::Binary(binary::encode_record(&msg)?))
                } else {
                    Ok(Frame::Text(codec::encode_message(&msg)?))
                }
            }
        }
    }

    /// v4 liveness: ping every `ping_interval`, starting immediately; a
    /// pong must land within `ping_timeout` of each ping.
    async fn ping_loop(self: Arc<Self>) {
        let (interval, timeout) = self.transport.ping_params();
        let mut closed = self.closed_tx.subscribe();
        let mut ticker = time::interval(interval);
        loop {
            if *closed.borrow() || !self.is_alive() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => continue,
                _ = ticker.tick() => {}
            }
            if !self.is_alive() {
                break;
            }
            let sent = Instant::now();
            if self
                .enqueue_frame(Frame::Text(codec::encode_ping("")))
                .is_err()
            {
                break;
            }
            tokio::select! {
                _ = closed.changed() => break,
                _ = time::sleep(timeout) => {
                    if *self.last_pong.lock() < sent {
                        self.terminate("ping timeout");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(sid: &str) -> Arc<Self> {
        let (out_tx, _out_rx) = mpsc::channel(8);
        Self::new(
            sid.to_string(),
            Transport::v4(),
            RequestInfo {
                uri: "/socket.io/".into(),
                headers: HeaderMap::new(),
                peer_addr: "127.0.0.1:0".into(),
            },
            out_tx,
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("sid", &self.sid)
            .field("alive", &self.is_alive())
            .finish()
    }
}
