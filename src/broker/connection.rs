//! Duplex handle to one gate.
//!
//! A connection owns the request socket (guarded by an async mutex so every
//! send/receive pair is atomic) and the subscribe socket (drained by a
//! single consumer). Asynchronous operations register a per-request inbox;
//! the stream drain routes tagged frames into the matching inbox and
//! broadcasts shared `stdout`/`stderr` into every inbox while an eval is
//! streaming.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use gate_protocol::descriptor::GateDescriptor;
use gate_protocol::ipc::{IpcContext, RequestError, RequestSocket, SubscribeSocket};
use gate_protocol::messages::{
    EvalRecord, GateOptions, GateReply, GateRequest, PongInfo, StreamChannel, StreamMessage,
    ToolOutcome,
};
use gate_protocol::tools::ToolDescriptor;
use gate_protocol::wire;

use crate::error::{BrokerError, BrokerResult};

/// Capacity of each per-request inbox; overflow drops chunks and counts.
const INBOX_CAPACITY: usize = 32;

/// Progress callback for asynchronous operations.
pub type ProgressFn<'a> = dyn Fn(StreamChannel, &str) + Send + Sync + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalState {
    Idle,
    Sending,
    Streaming,
}

struct Inbox {
    tx: mpsc::Sender<StreamMessage>,
    dropped: Arc<AtomicU64>,
}

/// One connected gate session.
pub struct Connection {
    session_id: uuid::Uuid,
    short_key: String,
    friendly_name: String,
    descriptor_path: PathBuf,
    request_path: PathBuf,
    stream_path: PathBuf,
    ctx: Arc<IpcContext>,

    /// Guards the request socket for the length of one send + receive.
    request: tokio::sync::Mutex<Option<RequestSocket>>,
    subscribe: Mutex<Option<SubscribeSocket>>,

    eval_state: Mutex<EvalState>,
    /// Separate mutex: inbox registration must not contend with the
    /// request handshake.
    inboxes: Mutex<HashMap<String, Inbox>>,

    status: Mutex<ConnStatus>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    last_ping: Mutex<Option<DateTime<Utc>>>,
    tool_call_count: AtomicU64,

    project_path: Mutex<String>,
    display_name: Mutex<String>,
    /// Registry-resolved prefix for this session's tools.
    namespace: Mutex<String>,
    /// Namespace as reported by the gate.
    namespace_hint: Mutex<String>,
    catalog: Mutex<Vec<ToolDescriptor>>,
    catalog_hash: AtomicU64,

    allow_restart: AtomicBool,
    allow_mirror: AtomicBool,
    mirror_active: AtomicBool,
}

impl Connection {
    /// Dial both sockets of a discovered gate and fetch its identity.
    pub async fn connect(
        ctx: Arc<IpcContext>,
        descriptor: &GateDescriptor,
        mirror_default: bool,
    ) -> BrokerResult<Arc<Self>> {
        let request_path = descriptor
            .request_socket()
            .ok_or_else(|| BrokerError::Gate(format!("bad endpoint {:?}", descriptor.endpoint)))?;
        let stream_path = descriptor.stream_socket().ok_or_else(|| {
            BrokerError::Gate(format!("bad endpoint {:?}", descriptor.stream_endpoint))
        })?;

        let request = RequestSocket::connect(Arc::clone(&ctx), &request_path).await?;
        let subscribe = SubscribeSocket::connect(Arc::clone(&ctx), &stream_path).await?;

        let session_id = descriptor
            .session_uuid()
            .ok_or_else(|| BrokerError::Gate(format!("bad session id {:?}", descriptor.session_id)))?;

        let connection = Arc::new(Self {
            session_id,
            short_key: descriptor.short_key().to_string(),
            friendly_name: descriptor.name.clone(),
            descriptor_path: gate_protocol::descriptor::descriptor_path(
                request_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                &descriptor.session_id,
            ),
            request_path,
            stream_path,
            ctx,
            request: tokio::sync::Mutex::new(Some(request)),
            subscribe: Mutex::new(Some(subscribe)),
            eval_state: Mutex::new(EvalState::Idle),
            inboxes: Mutex::new(HashMap::new()),
            status: Mutex::new(ConnStatus::Connecting),
            connected_at: Mutex::new(None),
            last_seen: Mutex::new(None),
            last_ping: Mutex::new(None),
            tool_call_count: AtomicU64::new(0),
            project_path: Mutex::new(descriptor.project_path.clone()),
            display_name: Mutex::new(String::new()),
            namespace: Mutex::new(String::new()),
            namespace_hint: Mutex::new(String::new()),
            catalog: Mutex::new(Vec::new()),
            catalog_hash: AtomicU64::new(0),
            allow_restart: AtomicBool::new(false),
            allow_mirror: AtomicBool::new(false),
            mirror_active: AtomicBool::new(false),
        });

        // Apply persisted runtime options before first use.
        if mirror_default {
            if let Err(e) = connection
                .set_option("mirror_repl", Value::Bool(true))
                .await
            {
                debug!(session = %connection.short_key, error = %e, "could not apply mirror default");
            }
        }

        connection.ping().await?;
        *connection.status.lock() = ConnStatus::Connected;
        *connection.connected_at.lock() = Some(Utc::now());
        info!(session = %connection.short_key, "gate connected");
        Ok(connection)
    }

    // ------------------------------------------------------------------
    // Identity and bookkeeping accessors
    // ------------------------------------------------------------------

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn short_key(&self) -> &str {
        &self.short_key
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().clone()
    }

    pub(crate) fn set_display_name(&self, name: impl Into<String>) {
        *self.display_name.lock() = name.into();
    }

    pub fn namespace(&self) -> String {
        self.namespace.lock().clone()
    }

    pub(crate) fn set_namespace(&self, namespace: impl Into<String>) {
        *self.namespace.lock() = namespace.into();
    }

    pub fn namespace_hint(&self) -> String {
        self.namespace_hint.lock().clone()
    }

    pub fn project_path(&self) -> String {
        self.project_path.lock().clone()
    }

    pub fn status(&self) -> ConnStatus {
        *self.status.lock()
    }

    pub fn eval_state(&self) -> EvalState {
        *self.eval_state.lock()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.lock()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.lock()
    }

    pub fn last_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_ping.lock()
    }

    pub fn tool_call_count(&self) -> u64 {
        self.tool_call_count.load(Ordering::Relaxed)
    }

    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.catalog.lock().clone()
    }

    pub fn catalog_hash(&self) -> u64 {
        self.catalog_hash.load(Ordering::Relaxed)
    }

    pub fn allow_restart(&self) -> bool {
        self.allow_restart.load(Ordering::Relaxed)
    }

    pub fn allow_mirror(&self) -> bool {
        self.allow_mirror.load(Ordering::Relaxed)
    }

    pub fn mirror_active(&self) -> bool {
        self.mirror_active.load(Ordering::Relaxed)
    }

    pub fn descriptor_exists(&self) -> bool {
        self.descriptor_path.exists()
    }

    /// Record a synthetic ping result without touching the busy socket.
    pub(crate) fn touch_synthetic_ping(&self) {
        *self.last_ping.lock() = Some(Utc::now());
    }

    fn apply_pong(&self, pong: &PongInfo) {
        let now = Utc::now();
        *self.last_seen.lock() = Some(now);
        *self.last_ping.lock() = Some(now);
        *self.project_path.lock() = pong.project_path.clone();
        *self.namespace_hint.lock() = pong.namespace.clone();
        self.allow_restart.store(pong.allow_restart, Ordering::Relaxed);
        self.allow_mirror.store(pong.allow_mirror, Ordering::Relaxed);
        self.mirror_active.store(pong.mirror_repl, Ordering::Relaxed);
        *self.catalog.lock() = pong.tools.clone();
        self.catalog_hash
            .store(hash_catalog(&pong.tools), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Synchronous operations
    // ------------------------------------------------------------------

    /// One request/reply exchange under the request mutex.
    ///
    /// A receive timeout recreates the request socket *before* the mutex is
    /// released, so the next waiter gets a usable socket. Other transport
    /// errors mark the connection disconnected for the health loop.
    async fn request(&self, request: &GateRequest) -> BrokerResult<GateReply> {
        let frame = wire::encode(request)?;
        let mut guard = self.request.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| BrokerError::NotConnected(self.short_key.clone()))?;

        match socket.request(&frame).await {
            Ok(bytes) => Ok(wire::decode(&bytes)?),
            Err(RequestError::Timeout(elapsed)) => {
                warn!(session = %self.short_key, "request timed out; recreating request socket");
                if let Err(e) = socket.rebuild().await {
                    warn!(session = %self.short_key, error = %e, "request socket rebuild failed");
                    *guard = None;
                    *self.status.lock() = ConnStatus::Disconnected;
                }
                Err(BrokerError::Timeout(elapsed))
            }
            Err(e) => {
                *guard = None;
                *self.status.lock() = ConnStatus::Disconnected;
                Err(e.into())
            }
        }
    }

    fn expect_reply<T>(
        &self,
        reply: GateReply,
        extract: impl FnOnce(GateReply) -> Result<T, GateReply>,
    ) -> BrokerResult<T> {
        match extract(reply) {
            Ok(value) => Ok(value),
            Err(GateReply::Error { message }) => Err(BrokerError::Gate(message)),
            Err(other) => Err(BrokerError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub async fn ping(&self) -> BrokerResult<PongInfo> {
        let reply = self.request(&GateRequest::Ping).await?;
        let pong = self.expect_reply(reply, |r| match r {
            GateReply::Pong(pong) => Ok(pong),
            other => Err(other),
        })?;
        self.apply_pong(&pong);
        Ok(pong)
    }

    /// Synchronous evaluation. Transport failures come back as an
    /// error-shaped record so callers always see one shape.
    pub async fn eval_remote(&self, code: &str, display_code: Option<&str>) -> EvalRecord {
        self.tool_call_count.fetch_add(1, Ordering::Relaxed);
        let request = GateRequest::Eval {
            code: code.to_string(),
            display_code: display_code.map(String::from),
        };
        match self.request(&request).await {
            Ok(GateReply::EvalResult(record)) => record,
            Ok(GateReply::Error { message }) => EvalRecord::failure(message),
            Ok(other) => EvalRecord::failure(format!("unexpected reply: {other:?}")),
            Err(e) => EvalRecord::failure(e.to_string()),
        }
    }

    pub async fn set_option(&self, key: &str, value: Value) -> BrokerResult<()> {
        let reply = self
            .request(&GateRequest::SetOption {
                key: key.to_string(),
                value,
            })
            .await?;
        self.expect_reply(reply, |r| match r {
            GateReply::OptionSet { .. } => Ok(()),
            other => Err(other),
        })?;
        if key == "mirror_repl" {
            // Keep the local flag in sync without waiting for a ping.
            if let Ok(options) = self.get_options().await {
                self.mirror_active.store(options.mirror_repl, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub async fn get_options(&self) -> BrokerResult<GateOptions> {
        let reply = self.request(&GateRequest::GetOptions).await?;
        self.expect_reply(reply, |r| match r {
            GateReply::Options(options) => Ok(options),
            other => Err(other),
        })
    }

    pub async fn set_tty(&self, path: &str) -> BrokerResult<(u16, u16)> {
        let reply = self
            .request(&GateRequest::SetTty {
                path: path.to_string(),
            })
            .await?;
        self.expect_reply(reply, |r| match r {
            GateReply::TtyInstalled { rows, cols, .. } => Ok((rows, cols)),
            other => Err(other),
        })
    }

    pub async fn restore_tty(&self) -> BrokerResult<()> {
        let reply = self.request(&GateRequest::RestoreTty).await?;
        self.expect_reply(reply, |r| match r {
            GateReply::Ok => Ok(()),
            other => Err(other),
        })
    }

    pub async fn send_restart(&self) -> BrokerResult<()> {
        if !self.allow_restart() {
            return Err(BrokerError::RestartNotAllowed(self.short_key.clone()));
        }
        let reply = self.request(&GateRequest::Restart).await?;
        self.expect_reply(reply, |r| match r {
            GateReply::Ok => Ok(()),
            other => Err(other),
        })
    }

    pub async fn list_tools(&self) -> BrokerResult<Vec<ToolDescriptor>> {
        let reply = self.request(&GateRequest::ListTools).await?;
        self.expect_reply(reply, |r| match r {
            GateReply::Tools { tools } => Ok(tools),
            other => Err(other),
        })
    }

    // ------------------------------------------------------------------
    // Asynchronous operations
    // ------------------------------------------------------------------

    /// Asynchronous evaluation with streamed progress.
    pub async fn eval_remote_async(
        &self,
        code: &str,
        display_code: Option<&str>,
        deadline: Duration,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> EvalRecord {
        self.tool_call_count.fetch_add(1, Ordering::Relaxed);
        let request_id = new_request_id();
        let request = GateRequest::EvalAsync {
            code: code.to_string(),
            display_code: display_code.map(String::from),
            request_id: request_id.clone(),
        };

        match self
            .run_async_op(&request_id, &request, deadline, on_progress)
            .await
        {
            Ok((message, dropped)) => {
                let mut record = match &message.result {
                    Some(bytes) => wire::decode::<EvalRecord>(bytes)
                        .unwrap_or_else(|e| EvalRecord::failure(format!("bad terminal payload: {e}"))),
                    None => EvalRecord::failure("terminal event carried no result"),
                };
                record.dropped_chunks = dropped;
                record
            }
            Err(e) => EvalRecord::failure(e.to_string()),
        }
    }

    /// Asynchronous session-tool call with streamed progress.
    pub async fn call_session_tool_async(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        deadline: Duration,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> ToolOutcome {
        self.tool_call_count.fetch_add(1, Ordering::Relaxed);
        let request_id = new_request_id();
        let request = GateRequest::ToolCallAsync {
            name: name.to_string(),
            arguments,
            request_id: request_id.clone(),
        };

        match self
            .run_async_op(&request_id, &request, deadline, on_progress)
            .await
        {
            Ok((message, dropped)) => {
                let mut outcome = match &message.result {
                    Some(bytes) => wire::decode::<ToolOutcome>(bytes)
                        .unwrap_or_else(|e| ToolOutcome::failure(format!("bad terminal payload: {e}"))),
                    None => ToolOutcome::failure("terminal event carried no result"),
                };
                outcome.dropped_chunks = dropped;
                outcome
            }
            Err(e) => ToolOutcome::failure(e.to_string()),
        }
    }

    /// Shared async flow: register inbox, handshake under the request
    /// mutex, then poll the inbox until the terminal event or the deadline.
    /// The inbox is removed on every exit path.
    async fn run_async_op(
        &self,
        request_id: &str,
        request: &GateRequest,
        deadline: Duration,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> BrokerResult<(StreamMessage, u64)> {
        let (tx, mut rx) = mpsc::channel(INBOX_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inboxes.lock().insert(
            request_id.to_string(),
            Inbox {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        let _cleanup = InboxGuard {
            connection: self,
            request_id,
        };

        *self.eval_state.lock() = EvalState::Sending;

        // The mutex is held only for the brief ack handshake; waiting on
        // the inbox happens outside it so concurrent ops share the socket.
        let reply = self.request(request).await?;
        match reply {
            GateReply::Accepted { request_id: acked } if acked == request_id => {}
            GateReply::Error { message } => return Err(BrokerError::Gate(message)),
            other => return Err(BrokerError::UnexpectedReply(format!("{other:?}"))),
        }
        *self.eval_state.lock() = EvalState::Streaming;

        let expires = Instant::now() + deadline;
        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::Deadline(deadline));
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(message)) => {
                    if message.channel.is_terminal() {
                        return Ok((message, dropped.load(Ordering::Relaxed)));
                    }
                    if let Some(callback) = on_progress {
                        callback(message.channel, &message.payload);
                    }
                }
                Ok(None) => {
                    return Err(BrokerError::Gate("inbox closed before terminal event".into()))
                }
                Err(_) => return Err(BrokerError::Deadline(deadline)),
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream drain
    // ------------------------------------------------------------------

    /// Exhaust the subscribe socket and route each message.
    ///
    /// Returns the messages the caller (the UI drain) should see; tagged
    /// messages consumed by an inbox are not among them.
    pub(crate) fn drain_stream(&self) -> Vec<StreamMessage> {
        let mut surfaced = Vec::new();
        let mut guard = self.subscribe.lock();
        let Some(subscribe) = guard.as_mut() else {
            return surfaced;
        };
        while let Some(frame) = subscribe.try_recv() {
            let message: StreamMessage = match wire::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(session = %self.short_key, error = %e, "undecodable stream frame");
                    continue;
                }
            };
            if let Some(message) = self.route_message(message) {
                surfaced.push(message);
            }
        }
        surfaced
    }

    /// Routing rules for one decoded stream message.
    fn route_message(&self, message: StreamMessage) -> Option<StreamMessage> {
        // Tagged frame with a live inbox: deliver there and stop.
        if message.channel.is_tagged() {
            if let Some(request_id) = message.request_id.as_deref() {
                let inboxes = self.inboxes.lock();
                if let Some(inbox) = inboxes.get(request_id) {
                    deliver(inbox, message);
                    return None;
                }
            }
            // No inbox (the caller timed out or hung up): the event lands
            // unclaimed and is surfaced to the drain consumer instead.
            return Some(message);
        }

        // Shared stdout/stderr while something is streaming: copy into
        // every inbox so each async caller observes the whole stream.
        if matches!(message.channel, StreamChannel::Stdout | StreamChannel::Stderr)
            && self.eval_state() == EvalState::Streaming
        {
            let inboxes = self.inboxes.lock();
            for inbox in inboxes.values() {
                deliver(inbox, message.clone());
            }
        }
        Some(message)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Re-dial both sockets after a disconnect.
    pub(crate) async fn reconnect(&self) -> BrokerResult<()> {
        let request = RequestSocket::connect(Arc::clone(&self.ctx), &self.request_path).await?;
        let subscribe = SubscribeSocket::connect(Arc::clone(&self.ctx), &self.stream_path).await?;
        *self.request.lock().await = Some(request);
        if let Some(mut old) = self.subscribe.lock().replace(subscribe) {
            old.close();
        }
        self.ping().await?;
        *self.status.lock() = ConnStatus::Connected;
        *self.connected_at.lock() = Some(Utc::now());
        info!(session = %self.short_key, "gate reconnected");
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        if let Some(mut socket) = self.request.lock().await.take() {
            socket.close();
        }
        if let Some(mut subscribe) = self.subscribe.lock().take() {
            subscribe.close();
        }
        *self.status.lock() = ConnStatus::Disconnected;
    }
}

/// Removes the inbox on every exit path of an async op; when the table
/// empties the connection settles back to idle.
struct InboxGuard<'a> {
    connection: &'a Connection,
    request_id: &'a str,
}

impl Drop for InboxGuard<'_> {
    fn drop(&mut self) {
        let mut inboxes = self.connection.inboxes.lock();
        inboxes.remove(self.request_id);
        if inboxes.is_empty() {
            *self.connection.eval_state.lock() = EvalState::Idle;
        }
    }
}

fn deliver(inbox: &Inbox, message: StreamMessage) {
    // Non-blocking put; progress is best-effort and full inboxes drop.
    // The terminal event is the one message that must not be lost, so a
    // full channel hands it off to land once the caller frees capacity.
    match inbox.tx.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(message)) => {
            if message.channel.is_terminal() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = inbox.tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(message).await;
                    });
                }
            } else {
                inbox.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn new_request_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

fn hash_catalog(tools: &[ToolDescriptor]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for tool in tools {
        tool.name.hash(&mut hasher);
        tool.description.hash(&mut hasher);
        for arg in &tool.args {
            arg.name.hash(&mut hasher);
            arg.required.hash(&mut hasher);
            arg.keyword_only.hash(&mut hasher);
            format!("{:?}", arg.ty).hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_16_hex_chars() {
        for _ in 0..64 {
            let id = new_request_id();
            assert_eq!(id.len(), 16);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_catalog_hash_changes_with_catalog() {
        use gate_protocol::tools::{ToolArg, ToolDescriptor, TypeDesc};
        let one = vec![ToolDescriptor::new("foo", "f")];
        let two = vec![
            ToolDescriptor::new("foo", "f"),
            ToolDescriptor::new("bar", "b").with_arg(ToolArg::new("x", TypeDesc::Integer)),
        ];
        assert_ne!(hash_catalog(&one), hash_catalog(&two));
        assert_eq!(hash_catalog(&one), hash_catalog(&one.clone()));
        assert_ne!(hash_catalog(&one), hash_catalog(&[]));
    }

    #[test]
    fn test_empty_catalog_hash_is_stable() {
        assert_eq!(hash_catalog(&[]), hash_catalog(&[]));
    }
}
