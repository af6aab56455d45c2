//! IPC transport primitives over Unix domain sockets.
//!
//! Two socket pairs connect the broker to each gate: a request/reply pair
//! (broker dials, gate listens) and a publish/subscribe pair (gate
//! broadcasts, broker drains non-blocking). All frames use the codec in
//! [`crate::wire`].
//!
//! The request/reply pattern has one hazard the broker side must respect:
//! once a send has completed and the matching receive times out, a late
//! reply may still arrive and would pair with the *next* request. A
//! [`RequestSocket`] therefore poisons itself on receive timeout and must
//! be rebuilt (through the same [`IpcContext`]) before further use.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::wire::{self, WireError};

/// Transport tunables shared by every socket created from one context.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Receive timeout for synchronous request/reply exchanges.
    pub request_recv_timeout: Duration,
    /// Send timeout for the request socket.
    pub request_send_timeout: Duration,
    /// Frames buffered between the subscriber pump and the drain consumer.
    pub subscribe_queue: usize,
    /// How long the gate-side publisher waits on one subscriber before
    /// dropping it.
    pub publish_write_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            request_recv_timeout: Duration::from_secs(5),
            request_send_timeout: Duration::from_secs(2),
            subscribe_queue: 1024,
            publish_write_timeout: Duration::from_secs(1),
        }
    }
}

/// Shared transport context.
///
/// Sockets are created and re-created through one context for the life of
/// the process; rebuilding a poisoned request socket reuses it rather than
/// standing up fresh transport state per reconnect.
#[derive(Debug)]
pub struct IpcContext {
    config: IpcConfig,
    open_sockets: AtomicUsize,
}

impl IpcContext {
    pub fn new(config: IpcConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            open_sockets: AtomicUsize::new(0),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(IpcConfig::default())
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Number of live sockets created from this context.
    pub fn open_sockets(&self) -> usize {
        self.open_sockets.load(Ordering::Relaxed)
    }

    fn track_open(&self) {
        self.open_sockets.fetch_add(1, Ordering::Relaxed);
    }

    fn track_close(&self) {
        self.open_sockets.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counted wrapper so context bookkeeping survives every drop path.
struct TrackedStream {
    inner: UnixStream,
    ctx: Arc<IpcContext>,
}

impl TrackedStream {
    async fn connect(ctx: Arc<IpcContext>, path: &Path) -> io::Result<Self> {
        let inner = UnixStream::connect(path).await?;
        ctx.track_open();
        Ok(Self { inner, ctx })
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.ctx.track_close();
    }
}

pub type RequestResult<T> = Result<T, RequestError>;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request socket unusable after a receive timeout; rebuild required")]
    Poisoned,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Broker-side request socket: strict send → receive pairs.
pub struct RequestSocket {
    stream: Option<TrackedStream>,
    path: PathBuf,
    ctx: Arc<IpcContext>,
}

impl RequestSocket {
    pub async fn connect(ctx: Arc<IpcContext>, path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let stream = TrackedStream::connect(Arc::clone(&ctx), &path).await?;
        Ok(Self {
            stream: Some(stream),
            path,
            ctx,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.stream.is_none()
    }

    /// One send + one receive. A receive timeout closes the underlying
    /// stream and poisons the socket; the caller must [`rebuild`] before
    /// the next exchange.
    ///
    /// [`rebuild`]: Self::rebuild
    pub async fn request(&mut self, body: &[u8]) -> RequestResult<Vec<u8>> {
        let cfg = self.ctx.config().clone();
        // Take the stream out; it is only restored after a clean exchange,
        // so every failure path leaves the socket poisoned.
        let mut stream = self.stream.take().ok_or(RequestError::Poisoned)?;

        match timeout(cfg.request_send_timeout, wire::write_frame(&mut stream.inner, body)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(RequestError::Timeout(cfg.request_send_timeout)),
        }

        match timeout(cfg.request_recv_timeout, wire::read_frame(&mut stream.inner)).await {
            Ok(Ok(frame)) => {
                self.stream = Some(stream);
                Ok(frame)
            }
            Ok(Err(e)) => Err(e.into()),
            // The reply may still arrive later; pairing is now ambiguous.
            Err(_) => Err(RequestError::Timeout(cfg.request_recv_timeout)),
        }
    }

    /// Close and re-dial the same endpoint through the shared context.
    pub async fn rebuild(&mut self) -> io::Result<()> {
        self.stream = None;
        let stream = TrackedStream::connect(Arc::clone(&self.ctx), &self.path).await?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn close(&mut self) {
        self.stream = None;
    }
}

/// Broker-side subscribe socket.
///
/// A pump task moves frames from the socket into a bounded queue;
/// [`try_recv`](Self::try_recv) drains that queue without blocking, which
/// is what the stream-drain entry point needs.
pub struct SubscribeSocket {
    rx: mpsc::Receiver<Vec<u8>>,
    pump: JoinHandle<()>,
}

impl SubscribeSocket {
    pub async fn connect(ctx: Arc<IpcContext>, path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let stream = TrackedStream::connect(Arc::clone(&ctx), &path).await?;
        let (tx, rx) = mpsc::channel(ctx.config().subscribe_queue);

        let pump = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                match wire::read_frame(&mut stream.inner).await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(WireError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        trace!(path = %path.display(), "publish stream closed");
                        break;
                    }
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "subscribe pump stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self { rx, pump })
    }

    /// Non-blocking read of the next buffered frame.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.pump.abort();
        self.rx.close();
    }
}

impl Drop for SubscribeSocket {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Gate-side request listener.
pub struct RequestListener {
    listener: UnixListener,
    path: PathBuf,
}

impl RequestListener {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `wait` for a broker to dial in.
    pub async fn accept(&self, wait: Duration) -> io::Result<Option<RequestStream>> {
        match timeout(wait, self.listener.accept()).await {
            Ok(Ok((stream, _addr))) => Ok(Some(RequestStream { stream })),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

/// One accepted broker connection on the gate's request socket.
pub struct RequestStream {
    stream: UnixStream,
}

impl RequestStream {
    /// Read the next request frame, returning `None` on a timeout tick so
    /// the caller can observe its shutdown flag.
    pub async fn read_request(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, WireError> {
        match timeout(wait, wire::read_frame(&mut self.stream)).await {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub async fn send_reply(&mut self, body: &[u8]) -> Result<(), WireError> {
        wire::write_frame(&mut self.stream, body).await
    }
}

/// Gate-side publish socket: broadcasts every frame to all connected
/// subscribers, dropping any that stall past the write timeout.
pub struct PublishSocket {
    shared: Arc<PublishShared>,
    accept_task: JoinHandle<()>,
    path: PathBuf,
}

struct PublishShared {
    subscribers: tokio::sync::Mutex<Vec<UnixStream>>,
    write_timeout: Duration,
}

impl PublishSocket {
    pub fn bind(ctx: &IpcContext, path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        let shared = Arc::new(PublishShared {
            subscribers: tokio::sync::Mutex::new(Vec::new()),
            write_timeout: ctx.config().publish_write_timeout,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        accept_shared.subscribers.lock().await.push(stream);
                    }
                    Err(e) => {
                        debug!(error = %e, "publish accept loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            shared,
            accept_task,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().await.len()
    }

    /// Send one frame to every subscriber. Subscribers that error or stall
    /// are dropped; publishing never blocks the gate indefinitely.
    pub async fn publish(&self, body: &[u8]) {
        let mut subscribers = self.shared.subscribers.lock().await;
        let mut kept = Vec::with_capacity(subscribers.len());
        for mut stream in subscribers.drain(..) {
            match timeout(self.shared.write_timeout, wire::write_frame(&mut stream, body)).await {
                Ok(Ok(())) => kept.push(stream),
                Ok(Err(e)) => {
                    trace!(error = %e, "dropping publish subscriber");
                }
                Err(_) => {
                    warn!("dropping stalled publish subscriber");
                }
            }
        }
        *subscribers = kept;
    }

    pub async fn close(&self) {
        self.accept_task.abort();
        self.shared.subscribers.lock().await.clear();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "could not remove publish socket");
            }
        }
    }
}

impl Drop for PublishSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_timeout_ctx() -> Arc<IpcContext> {
        IpcContext::new(IpcConfig {
            request_recv_timeout: Duration::from_millis(100),
            request_send_timeout: Duration::from_millis(100),
            ..IpcConfig::default()
        })
    }

    /// Echo server that delays its reply by `delay` once, then echoes
    /// promptly for subsequent connections.
    fn spawn_echo_server(listener: RequestListener, first_delay: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok(Some(mut stream)) = listener.accept(Duration::from_secs(5)).await else {
                    break;
                };
                while let Ok(Some(frame)) = stream.read_request(Duration::from_secs(5)).await {
                    if first {
                        first = false;
                        tokio::time::sleep(first_delay).await;
                    }
                    if stream.send_reply(&frame).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("req.sock");
        let listener = RequestListener::bind(&sock).unwrap();
        let _server = spawn_echo_server(listener, Duration::ZERO);

        let ctx = short_timeout_ctx();
        let mut socket = RequestSocket::connect(Arc::clone(&ctx), &sock).await.unwrap();
        assert_eq!(ctx.open_sockets(), 1);

        let reply = socket.request(b"hello").await.unwrap();
        assert_eq!(reply, b"hello");

        socket.close();
        assert_eq!(ctx.open_sockets(), 0);
    }

    #[tokio::test]
    async fn test_timeout_poisons_then_rebuild_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("req.sock");
        let listener = RequestListener::bind(&sock).unwrap();
        let _server = spawn_echo_server(listener, Duration::from_millis(400));

        let ctx = short_timeout_ctx();
        let mut socket = RequestSocket::connect(Arc::clone(&ctx), &sock).await.unwrap();

        let err = socket.request(b"slow").await.unwrap_err();
        assert!(matches!(err, RequestError::Timeout(_)));
        assert!(socket.is_poisoned());

        // Using the poisoned socket fails fast.
        assert!(matches!(
            socket.request(b"again").await.unwrap_err(),
            RequestError::Poisoned
        ));

        // One rebuild and the next exchange succeeds without help.
        socket.rebuild().await.unwrap();
        let reply = socket.request(b"fast").await.unwrap();
        assert_eq!(reply, b"fast");
        assert_eq!(ctx.open_sockets(), 1);
    }

    #[tokio::test]
    async fn test_publish_broadcasts_to_all_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("pub.sock");
        let ctx = IpcContext::with_defaults();
        let publisher = PublishSocket::bind(&ctx, &sock).unwrap();

        let mut sub_a = SubscribeSocket::connect(Arc::clone(&ctx), &sock).await.unwrap();
        let mut sub_b = SubscribeSocket::connect(Arc::clone(&ctx), &sock).await.unwrap();

        // Let the accept task register both subscribers.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(publisher.subscriber_count().await, 2);

        publisher.publish(b"line one").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sub_a.try_recv().as_deref(), Some(&b"line one"[..]));
        assert_eq!(sub_b.try_recv().as_deref(), Some(&b"line one"[..]));

        publisher.close().await;
    }

    #[tokio::test]
    async fn test_drain_of_empty_subscription_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("pub.sock");
        let ctx = IpcContext::with_defaults();
        let _publisher = PublishSocket::bind(&ctx, &sock).unwrap();
        let mut sub = SubscribeSocket::connect(Arc::clone(&ctx), &sock).await.unwrap();

        let started = std::time::Instant::now();
        assert!(sub.try_recv().is_none());
        assert!(started.elapsed() < Duration::from_millis(20));
    }
}
