//! Connection engine: socket lifecycle, serialized writes, and the
//! background reader that dispatches incoming frames.
//!
//! Writes from concurrent callers are totally ordered by one async mutex, so
//! frames never interleave on the wire. Reads happen on a single spawned
//! task per open socket. The two paths share the socket only through its
//! owned halves and meet again at teardown.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rtmessage_proto::{FrameReader, Message};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{Config, ConnectionBuilder, validate_topic};
use crate::endpoint::{BoxedReader, BoxedWriter, Endpoint};
use crate::error::{Error, Result};
use crate::listener::{CancelListener, Listeners, MessageListener, ReadErrorListener};
use crate::subscription::{SUBSCRIBE_TOPIC, SubscriptionRequest};

/// One-shot callback waiting for the answer to a request.
type RouteCallback = Box<dyn FnOnce(Message) + Send>;

/// A client session with a message router.
///
/// Cheap to clone; clones share the same socket, subscriptions, and
/// listeners. The socket is closed by [`disconnect`](Self::disconnect),
/// [`close`](Self::close), a fatal read error, or dropping the last clone.
#[derive(Clone)]
pub struct Connection {
    /// State shared with clones and, weakly, with the reader task.
    inner: Arc<Inner>,
}

/// Shared connection state.
struct Inner {
    /// Validated configuration.
    config: Config,
    /// Route id and sequence number counter. Never reused.
    ids: AtomicU32,
    /// Source of session ids, one per opened socket.
    sessions: AtomicU64,
    /// The open session, if any. `Some` exactly while connected.
    session: Mutex<Option<Session>>,
    /// Write half and subscription set, guarded by the write lock.
    write: tokio::sync::Mutex<WriteSide>,
    /// Pending request callbacks keyed by route id.
    routes: Mutex<HashMap<u32, RouteCallback>>,
    /// General message listeners.
    messages: Listeners<dyn MessageListener>,
    /// Read-error listeners.
    errors: Listeners<dyn ReadErrorListener>,
}

/// Identity and shutdown signal of one opened socket.
struct Session {
    /// Distinguishes this socket from earlier and later ones.
    id: u64,
    /// Cancelled when the session ends; stops the reader and pending writes.
    closed: CancellationToken,
}

/// Everything guarded by the write lock.
struct WriteSide {
    /// Write half of the current socket.
    sink: Option<Sink>,
    /// Topics subscribed on every connect.
    subscriptions: BTreeSet<String>,
}

/// Write half of one session's socket.
struct Sink {
    /// Session this half belongs to.
    session: u64,
    /// The socket's write half.
    writer: BoxedWriter,
    /// The session's shutdown signal.
    closed: CancellationToken,
}

impl WriteSide {
    /// Removes the write half if it belongs to `session`.
    fn take_sink(&mut self, session: u64) -> Option<BoxedWriter> {
        if self.sink.as_ref().is_some_and(|s| s.session == session) {
            self.sink.take().map(|s| s.writer)
        } else {
            None
        }
    }
}

/// A caller's cancellation token plus an optional deadline.
struct Limits<'a> {
    /// Caller-supplied cancellation.
    cancel: &'a CancellationToken,
    /// Absolute deadline derived from the write timeout.
    deadline: Option<Instant>,
}

impl<'a> Limits<'a> {
    /// Starts the clock for one operation.
    fn new(cancel: &'a CancellationToken, timeout: Option<std::time::Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Runs `fut` unless the caller cancels or the deadline passes first.
    async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        let expired = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = expired => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

impl Connection {
    /// Starts configuring a connection to the router at `url`.
    ///
    /// `url` is `unix:///path/to/socket` or `tcp://host:port`.
    pub fn builder(url: impl Into<String>, app_name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url, app_name)
    }

    /// Assembles a disconnected connection from validated parts.
    pub(crate) fn from_parts(
        config: Config,
        subscriptions: Vec<String>,
        message_listeners: Vec<Arc<dyn MessageListener>>,
        error_listeners: Vec<Arc<dyn ReadErrorListener>>,
    ) -> Self {
        let messages = Listeners::new();
        for l in message_listeners {
            messages.add(l);
        }
        let errors = Listeners::new();
        for l in error_listeners {
            errors.add(l);
        }
        Self {
            inner: Arc::new(Inner {
                config,
                ids: AtomicU32::new(0),
                sessions: AtomicU64::new(0),
                session: Mutex::new(None),
                write: tokio::sync::Mutex::new(WriteSide {
                    sink: None,
                    subscriptions: subscriptions.into_iter().collect(),
                }),
                routes: Mutex::new(HashMap::new()),
                messages,
                errors,
            }),
        }
    }

    /// The router address.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    /// This connection's private inbox topic.
    pub fn inbox(&self) -> &str {
        &self.inner.config.inbox
    }

    /// Returns `true` between a successful connect and the end of the session.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Topics that are subscribed on every connect, in sorted order.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.inner
            .write
            .lock()
            .await
            .subscriptions
            .iter()
            .cloned()
            .collect()
    }

    /// Registers a listener for messages not claimed by a request callback.
    pub fn add_message_listener(&self, listener: impl MessageListener + 'static) -> CancelListener {
        self.inner.messages.add(Arc::new(listener))
    }

    /// Registers a listener for the error that stops the background reader.
    pub fn add_read_error_listener(
        &self,
        listener: impl ReadErrorListener + 'static,
    ) -> CancelListener {
        self.inner.errors.add(Arc::new(listener))
    }

    /// Opens the socket, subscribes to every configured topic plus the
    /// private inbox, and starts the background reader.
    ///
    /// Does nothing if already connected. If any subscription fails the
    /// socket is closed and the error returned.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut write = inner.write.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        // A session ended by `close` may have left its write half behind.
        write.sink = None;

        let dial = inner.config.endpoint.dial();
        let (reader, writer) = match inner.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| Error::DeadlineExceeded)??,
            None => dial.await?,
        };

        let id = inner.sessions.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();
        write.sink = Some(Sink {
            session: id,
            writer,
            closed: closed.clone(),
        });

        let never = CancellationToken::new();
        let limits = Limits::new(&never, inner.config.write_timeout);
        let topics: Vec<String> = write
            .subscriptions
            .iter()
            .cloned()
            .chain(std::iter::once(inner.config.inbox.clone()))
            .collect();
        for topic in &topics {
            if let Err(e) = inner.write_subscription(&mut write, topic, true, &limits).await {
                write.sink = None;
                closed.cancel();
                return Err(e);
            }
        }

        *lock(&inner.session) = Some(Session {
            id,
            closed: closed.clone(),
        });
        let reader = FrameReader::new(reader).with_read_timeout(inner.config.read_timeout);
        tokio::spawn(read_loop(Arc::downgrade(inner), reader, id, closed));

        debug!(
            endpoint = %inner.config.endpoint,
            inbox = %inner.config.inbox,
            subscriptions = topics.len(),
            "connected"
        );
        Ok(())
    }

    /// Stops the reader, shuts the socket down, and drops pending request
    /// callbacks. Calling it again, or while disconnected, does nothing.
    ///
    /// In-flight sends fail with [`Error::InvalidState`]. From inside a
    /// listener callback, use [`close`](Self::close) instead.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.inner.end_session(None) else {
            return Ok(());
        };
        let sink = self.inner.write.lock().await.take_sink(session.id);
        if let Some(mut writer) = sink {
            match writer.shutdown().await {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e.into()),
                _ => {}
            }
        }
        debug!(endpoint = %self.inner.config.endpoint, "disconnected");
        Ok(())
    }

    /// Ends the session without waiting.
    ///
    /// Safe to call from listener callbacks running on the reader task. The
    /// write half is released immediately if the write lock is free,
    /// otherwise by the reader task as it exits.
    pub fn close(&self) {
        if let Some(session) = self.inner.end_session(None) {
            if let Ok(mut write) = self.inner.write.try_lock() {
                drop(write.take_sink(session.id));
            }
            debug!(endpoint = %self.inner.config.endpoint, "closed");
        }
    }

    /// Sends `msg` as-is, assigning a sequence number if it has none.
    ///
    /// Returns the sequence number on the wire. If `cancel` fires or the
    /// write timeout passes mid-frame, the bytes already written stay
    /// written and the router sees a truncated frame; only the caller can
    /// decide whether that is acceptable.
    pub async fn send(&self, mut msg: Message, cancel: &CancellationToken) -> Result<u32> {
        if msg.sequence_number == 0 {
            msg.sequence_number = self.inner.next_id()?;
        }
        let frame = rtmessage_proto::encode(&msg)?;

        let limits = Limits::new(cancel, self.inner.config.write_timeout);
        let mut write = limits.run(self.inner.write.lock()).await?;
        write_frame(&mut write, &frame, &limits).await?;
        trace!(
            topic = %msg.topic,
            seq = msg.sequence_number,
            bytes = frame.len(),
            "frame sent"
        );
        Ok(msg.sequence_number)
    }

    /// Sends `payload` to `topic` as a request whose reply goes to the inbox.
    ///
    /// Replies arrive through the general message listeners. Returns the
    /// sequence number, which the responder echoes.
    pub async fn send_request(
        &self,
        payload: impl Into<Vec<u8>>,
        topic: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let msg = Message::request(topic, self.inner.config.inbox.clone(), payload);
        self.send(msg, cancel).await
    }

    /// Sends a request and routes its reply to `callback` instead of the
    /// general listeners.
    ///
    /// The request carries a fresh route id as both sequence number and
    /// control data. The first inbound frame whose control data names that
    /// id, or the first response on the inbox whose sequence number does,
    /// is handed to `callback`; later ones go to the listeners. Returns the
    /// route id.
    pub async fn request<F>(
        &self,
        payload: impl Into<Vec<u8>>,
        topic: impl Into<String>,
        callback: F,
        cancel: &CancellationToken,
    ) -> Result<u32>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let route_id = self.inner.next_id()?;
        let mut msg = Message::request(topic, self.inner.config.inbox.clone(), payload);
        msg.sequence_number = route_id;
        msg.control_data = route_id;

        lock(&self.inner.routes).insert(route_id, Box::new(callback));
        match self.send(msg, cancel).await {
            Ok(_) => Ok(route_id),
            Err(e) => {
                lock(&self.inner.routes).remove(&route_id);
                Err(e)
            }
        }
    }

    /// Drops the callback registered for `route_id`.
    ///
    /// Returns `false` if it already ran or never existed.
    pub fn forget(&self, route_id: u32) -> bool {
        lock(&self.inner.routes).remove(&route_id).is_some()
    }

    /// Subscribes to `topic` and keeps it in the set replayed on connect.
    pub async fn subscribe(&self, topic: &str, cancel: &CancellationToken) -> Result<()> {
        validate_topic(topic)?;
        let limits = Limits::new(cancel, self.inner.config.write_timeout);
        let mut write = limits.run(self.inner.write.lock()).await?;
        self.inner
            .write_subscription(&mut write, topic, true, &limits)
            .await?;
        write.subscriptions.insert(topic.to_owned());
        Ok(())
    }

    /// Unsubscribes from `topic` and removes it from the replayed set.
    pub async fn unsubscribe(&self, topic: &str, cancel: &CancellationToken) -> Result<()> {
        validate_topic(topic)?;
        let limits = Limits::new(cancel, self.inner.config.write_timeout);
        let mut write = limits.run(self.inner.write.lock()).await?;
        self.inner
            .write_subscription(&mut write, topic, false, &limits)
            .await?;
        write.subscriptions.remove(topic);
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.config.endpoint)
            .field("inbox", &self.inner.config.inbox)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Allocates the next route id / sequence number.
    fn next_id(&self) -> Result<u32> {
        self.ids
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map(|prev| prev + 1)
            .map_err(|_| Error::InvalidState("route ids exhausted"))
    }

    /// Ends the current session, or only session `id` when given.
    ///
    /// Cancels its token and drops pending request callbacks.
    fn end_session(&self, id: Option<u64>) -> Option<Session> {
        let session = {
            let mut current = lock(&self.session);
            if id.is_some_and(|id| current.as_ref().is_none_or(|s| s.id != id)) {
                return None;
            }
            current.take()?
        };
        session.closed.cancel();
        lock(&self.routes).clear();
        Some(session)
    }

    /// Sends a subscribe (`add`) or unsubscribe control message for `topic`.
    async fn write_subscription(
        &self,
        write: &mut WriteSide,
        topic: &str,
        add: bool,
        limits: &Limits<'_>,
    ) -> Result<()> {
        let route_id = self.next_id()?;
        let body = serde_json::to_vec(&SubscriptionRequest::new(topic, add, route_id))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let mut msg = Message::new(SUBSCRIBE_TOPIC, body);
        msg.sequence_number = self.next_id()?;
        let frame = rtmessage_proto::encode(&msg)?;
        write_frame(write, &frame, limits).await?;
        debug!(topic, route_id, add, "subscription sent");
        Ok(())
    }

    /// Hands `msg` to its request callback, or to every general listener.
    fn dispatch(&self, msg: Message) {
        trace!(
            topic = %msg.topic,
            seq = msg.sequence_number,
            control = msg.control_data,
            bytes = msg.payload.len(),
            "frame received"
        );
        if let Some(callback) = self.take_route(&msg) {
            callback(msg);
            return;
        }
        self.messages.visit(|l| l.on_message(&msg));
    }

    /// Removes the request callback `msg` answers, if any.
    fn take_route(&self, msg: &Message) -> Option<RouteCallback> {
        let mut routes = lock(&self.routes);
        if let Some(callback) = routes.remove(&msg.control_data) {
            return Some(callback);
        }
        if msg.is_response() && msg.topic == self.config.inbox {
            return routes.remove(&msg.sequence_number);
        }
        None
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.closed.cancel();
        }
    }
}

/// Writes all of `frame` to the current socket, chunk by chunk.
///
/// Each chunk races the caller's cancellation, the deadline, and the end of
/// the session.
async fn write_frame(write: &mut WriteSide, frame: &[u8], limits: &Limits<'_>) -> Result<()> {
    let Some(Sink { writer, closed, .. }) = write.sink.as_mut() else {
        return Err(Error::InvalidState("not connected"));
    };
    if closed.is_cancelled() {
        return Err(Error::InvalidState("not connected"));
    }

    let mut sent = 0;
    while sent < frame.len() {
        let chunk = &frame[sent..];
        let n = limits
            .run(async {
                tokio::select! {
                    () = closed.cancelled() => Err(Error::InvalidState("disconnected")),
                    r = writer.write(chunk) => r.map_err(Error::Transport),
                }
            })
            .await??;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
        }
        sent += n;
    }
    Ok(())
}

/// Background task: decodes frames until the session ends or the stream
/// fails, then reports the failure and tears the session down.
async fn read_loop(
    weak: Weak<Inner>,
    mut reader: FrameReader<BoxedReader>,
    session: u64,
    closed: CancellationToken,
) {
    let failure = loop {
        let next = tokio::select! {
            biased;
            () = closed.cancelled() => break None,
            next = reader.next_frame() => next,
        };
        // A listener may have closed the session while handling the previous frame.
        if closed.is_cancelled() {
            break None;
        }
        let Some(inner) = weak.upgrade() else {
            break None;
        };
        match next {
            Ok(Some(msg)) => inner.dispatch(msg),
            Ok(None) => {
                break Some(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "router closed the connection",
                )));
            }
            Err(e) => break Some(Error::from(e)),
        }
    };
    drop(reader);

    let Some(inner) = weak.upgrade() else {
        return;
    };
    if let Some(err) = failure {
        if !closed.is_cancelled() {
            warn!(endpoint = %inner.config.endpoint, error = %err, "reader stopped");
            inner.errors.visit(|l| l.on_read_error(&err));
        }
    }
    inner.end_session(Some(session));
    let writer = inner.write.lock().await.take_sink(session);
    drop(writer);
}

/// Locks `m`, recovering the data if a callback panicked while it was held.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use rtmessage_proto::{Flags, FrameError, encode};
    use tempfile::TempDir;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{TcpListener, UnixListener};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::{sleep, timeout};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// The far end of the socket, standing in for the router.
    struct Router {
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Router {
        async fn accept(listener: &UnixListener) -> Self {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            let (r, w) = stream.into_split();
            Self {
                reader: FrameReader::new(r),
                writer: w,
            }
        }

        async fn next(&mut self) -> Message {
            timeout(WAIT, self.reader.next_frame())
                .await
                .expect("router timed out")
                .expect("router failed to decode")
                .expect("client closed the socket")
        }

        async fn next_subscription(&mut self) -> SubscriptionRequest {
            let msg = self.next().await;
            assert_eq!(msg.topic, SUBSCRIBE_TOPIC);
            serde_json::from_slice(&msg.payload).unwrap()
        }

        async fn push(&mut self, msg: &Message) {
            self.writer.write_all(&encode(msg).unwrap()).await.unwrap();
        }

        async fn expect_eof(&mut self) {
            let end = timeout(WAIT, self.reader.next_frame()).await.unwrap();
            assert!(matches!(end, Ok(None)), "expected EOF, got {end:?}");
        }
    }

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        listener: UnixListener,
        conn: Connection,
    }

    fn fixture(configure: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtrouted.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let builder =
            Connection::builder(format!("unix://{}", path.display()), "test_app").inbox_id(42);
        let conn = configure(builder).build().unwrap();
        Fixture {
            _dir: dir,
            path,
            listener,
            conn,
        }
    }

    /// Connects and consumes the inbox subscription.
    async fn connected(
        configure: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder,
    ) -> (Fixture, Router) {
        let fx = fixture(configure);
        let (res, mut router) = tokio::join!(fx.conn.connect(), Router::accept(&fx.listener));
        res.unwrap();
        let inbox = router.next_subscription().await;
        assert_eq!(inbox.topic, "test_app.INBOX.42");
        (fx, router)
    }

    fn channel_listener(conn: &Connection) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.add_message_listener(move |m: &Message| {
            let _ = tx.send(m.clone());
        });
        rx
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !cond() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn connect_subscribes_configured_topics_then_inbox() {
        let fx = fixture(|b| b.subscriptions(["X.Y", "A.B.C"]));
        let (res, mut router) = tokio::join!(fx.conn.connect(), Router::accept(&fx.listener));
        res.unwrap();
        assert!(fx.conn.is_connected());

        let subs = [
            router.next_subscription().await,
            router.next_subscription().await,
            router.next_subscription().await,
        ];
        let topics: Vec<&str> = subs.iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics, ["A.B.C", "X.Y", "test_app.INBOX.42"]);
        assert!(subs.iter().all(|s| s.add == 1));
        assert!(subs.windows(2).all(|w| w[0].route_id < w[1].route_id));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (fx, mut router) = connected(|b| b).await;
        fx.conn.connect().await.unwrap();

        let tok = CancellationToken::new();
        fx.conn
            .send(Message::new("After", b"x".to_vec()), &tok)
            .await
            .unwrap();
        assert_eq!(router.next().await.topic, "After");
    }

    #[tokio::test]
    async fn connect_fails_without_router() {
        let fx = fixture(|b| b);
        drop(fx.listener);
        std::fs::remove_file(&fx.path).unwrap();
        let err = fx.conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!fx.conn.is_connected());
    }

    #[tokio::test]
    async fn send_and_send_request() {
        let (fx, mut router) = connected(|b| b).await;
        let tok = CancellationToken::new();

        let seq = fx
            .conn
            .send(Message::new("A.B.C", b"hello".to_vec()), &tok)
            .await
            .unwrap();
        let got = router.next().await;
        assert_eq!(got.sequence_number, seq);
        assert!(!got.is_request());
        assert!(got.reply_topic.is_empty());
        assert_eq!(got.payload, b"hello");

        let mut fixed = Message::new("A.B.C", Vec::new());
        fixed.sequence_number = 7000;
        assert_eq!(fx.conn.send(fixed, &tok).await.unwrap(), 7000);
        assert_eq!(router.next().await.sequence_number, 7000);

        let seq = fx
            .conn
            .send_request(b"get".to_vec(), "Device.Name", &tok)
            .await
            .unwrap();
        let got = router.next().await;
        assert!(got.is_request());
        assert_eq!(got.flags, Flags::REQUEST);
        assert_eq!(got.reply_topic, "test_app.INBOX.42");
        assert_eq!(got.sequence_number, seq);
    }

    #[tokio::test]
    async fn send_rejects_invalid_message() {
        let (fx, _router) = connected(|b| b).await;
        let err = fx
            .conn
            .send(Message::new("x".repeat(129), Vec::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn inbound_frames_reach_listeners_in_order() {
        let (fx, mut router) = connected(|b| b).await;
        let mut rx = channel_listener(&fx.conn);

        let mut wire = Vec::new();
        for topic in ["one", "two", "three"] {
            wire.extend(encode(&Message::new(topic, topic.as_bytes().to_vec())).unwrap());
        }
        router.writer.write_all(&wire).await.unwrap();

        for topic in ["one", "two", "three"] {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.topic, topic);
        }
    }

    #[tokio::test]
    async fn cancelled_listener_stops_receiving() {
        let (fx, mut router) = connected(|b| b).await;
        let (tx, mut muted) = mpsc::unbounded_channel();
        let cancel = fx.conn.add_message_listener(move |m: &Message| {
            let _ = tx.send(m.clone());
        });
        let mut rx = channel_listener(&fx.conn);

        cancel.cancel();
        cancel.cancel();
        router.push(&Message::new("t", Vec::new())).await;
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(muted.try_recv().is_err());
    }

    #[tokio::test]
    async fn request_callback_runs_at_most_once() {
        let (fx, mut router) = connected(|b| b).await;
        let mut rx = channel_listener(&fx.conn);
        let (tx, reply) = oneshot::channel();

        let id = fx
            .conn
            .request(
                b"q".to_vec(),
                "Device.Name",
                move |m| {
                    let _ = tx.send(m);
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let req = router.next().await;
        assert_eq!(req.control_data, id);
        assert_eq!(req.sequence_number, id);
        assert_eq!(req.reply_topic, fx.conn.inbox());

        let resp = Message::response_to(&req, b"a".to_vec());
        router.push(&resp).await;
        router.push(&resp).await;

        let first = timeout(WAIT, reply).await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.control_data, id);
        assert!(!fx.conn.forget(id));
    }

    #[tokio::test]
    async fn response_on_inbox_matched_by_sequence_number() {
        let (fx, mut router) = connected(|b| b).await;
        let (tx, reply) = oneshot::channel();
        let id = fx
            .conn
            .request(
                Vec::new(),
                "Device.Name",
                move |m| {
                    let _ = tx.send(m);
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let req = router.next().await;

        // The router stamps inbox traffic with the inbox subscription's id.
        let mut resp = Message::response_to(&req, b"routed".to_vec());
        resp.control_data = 1;
        router.push(&resp).await;

        let got = timeout(WAIT, reply).await.unwrap().unwrap();
        assert_eq!(got.sequence_number, id);
        assert_eq!(got.payload, b"routed");
    }

    #[tokio::test]
    async fn forgotten_request_falls_through_to_listeners() {
        let (fx, mut router) = connected(|b| b).await;
        let mut rx = channel_listener(&fx.conn);
        let id = fx
            .conn
            .request(Vec::new(), "T", |_| panic!("forgotten"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(fx.conn.forget(id));

        let req = router.next().await;
        router.push(&Message::response_to(&req, Vec::new())).await;
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.sequence_number, id);
    }

    #[tokio::test]
    async fn route_ids_increase_across_operations() {
        let (fx, mut router) = connected(|b| b).await;
        let tok = CancellationToken::new();

        fx.conn.subscribe("A", &tok).await.unwrap();
        let a = router.next_subscription().await.route_id;
        let req = fx.conn.request(Vec::new(), "R", |_| {}, &tok).await.unwrap();
        assert_eq!(router.next().await.control_data, req);
        fx.conn.subscribe("B", &tok).await.unwrap();
        let b = router.next_subscription().await.route_id;

        assert!(a < req && req < b);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let (fx, mut router) = connected(|b| b.subscription("Keep")).await;
        let tok = CancellationToken::new();

        fx.conn.subscribe("Extra", &tok).await.unwrap();
        let sub = router.next_subscription().await;
        assert_eq!((sub.topic.as_str(), sub.add), ("Extra", 1));
        assert_eq!(fx.conn.subscriptions().await, ["Extra", "Keep"]);

        fx.conn.unsubscribe("Extra", &tok).await.unwrap();
        let unsub = router.next_subscription().await;
        assert_eq!((unsub.topic.as_str(), unsub.add), ("Extra", 0));
        assert!(unsub.route_id > sub.route_id);
        assert_eq!(fx.conn.subscriptions().await, ["Keep"]);

        let err = fx.conn.subscribe("", &tok).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let fx = fixture(|b| b);
        let tok = CancellationToken::new();
        let err = fx.conn.subscribe("A", &tok).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = fx
            .conn
            .send(Message::new("A", Vec::new()), &tok)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(fx.conn.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (fx, mut router) = connected(|b| b).await;
        fx.conn.disconnect().await.unwrap();
        fx.conn.disconnect().await.unwrap();
        assert!(!fx.conn.is_connected());
        router.expect_eof().await;

        let err = fx
            .conn
            .send(Message::new("A", Vec::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn reconnect_replays_subscriptions() {
        let (fx, mut router) = connected(|b| b).await;
        let tok = CancellationToken::new();
        fx.conn.subscribe("Late.Topic", &tok).await.unwrap();
        router.next_subscription().await;

        fx.conn.disconnect().await.unwrap();
        router.expect_eof().await;

        let (res, mut second) = tokio::join!(fx.conn.connect(), Router::accept(&fx.listener));
        res.unwrap();
        assert_eq!(second.next_subscription().await.topic, "Late.Topic");
        assert_eq!(second.next_subscription().await.topic, "test_app.INBOX.42");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_sends_never_interleave() {
        const FRAMES: usize = 20;
        const SIZE: usize = 64 * 1024;

        let (fx, mut router) = connected(|b| b).await;
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 * FRAMES {
                seen.push(router.next().await);
            }
            seen
        });

        let mut senders = Vec::new();
        for fill in [b'a', b'b'] {
            let conn = fx.conn.clone();
            senders.push(tokio::spawn(async move {
                let tok = CancellationToken::new();
                for _ in 0..FRAMES {
                    let msg = Message::new(char::from(fill).to_string(), vec![fill; SIZE]);
                    conn.send(msg, &tok).await.unwrap();
                }
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        let seen = collector.await.unwrap();
        for msg in &seen {
            let fill = msg.topic.as_bytes()[0];
            assert_eq!(msg.payload.len(), SIZE);
            assert!(msg.payload.iter().all(|&b| b == fill));
        }
        assert_eq!(seen.iter().filter(|m| m.topic == "a").count(), FRAMES);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_one_send_leaves_others_intact() {
        let (fx, mut router) = connected(|b| b).await;

        // B fills the socket buffer and holds the write lock until the
        // router starts reading.
        let big = 8 * 1024 * 1024;
        let conn = fx.conn.clone();
        let b = tokio::spawn(async move {
            conn.send(Message::new("B", vec![7; big]), &CancellationToken::new())
                .await
        });
        sleep(Duration::from_millis(50)).await;

        let a_tok = CancellationToken::new();
        let conn = fx.conn.clone();
        let a_cancel = a_tok.clone();
        let a = tokio::spawn(async move {
            conn.send(Message::new("A", b"never".to_vec()), &a_tok)
                .await
        });
        sleep(Duration::from_millis(50)).await;
        a_cancel.cancel();
        assert!(matches!(a.await.unwrap(), Err(Error::Cancelled)));

        let got = router.next().await;
        assert_eq!(got.topic, "B");
        assert_eq!(got.payload.len(), big);
        b.await.unwrap().unwrap();

        assert!(fx.conn.is_connected());
        fx.conn
            .send(Message::new("C", Vec::new()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(router.next().await.topic, "C");
    }

    #[tokio::test]
    async fn cancelling_mid_write_does_not_disconnect() {
        let (fx, _router) = connected(|b| b).await;
        let tok = CancellationToken::new();
        let trigger = tok.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = fx
            .conn
            .send(Message::new("Huge", vec![0; 16 * 1024 * 1024]), &tok)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(fx.conn.is_connected());
    }

    #[tokio::test]
    async fn write_timeout_is_deadline_exceeded() {
        let (fx, _router) = connected(|b| b.write_timeout(Duration::from_millis(100))).await;
        let err = fx
            .conn
            .send(
                Message::new("Huge", vec![0; 16 * 1024 * 1024]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(fx.conn.is_connected());
    }

    #[tokio::test]
    async fn disconnect_aborts_blocked_send() {
        let (fx, _router) = connected(|b| b).await;
        let conn = fx.conn.clone();
        let blocked = tokio::spawn(async move {
            conn.send(
                Message::new("Huge", vec![0; 16 * 1024 * 1024]),
                &CancellationToken::new(),
            )
            .await
        });
        sleep(Duration::from_millis(50)).await;

        timeout(WAIT, fx.conn.disconnect()).await.unwrap().unwrap();
        let res = timeout(WAIT, blocked).await.unwrap().unwrap();
        assert!(matches!(res, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn corrupt_frame_reports_error_and_disconnects() {
        let (tx, mut errors) = mpsc::unbounded_channel();
        let (fx, mut router) = connected(move |b| {
            b.error_listener(move |e: &Error| {
                let _ = tx.send(e.to_string());
            })
        })
        .await;
        let (flag_tx, mut flagged) = mpsc::unbounded_channel();
        fx.conn.add_read_error_listener(move |e: &Error| {
            let _ = flag_tx.send(matches!(
                e,
                Error::InvalidFrame(FrameError::InvalidPreamble(0))
            ));
        });

        router
            .writer
            .write_all(&[0, 0, 0, 2, 0, 32, 0, 0])
            .await
            .unwrap();

        let msg = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(msg.contains("preamble"), "{msg}");
        assert!(timeout(WAIT, flagged.recv()).await.unwrap().unwrap());
        eventually(|| !fx.conn.is_connected()).await;
        router.expect_eof().await;
    }

    #[tokio::test]
    async fn router_hangup_reports_transport_error() {
        let (tx, mut errors) = mpsc::unbounded_channel();
        let (fx, router) = connected(move |b| {
            b.error_listener(move |e: &Error| {
                let _ = tx.send(matches!(e, Error::Transport(_)));
            })
        })
        .await;
        drop(router);

        assert!(timeout(WAIT, errors.recv()).await.unwrap().unwrap());
        eventually(|| !fx.conn.is_connected()).await;
    }

    #[tokio::test]
    async fn close_from_listener_does_not_deadlock() {
        let (fx, mut router) = connected(|b| b).await;
        let conn = fx.conn.clone();
        fx.conn.add_message_listener(move |m: &Message| {
            if m.topic == "Shutdown" {
                conn.close();
            }
        });

        router.push(&Message::new("Shutdown", Vec::new())).await;
        eventually(|| !fx.conn.is_connected()).await;
        router.expect_eof().await;
        fx.conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_delivery_of_buffered_frames() {
        let fx = fixture(|b| b);
        let calls = Arc::new(AtomicUsize::new(0));
        let conn = fx.conn.clone();
        let seen = Arc::clone(&calls);
        fx.conn.add_message_listener(move |_: &Message| {
            seen.fetch_add(1, Ordering::SeqCst);
            conn.close();
        });

        let mut burst = Vec::new();
        for i in 0..10u8 {
            burst.extend(encode(&Message::new("Burst", vec![i])).unwrap());
        }
        for _ in 0..20 {
            calls.store(0, Ordering::SeqCst);
            let (res, mut router) = tokio::join!(fx.conn.connect(), Router::accept(&fx.listener));
            res.unwrap();
            router.next_subscription().await;

            router.writer.write_all(&burst).await.unwrap();
            eventually(|| !fx.conn.is_connected()).await;
            router.expect_eof().await;
            sleep(Duration::from_millis(20)).await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn connect_fails_when_router_hangs_up_mid_subscribe() {
        // Far more subscription traffic than a socket buffer holds.
        let topics: Vec<String> = (0..5000).map(|i| format!("Topic.{i:0>120}")).collect();
        let fx = fixture(|b| b.subscriptions(topics));
        let hangup = async {
            let (stream, _) = timeout(WAIT, fx.listener.accept()).await.unwrap().unwrap();
            drop(stream);
        };

        let (res, ()) = tokio::join!(fx.conn.connect(), hangup);
        assert!(matches!(res, Err(Error::Transport(_))), "{res:?}");
        assert!(!fx.conn.is_connected());
        let err = fx
            .conn
            .send(Message::new("A", Vec::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn tcp_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::builder(format!("tcp://{addr}"), "tcp_app")
            .inbox_id(9)
            .connect_timeout(WAIT)
            .build()
            .unwrap();

        let (res, accepted) = tokio::join!(conn.connect(), listener.accept());
        res.unwrap();
        let (stream, _) = accepted.unwrap();
        let mut reader = FrameReader::new(stream);
        let msg = reader.next_frame().await.unwrap().unwrap();
        let sub: SubscriptionRequest = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(sub.topic, "tcp_app.INBOX.9");
        conn.disconnect().await.unwrap();
    }
}
