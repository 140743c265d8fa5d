use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    buffer::FrameBuffer,
    pending::PendingRequests,
    types::{
        Breakpoint, DebugEvent, DebugRequest, EventPayload, Frame, Message, RequestPayload,
        Result, SequenceNumber, Stepping, ThreadId, Value, ValueId, WireError,
    },
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Bounded connect retry: `attempts` tries in total, `delay` apart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Call `dial` until it succeeds or the attempts are used up.
    ///
    /// `dial` receives the 1-based attempt number. On success returns the
    /// value together with the number of attempts it took.
    pub async fn run<T, F, Fut>(&self, mut dial: F) -> Result<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match dial(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(source) if attempt >= attempts => {
                    return Err(WireError::ConnectFailed {
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        target: "starbridge.wire",
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "connect attempt failed; retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Notifications from the connection to its owner, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Sent once, before anything else.
    Connected { attempts: u32 },
    /// Unsolicited event (sequence number 0).
    Event(DebugEvent),
    /// The socket failed or the stream was corrupt. No further events follow.
    TransportLost { reason: String },
    /// The server closed the connection. No further events follow.
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    writer: Mutex<BoxedWriter>,
    pending: parking_lot::Mutex<PendingRequests<SequenceNumber, DebugEvent>>,
    next_seq: AtomicI64,
    shutdown: CancellationToken,
}

/// Client side of Bazel's Starlark debug server socket.
///
/// Cheap to clone; every clone shares the same socket and sequence counter.
#[derive(Clone)]
pub struct DebugConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DebugConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugConnection")
            .field("next_seq", &self.inner.next_seq.load(Ordering::Relaxed))
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DebugConnection {
    pub async fn connect(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        Self::connect_with_policy(addr, &RetryPolicy::default()).await
    }

    pub async fn connect_with_policy(
        addr: SocketAddr,
        policy: &RetryPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        Self::connect_with(policy, |attempt| {
            tracing::debug!(target: "starbridge.wire", %addr, attempt, "connecting to debug server");
            async move {
                let stream = TcpStream::connect(addr).await?;
                let _ = stream.set_nodelay(true);
                Ok::<_, io::Error>(stream)
            }
        })
        .await
    }

    /// Connect through an arbitrary dialer, retrying per `policy`.
    pub async fn connect_with<S, F, Fut>(
        policy: &RetryPolicy,
        dial: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = io::Result<S>>,
    {
        let (stream, attempts) = policy.run(dial).await?;
        tracing::info!(target: "starbridge.wire", attempts, "connected to debug server");
        Ok(Self::start(stream, attempts))
    }

    /// Wrap an already connected stream.
    pub fn from_stream<S>(stream: S) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(stream, 1)
    }

    fn start<S>(stream: S, attempts: u32) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            writer: Mutex::new(Box::new(writer)),
            pending: parking_lot::Mutex::new(PendingRequests::new()),
            next_seq: AtomicI64::new(1),
            shutdown: CancellationToken::new(),
        });

        let _ = events_tx.send(ConnectionEvent::Connected { attempts });
        tokio::spawn(read_loop(reader, inner.clone(), events_tx));

        (Self { inner }, events_rx)
    }

    /// Tear the connection down. Outstanding requests fail with
    /// [`WireError::ConnectionClosed`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancelled once the connection is gone, whichever side ended it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Send `payload` under a fresh sequence number and wait for its response.
    ///
    /// A server-side `Error` response becomes [`WireError::Remote`].
    pub async fn send_request(&self, payload: RequestPayload) -> Result<EventPayload> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WireError::ConnectionClosed);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let request_name = payload.name();
        let rx = self
            .inner
            .pending
            .lock()
            .register(seq)
            .ok_or_else(|| WireError::Protocol(format!("sequence number {seq} already pending")))?;

        let bytes = DebugRequest {
            sequence_number: seq,
            payload,
        }
        .encode_delimited();
        tracing::trace!(target: "starbridge.wire", seq, request = request_name, "sending request");

        let written = {
            let mut writer = self.inner.writer.lock().await;
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = written {
            self.remove_pending(seq);
            return Err(err.into());
        }

        let event = tokio::select! {
            biased;
            res = rx => res.map_err(|_| WireError::ConnectionClosed)?,
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(seq);
                return Err(WireError::ConnectionClosed);
            }
        };

        match event.payload {
            EventPayload::Error { message } => {
                tracing::debug!(
                    target: "starbridge.wire",
                    seq,
                    request = request_name,
                    %message,
                    "debug server rejected request"
                );
                Err(WireError::Remote(message))
            }
            other => Ok(other),
        }
    }

    fn remove_pending(&self, seq: SequenceNumber) {
        self.inner.pending.lock().remove(&seq);
    }

    pub async fn start_debugging(&self) -> Result<()> {
        match self.send_request(RequestPayload::StartDebugging).await? {
            EventPayload::StartDebugging => Ok(()),
            _ => Err(WireError::UnexpectedResponse("startDebugging")),
        }
    }

    /// Replace the server's complete breakpoint set.
    pub async fn set_breakpoints(&self, breakpoints: Vec<Breakpoint>) -> Result<()> {
        match self
            .send_request(RequestPayload::SetBreakpoints { breakpoints })
            .await?
        {
            EventPayload::SetBreakpoints => Ok(()),
            _ => Err(WireError::UnexpectedResponse("setBreakpoints")),
        }
    }

    pub async fn list_frames(&self, thread_id: ThreadId) -> Result<Vec<Frame>> {
        match self
            .send_request(RequestPayload::ListFrames { thread_id })
            .await?
        {
            EventPayload::ListFrames { frames } => Ok(frames),
            _ => Err(WireError::UnexpectedResponse("listFrames")),
        }
    }

    pub async fn get_children(&self, thread_id: ThreadId, value_id: ValueId) -> Result<Vec<Value>> {
        match self
            .send_request(RequestPayload::GetChildren {
                thread_id,
                value_id,
            })
            .await?
        {
            EventPayload::GetChildren { children } => Ok(children),
            _ => Err(WireError::UnexpectedResponse("getChildren")),
        }
    }

    pub async fn evaluate(&self, thread_id: ThreadId, statement: String) -> Result<Option<Value>> {
        match self
            .send_request(RequestPayload::Evaluate {
                thread_id,
                statement,
            })
            .await?
        {
            EventPayload::Evaluate { result } => Ok(result),
            _ => Err(WireError::UnexpectedResponse("evaluate")),
        }
    }

    pub async fn continue_execution(&self, thread_id: ThreadId, stepping: Stepping) -> Result<()> {
        match self
            .send_request(RequestPayload::ContinueExecution {
                thread_id,
                stepping,
            })
            .await?
        {
            EventPayload::ContinueExecution => Ok(()),
            _ => Err(WireError::UnexpectedResponse("continueExecution")),
        }
    }

    /// Pause `thread_id`, or every thread when it is 0.
    pub async fn pause_thread(&self, thread_id: ThreadId) -> Result<()> {
        match self
            .send_request(RequestPayload::PauseThread { thread_id })
            .await?
        {
            EventPayload::PauseThread => Ok(()),
            _ => Err(WireError::UnexpectedResponse("pauseThread")),
        }
    }
}

async fn read_loop<R>(mut reader: R, inner: Arc<Inner>, events: mpsc::UnboundedSender<ConnectionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let outcome = loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            res = reader.read(&mut chunk) => res,
        };
        let n = match read {
            Ok(0) => break Some(ConnectionEvent::Closed),
            Ok(n) => n,
            Err(err) => {
                break Some(ConnectionEvent::TransportLost {
                    reason: err.to_string(),
                })
            }
        };

        buffer.extend(&chunk[..n]);
        if let Err(err) = dispatch_frames(&mut buffer, &inner, &events) {
            break Some(ConnectionEvent::TransportLost {
                reason: err.to_string(),
            });
        }
    };

    inner.shutdown.cancel();
    let abandoned = inner.pending.lock().abandon_all();

    match &outcome {
        Some(ConnectionEvent::TransportLost { reason }) => {
            tracing::warn!(target: "starbridge.wire", %reason, abandoned, "debug connection lost");
        }
        Some(_) => {
            tracing::info!(target: "starbridge.wire", abandoned, "debug server closed the connection");
        }
        None => {
            tracing::debug!(target: "starbridge.wire", abandoned, "debug connection shut down");
        }
    }

    if let Some(event) = outcome {
        let _ = events.send(event);
    }
}

fn dispatch_frames(
    buffer: &mut FrameBuffer,
    inner: &Inner,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<()> {
    loop {
        let event = match buffer.decode_next::<DebugEvent>() {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(err @ WireError::MalformedFrame { .. }) => {
                tracing::warn!(target: "starbridge.wire", error = %err, "ignoring undecodable frame");
                continue;
            }
            Err(err) => return Err(err),
        };

        if event.is_unsolicited() {
            tracing::trace!(target: "starbridge.wire", event = event.payload.name(), "received event");
            let _ = events.send(ConnectionEvent::Event(event));
            continue;
        }

        let seq = event.sequence_number;
        if !inner.pending.lock().resolve(&seq, event) {
            tracing::debug!(
                target: "starbridge.wire",
                seq,
                "dropping response with no pending request"
            );
        }
    }
}
