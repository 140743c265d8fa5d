use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::mpsc,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    buffer::FrameBuffer,
    types::{
        DebugEvent, DebugRequest, EventPayload, Frame, Message, PauseReason, PausedThread,
        RequestPayload, Stepping, ThreadId, Value, ValueId, UNSOLICITED_SEQUENCE_NUMBER,
    },
};

/// A tiny Starlark debug server used for unit/integration testing.
///
/// It answers every request kind from canned data so `starbridge-dap` can be
/// exercised without a Bazel installation. One client connection is served.
pub struct MockDebugServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockDebugServerConfig {
    /// Returned by `listFrames` for any thread.
    pub frames: Vec<Frame>,
    /// Returned by `getChildren`, keyed by value id. Unknown ids get an error.
    pub children: HashMap<ValueId, Vec<Value>>,
    /// Returned by `evaluate`, keyed by the statement. Unknown statements get
    /// an error, the way Bazel reports a failed evaluation.
    pub evaluations: HashMap<String, Value>,
    /// Emitted as `threadPaused` right after the `startDebugging` response.
    pub pause_on_start: Option<PausedThread>,
    /// Emit `threadContinued` after each `continueExecution` response.
    pub emit_thread_continued: bool,
    /// After a stepping `continueExecution`, pause the same thread again with
    /// reason `STEPPING`.
    pub pause_after_step: bool,
    /// Delay the response to the named request kind (see
    /// [`RequestPayload::name`]). Other requests are still answered meanwhile.
    pub reply_delays: HashMap<&'static str, Duration>,
    /// Write outbound bytes in chunks of at most this size.
    pub chunk_size: Option<usize>,
}

impl Default for MockDebugServerConfig {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            children: HashMap::new(),
            evaluations: HashMap::new(),
            pause_on_start: None,
            emit_thread_continued: true,
            pause_after_step: false,
            reply_delays: HashMap::new(),
            chunk_size: None,
        }
    }
}

impl MockDebugServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockDebugServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockDebugServerConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State {
            config,
            requests: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            connections: AtomicU32::new(0),
        });
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, task_shutdown).await {
                tracing::debug!(target: "starbridge.wire", error = %err, "mock debug server stopped");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<DebugRequest> {
        self.state.requests.lock().clone()
    }

    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Push an unsolicited event to the connected client.
    ///
    /// Returns `false` if no client is connected.
    pub fn emit_event(&self, payload: EventPayload) -> bool {
        self.state.send(DebugEvent {
            sequence_number: UNSOLICITED_SEQUENCE_NUMBER,
            payload,
        })
    }

    pub fn pause_thread(&self, thread: PausedThread) -> bool {
        self.emit_event(EventPayload::ThreadPaused { thread })
    }

    pub fn continue_thread(&self, thread_id: ThreadId) -> bool {
        self.emit_event(EventPayload::ThreadContinued { thread_id })
    }

    /// Drop the client connection, as if Bazel had exited.
    pub fn disconnect(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockDebugServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    config: MockDebugServerConfig,
    requests: Mutex<Vec<DebugRequest>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<DebugEvent>>>,
    connections: AtomicU32,
}

impl State {
    fn send(&self, event: DebugEvent) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<DebugEvent>> {
        self.outbound.lock().clone()
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };
    state.connections.fetch_add(1, Ordering::Relaxed);
    let _ = socket.set_nodelay(true);

    let (mut reader, writer) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    *state.outbound.lock() = Some(tx);

    let writer_task = tokio::spawn(write_loop(
        writer,
        rx,
        state.config.chunk_size,
        shutdown.clone(),
    ));

    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; 4096];
    let result = 'read: loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            res = reader.read(&mut chunk) => match res {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(err) => break Err(err),
            },
        };
        buffer.extend(&chunk[..n]);
        loop {
            match buffer.decode_next::<DebugRequest>() {
                Ok(Some(request)) => handle_request(&state, request),
                Ok(None) => break,
                Err(err) => {
                    break 'read Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err));
                }
            }
        }
    };

    state.outbound.lock().take();
    shutdown.cancel();
    let _ = writer_task.await;
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<DebugEvent>,
    chunk_size: Option<usize>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let bytes = event.encode_delimited();
        let chunk_size = chunk_size.unwrap_or(bytes.len()).max(1);
        for piece in bytes.chunks(chunk_size) {
            if writer.write_all(piece).await.is_err() || writer.flush().await.is_err() {
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

fn handle_request(state: &Arc<State>, request: DebugRequest) {
    state.requests.lock().push(request.clone());

    let seq = request.sequence_number;
    let name = request.payload.name();
    let config = &state.config;
    let mut follow_up = Vec::new();

    let payload = match request.payload {
        RequestPayload::StartDebugging => {
            if let Some(thread) = &config.pause_on_start {
                follow_up.push(EventPayload::ThreadPaused {
                    thread: thread.clone(),
                });
            }
            EventPayload::StartDebugging
        }
        RequestPayload::SetBreakpoints { .. } => EventPayload::SetBreakpoints,
        RequestPayload::ListFrames { .. } => EventPayload::ListFrames {
            frames: config.frames.clone(),
        },
        RequestPayload::GetChildren { value_id, .. } => match config.children.get(&value_id) {
            Some(children) => EventPayload::GetChildren {
                children: children.clone(),
            },
            None => EventPayload::Error {
                message: format!("no value with id {value_id}"),
            },
        },
        RequestPayload::Evaluate { statement, .. } => match config.evaluations.get(&statement) {
            Some(value) => EventPayload::Evaluate {
                result: Some(value.clone()),
            },
            None => EventPayload::Error {
                message: format!("name '{statement}' is not defined"),
            },
        },
        RequestPayload::ContinueExecution {
            thread_id,
            stepping,
        } => {
            if config.emit_thread_continued {
                follow_up.push(EventPayload::ThreadContinued { thread_id });
            }
            if config.pause_after_step && stepping != Stepping::None {
                follow_up.push(EventPayload::ThreadPaused {
                    thread: PausedThread {
                        id: thread_id,
                        name: format!("thread-{thread_id}"),
                        pause_reason: PauseReason::Stepping,
                        ..PausedThread::default()
                    },
                });
            }
            EventPayload::ContinueExecution
        }
        RequestPayload::PauseThread { thread_id } => {
            let id = if thread_id == 0 { 1 } else { thread_id };
            follow_up.push(EventPayload::ThreadPaused {
                thread: PausedThread {
                    id,
                    name: format!("thread-{id}"),
                    pause_reason: if thread_id == 0 {
                        PauseReason::AllThreadsPaused
                    } else {
                        PauseReason::PauseThreadRequest
                    },
                    ..PausedThread::default()
                },
            });
            EventPayload::PauseThread
        }
    };

    let mut outgoing = vec![DebugEvent {
        sequence_number: seq,
        payload,
    }];
    outgoing.extend(follow_up.into_iter().map(|payload| DebugEvent {
        sequence_number: UNSOLICITED_SEQUENCE_NUMBER,
        payload,
    }));

    match config.reply_delays.get(name).copied() {
        Some(delay) => {
            let Some(tx) = state.sender() else { return };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for event in outgoing {
                    let _ = tx.send(event);
                }
            });
        }
        None => {
            for event in outgoing {
                state.send(event);
            }
        }
    }
}
