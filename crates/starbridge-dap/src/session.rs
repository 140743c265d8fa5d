//! The DAP session state machine.
//!
//! A [`DebugSession`] owns everything the editor can refer to by id: paused
//! threads, frame and variable handles, and the per-file breakpoint table. The
//! Bazel side is reached through a [`DebugConnection`]; unsolicited events
//! from it and output from the Bazel process are pumped into the session by
//! background tasks.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

use starbridge_config::DebuggerConfig;
use starbridge_wire::{
    Breakpoint, ConnectionEvent, DebugConnection, DebugEvent, EventPayload, Frame, Location,
    PauseReason, PausedThread, RetryPolicy, Stepping, ThreadId, Value, ValueId, WireError,
};

use crate::dap_tokio::{
    ContinuedEvent, Event, OutputCategory, OutputEvent, Request, StoppedEvent,
};
use crate::error::{SessionError, SessionResult};
use crate::handles::{Handle, HandleRegistry, ThreadBound, NO_HANDLE};
use crate::launcher::{self, BazelProcess, LaunchArguments, ProcessEvent};
use crate::paths::{resolve_real_path, BazelInfo};
use crate::server::Outbound;

/// Shown in place of the function name for top-level frames.
const GLOBAL_SCOPE_NAME: &str = "<global scope>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Uninitialized,
    Initializing,
    AwaitingLaunch,
    Connecting,
    Running,
    Terminated,
}

/// What a variables handle expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VariableRef {
    /// A frame scope; its bindings arrived with the frame.
    Scope(Vec<Value>),
    /// A value whose children must be fetched from Bazel.
    Value(ValueId),
}

#[derive(Debug, Default)]
struct State {
    phase: Phase,
    connection: Option<DebugConnection>,
    process: Option<BazelProcess>,
    bazel_info: BazelInfo,
    paused: BTreeMap<ThreadId, PausedThread>,
    /// Keyed by both the editor path and the external-staging path.
    source_breakpoints: BTreeMap<String, Vec<Breakpoint>>,
    frames: HandleRegistry<ThreadBound<Frame>>,
    variables: HandleRegistry<ThreadBound<VariableRef>>,
    /// Bumped every time the handle registries are cleared.
    resumes: u64,
}

impl State {
    fn connection(&self) -> SessionResult<DebugConnection> {
        self.connection.clone().ok_or(SessionError::NotConnected)
    }

    fn clear_handles(&mut self) {
        self.frames.clear();
        self.variables.clear();
        self.resumes += 1;
    }

    /// Fails if execution resumed after `resumes` was sampled.
    fn ensure_not_resumed(&self, resumes: u64, thread_id: ThreadId) -> SessionResult<()> {
        if self.resumes == resumes {
            Ok(())
        } else {
            Err(SessionError::Resumed(thread_id))
        }
    }
}

struct Inner {
    config: DebuggerConfig,
    out: Outbound,
    state: Mutex<State>,
}

/// One editor debugging session. Cheap to clone.
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<Inner>,
}

impl DebugSession {
    pub fn new(config: DebuggerConfig, out: Outbound) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                out,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock()
    }

    fn connection(&self) -> SessionResult<DebugConnection> {
        self.state().connection()
    }

    /// Handle one request and send its response, plus any events that must
    /// follow it.
    pub async fn handle(&self, request: Request) {
        tracing::debug!(target: "starbridge.dap", command = %request.command, seq = request.seq, "request");
        let out = &self.inner.out;
        match request.command.as_str() {
            "initialize" => {
                self.state().phase = Phase::Initializing;
                out.respond(&request, Ok(Some(capabilities())));
                let mut state = self.state();
                if state.phase == Phase::Initializing {
                    state.phase = Phase::AwaitingLaunch;
                }
            }
            "launch" => {
                let result = self.launch(&request.arguments).await;
                let fatal = matches!(result, Err(SessionError::Launch(_) | SessionError::Wire(_)));
                let launched = result.is_ok();
                out.respond(&request, result);
                if launched {
                    out.send_event(Event::Initialized);
                } else if fatal {
                    self.terminate(None);
                }
            }
            "disconnect" => {
                let first = self.disconnect().await;
                out.respond(&request, Ok(None));
                if first {
                    out.send_event(Event::Terminated);
                }
            }
            _ => {
                let result = self.dispatch(&request).await;
                out.respond(&request, result);
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> SessionResult<Option<JsonValue>> {
        let args = &request.arguments;
        match request.command.as_str() {
            "configurationDone" => self.configuration_done().await,
            "setBreakpoints" => self.set_breakpoints(args).await,
            "threads" => Ok(Some(self.threads())),
            "stackTrace" => self.stack_trace(args).await,
            "scopes" => self.scopes(args),
            "variables" => self.variables(args).await,
            "evaluate" => self.evaluate(args).await,
            "continue" => self.resume(args, "continue", Stepping::None).await,
            "next" => self.resume(args, "next", Stepping::Over).await,
            "stepIn" => self.resume(args, "stepIn", Stepping::Into).await,
            "stepOut" => self.resume(args, "stepOut", Stepping::Out).await,
            "pause" => self.pause(args).await,
            other => Err(SessionError::InvalidRequest(format!(
                "unsupported request {other}"
            ))),
        }
    }

    async fn launch(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let args: LaunchArguments = serde_json::from_value(args.clone())
            .map_err(|err| SessionError::InvalidRequest(format!("invalid launch arguments: {err}")))?;

        {
            let mut state = self.state();
            match state.phase {
                Phase::Uninitialized | Phase::Initializing | Phase::AwaitingLaunch => {
                    state.phase = Phase::Connecting;
                }
                phase => {
                    return Err(SessionError::InvalidRequest(format!(
                        "cannot launch in state {phase:?}"
                    )))
                }
            }
        }

        let config = &self.inner.config;
        let executable = args.executable(config).to_string();
        let port = args.port(config);

        let info = launcher::query_info(&executable, args.startup_options(), &args.cwd).await?;
        self.state().bazel_info = info;

        let (process, process_events) =
            launcher::spawn(&executable, &args.bazel_args(port), &args.cwd)?;
        self.state().process = Some(process);
        self.spawn_process_pump(process_events);

        let policy = RetryPolicy {
            attempts: config.connect_attempts,
            delay: config.connect_retry_delay(),
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (connection, events) = DebugConnection::connect_with_policy(addr, &policy).await?;

        let terminated = {
            let mut state = self.state();
            if state.phase == Phase::Terminated {
                true
            } else {
                state.connection = Some(connection.clone());
                state.phase = Phase::Running;
                false
            }
        };
        if terminated {
            connection.shutdown().await;
            return Err(SessionError::Launch(
                "bazel exited before the debugger connected".to_string(),
            ));
        }
        self.spawn_connection_pump(events);
        Ok(None)
    }

    async fn configuration_done(&self) -> SessionResult<Option<JsonValue>> {
        self.connection()?.start_debugging().await?;
        Ok(None)
    }

    async fn set_breakpoints(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let path = args
            .pointer("/source/path")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                SessionError::InvalidRequest("setBreakpoints.source.path is required".to_string())
            })?;
        let requested: Vec<(u32, Option<String>)> = args
            .get("breakpoints")
            .and_then(JsonValue::as_array)
            .map(|breakpoints| {
                breakpoints
                    .iter()
                    .filter_map(|bp| {
                        let line = bp.get("line").and_then(JsonValue::as_u64)?;
                        let condition = bp
                            .get("condition")
                            .and_then(JsonValue::as_str)
                            .filter(|c| !c.trim().is_empty())
                            .map(str::to_string);
                        Some((u32::try_from(line).unwrap_or(u32::MAX), condition))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (connection, union) = {
            let mut state = self.state();
            let connection = state.connection()?;

            let mut paths = vec![path.to_string()];
            if let Some(external) = state.bazel_info.external_path(Path::new(path)) {
                paths.push(external.to_string_lossy().into_owned());
            }
            for key in paths {
                let breakpoints = breakpoints_at(&key, &requested);
                if breakpoints.is_empty() {
                    state.source_breakpoints.remove(&key);
                } else {
                    state.source_breakpoints.insert(key, breakpoints);
                }
            }

            let union: Vec<Breakpoint> = state
                .source_breakpoints
                .values()
                .flatten()
                .cloned()
                .collect();
            (connection, union)
        };

        tracing::debug!(target: "starbridge.dap", path, count = union.len(), "setting breakpoints");
        connection.set_breakpoints(union).await?;

        let breakpoints: Vec<JsonValue> = requested
            .iter()
            .map(|(line, _)| json!({ "verified": true, "line": line }))
            .collect();
        Ok(Some(json!({ "breakpoints": breakpoints })))
    }

    fn threads(&self) -> JsonValue {
        let state = self.state();
        let threads: Vec<JsonValue> = state
            .paused
            .values()
            .map(|thread| json!({ "id": thread.id, "name": thread.name }))
            .collect();
        json!({ "threads": threads })
    }

    async fn stack_trace(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let thread_id = required_i64(args, "stackTrace", "threadId")?;
        let start = args
            .get("startFrame")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as usize;
        let levels = args
            .get("levels")
            .and_then(JsonValue::as_u64)
            .filter(|levels| *levels > 0)
            .map_or(usize::MAX, |levels| levels as usize);

        let (connection, resumes) = {
            let state = self.state();
            (state.connection()?, state.resumes)
        };
        let frames = connection.list_frames(thread_id).await?;
        let total = frames.len();

        // Resolve paths before taking the lock; it touches the filesystem.
        let page: Vec<(Frame, Option<JsonValue>)> = frames
            .into_iter()
            .skip(start)
            .take(levels)
            .map(|frame| {
                let source = frame.location.as_ref().map(source_json);
                (frame, source)
            })
            .collect();

        let mut state = self.state();
        state.ensure_not_resumed(resumes, thread_id)?;
        let stack_frames: Vec<JsonValue> = page
            .into_iter()
            .map(|(frame, source)| {
                let json = frame_json(&frame, source);
                let id = state.frames.create(ThreadBound::new(thread_id, frame));
                with_id(json, id)
            })
            .collect();

        Ok(Some(json!({
            "stackFrames": stack_frames,
            "totalFrames": total,
        })))
    }

    fn scopes(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let frame_id = required_i64(args, "scopes", "frameId")?;
        let mut state = self.state();
        let frame = state.frames.get(frame_id)?.clone();

        let scopes: Vec<JsonValue> = frame
            .value
            .scopes
            .iter()
            .map(|scope| {
                let handle = state.variables.create(ThreadBound::new(
                    frame.thread_id,
                    VariableRef::Scope(scope.bindings.clone()),
                ));
                json!({
                    "name": scope.name,
                    "variablesReference": handle,
                    "expensive": false,
                })
            })
            .collect();
        Ok(Some(json!({ "scopes": scopes })))
    }

    async fn variables(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let reference = required_i64(args, "variables", "variablesReference")?;
        let (entry, resumes) = {
            let state = self.state();
            (state.variables.get(reference)?.clone(), state.resumes)
        };

        let values = match entry.value {
            VariableRef::Scope(bindings) => bindings,
            VariableRef::Value(value_id) => {
                self.connection()?
                    .get_children(entry.thread_id, value_id)
                    .await?
            }
        };

        let mut state = self.state();
        state.ensure_not_resumed(resumes, entry.thread_id)?;
        let variables: Vec<JsonValue> = values
            .iter()
            .map(|value| {
                let handle = value_handle(&mut state.variables, entry.thread_id, value);
                json!({
                    "name": value.label,
                    "value": value.description,
                    "type": value.type_name,
                    "variablesReference": handle,
                })
            })
            .collect();
        Ok(Some(json!({ "variables": variables })))
    }

    async fn evaluate(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        let expression = args
            .get("expression")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| {
                SessionError::InvalidRequest("evaluate.expression is required".to_string())
            })?;
        let frame_id = args
            .get("frameId")
            .and_then(JsonValue::as_i64)
            .unwrap_or(NO_HANDLE);

        let (connection, thread_id, resumes) = {
            let state = self.state();
            let connection = state.connection()?;
            let frame = state
                .frames
                .get(frame_id)
                .map_err(|_| SessionError::StaleHandle(frame_id))?;
            (connection, frame.thread_id, state.resumes)
        };

        let result = match connection
            .evaluate(thread_id, expression.to_string())
            .await
        {
            Ok(result) => result,
            Err(WireError::Remote(message)) => {
                tracing::warn!(
                    target: "starbridge.dap",
                    thread_id,
                    expression,
                    error = %message,
                    "evaluation failed"
                );
                None
            }
            Err(err) => return Err(err.into()),
        };

        let Some(value) = result else {
            return Ok(Some(json!({ "result": "", "variablesReference": NO_HANDLE })));
        };
        let mut state = self.state();
        state.ensure_not_resumed(resumes, thread_id)?;
        let handle = value_handle(&mut state.variables, thread_id, &value);
        Ok(Some(json!({
            "result": value.description,
            "type": value.type_name,
            "variablesReference": handle,
        })))
    }

    async fn resume(
        &self,
        args: &JsonValue,
        command: &str,
        stepping: Stepping,
    ) -> SessionResult<Option<JsonValue>> {
        let thread_id = required_i64(args, command, "threadId")?;
        let connection = {
            let mut state = self.state();
            let connection = state.connection()?;
            state.clear_handles();
            state.paused.remove(&thread_id);
            connection
        };
        connection.continue_execution(thread_id, stepping).await?;

        Ok(match stepping {
            Stepping::None => Some(json!({ "allThreadsContinued": false })),
            _ => None,
        })
    }

    async fn pause(&self, args: &JsonValue) -> SessionResult<Option<JsonValue>> {
        // Thread 0 asks Bazel to pause every thread.
        let thread_id = args
            .get("threadId")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        self.connection()?.pause_thread(thread_id).await?;
        Ok(None)
    }

    /// Tear everything down without notifying the editor. Returns `false` if
    /// the session had already terminated.
    pub async fn disconnect(&self) -> bool {
        let Some((connection, process)) = self.mark_terminated() else {
            return false;
        };
        if let Some(process) = process {
            process.kill();
        }
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
        true
    }

    /// Move to `Terminated`, returning the resources to release. `None` when
    /// the session was already terminated.
    fn mark_terminated(&self) -> Option<(Option<DebugConnection>, Option<BazelProcess>)> {
        let mut state = self.state();
        if state.phase == Phase::Terminated {
            return None;
        }
        state.phase = Phase::Terminated;
        state.paused.clear();
        state.clear_handles();
        Some((state.connection.take(), state.process.take()))
    }

    /// End the session from the Bazel side and emit `terminated` once.
    fn terminate(&self, message: Option<String>) {
        let Some((connection, process)) = self.mark_terminated() else {
            return;
        };
        if let Some(process) = process {
            process.kill();
        }
        if let Some(connection) = connection {
            tokio::spawn(async move { connection.shutdown().await });
        }

        let out = &self.inner.out;
        if let Some(message) = message {
            tracing::info!(target: "starbridge.dap", %message, "session terminated");
            out.send_event(Event::Output(OutputEvent::line(
                OutputCategory::Console,
                message,
            )));
        }
        out.send_event(Event::Terminated);
    }

    fn spawn_connection_pump(&self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected { attempts } => {
                        tracing::debug!(target: "starbridge.dap", attempts, "debug server connected");
                    }
                    ConnectionEvent::Event(event) => session.on_debug_event(event),
                    ConnectionEvent::TransportLost { reason } => {
                        session.terminate(Some(format!(
                            "Lost connection to the Bazel debug server: {reason}"
                        )));
                        break;
                    }
                    ConnectionEvent::Closed => {
                        session.terminate(Some(
                            "The Bazel debug server closed the connection".to_string(),
                        ));
                        break;
                    }
                }
            }
        });
    }

    fn spawn_process_pump(&self, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Output(line) => session.inner.out.send_event(Event::Output(
                        OutputEvent::line(OutputCategory::Stdout, line),
                    )),
                    ProcessEvent::Exited(code) => {
                        let message = match code {
                            Some(code) => format!("Bazel exited with code {code}"),
                            None => "Bazel was terminated".to_string(),
                        };
                        session.terminate(Some(message));
                        break;
                    }
                }
            }
        });
    }

    fn on_debug_event(&self, event: DebugEvent) {
        let out = &self.inner.out;
        match event.payload {
            EventPayload::ThreadPaused { thread } => {
                let stopped = stopped_event(&thread);
                self.state().paused.insert(thread.id, thread);
                out.send_event(Event::Stopped(stopped));
            }
            EventPayload::ThreadContinued { thread_id } => {
                self.state().paused.remove(&thread_id);
                out.send_event(Event::Continued(ContinuedEvent {
                    thread_id,
                    all_threads_continued: false,
                }));
            }
            EventPayload::Error { message } => {
                tracing::warn!(target: "starbridge.dap", %message, "debug server reported an error");
            }
            other => {
                tracing::debug!(target: "starbridge.dap", event = other.name(), "ignoring unsolicited event");
            }
        }
    }
}

fn capabilities() -> JsonValue {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsConditionalBreakpoints": true,
        "supportsEvaluateForHovers": true,
    })
}

fn required_i64(args: &JsonValue, command: &str, key: &str) -> SessionResult<i64> {
    args.get(key)
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| SessionError::InvalidRequest(format!("{command}.{key} is required")))
}

fn breakpoints_at(path: &str, requested: &[(u32, Option<String>)]) -> Vec<Breakpoint> {
    requested
        .iter()
        .map(|(line, condition)| Breakpoint {
            location: Some(Location {
                path: path.to_string(),
                line_number: *line,
                column_number: 0,
            }),
            expression: condition.clone(),
        })
        .collect()
}

/// Handle for `value` if the editor may expand it, otherwise [`NO_HANDLE`].
fn value_handle(
    registry: &mut HandleRegistry<ThreadBound<VariableRef>>,
    thread_id: ThreadId,
    value: &Value,
) -> Handle {
    if value.has_children && value.id != 0 {
        registry.create(ThreadBound::new(thread_id, VariableRef::Value(value.id)))
    } else {
        NO_HANDLE
    }
}

fn source_json(location: &Location) -> JsonValue {
    let path = resolve_real_path(&location.path);
    let name = Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());
    json!({ "name": name, "path": path })
}

fn frame_json(frame: &Frame, source: Option<JsonValue>) -> JsonValue {
    let name = if frame.function_name.is_empty() {
        GLOBAL_SCOPE_NAME
    } else {
        frame.function_name.as_str()
    };
    let (line, column) = frame
        .location
        .as_ref()
        .map_or((0, 0), |location| (location.line_number, location.column_number));

    let mut json = json!({ "name": name, "line": line, "column": column });
    if let Some(source) = source {
        json["source"] = source;
    }
    json
}

fn with_id(mut json: JsonValue, id: Handle) -> JsonValue {
    json["id"] = json!(id);
    json
}

fn stopped_reason(reason: PauseReason) -> &'static str {
    match reason {
        PauseReason::Stepping => "step",
        PauseReason::HitBreakpoint => "breakpoint",
        PauseReason::Initializing => "entry",
        PauseReason::ConditionalBreakpointError => "exception",
        PauseReason::PauseThreadRequest | PauseReason::AllThreadsPaused | PauseReason::Unset => {
            "pause"
        }
    }
}

fn stopped_event(thread: &PausedThread) -> StoppedEvent {
    let condition_error = match thread.pause_reason {
        PauseReason::ConditionalBreakpointError => thread.condition_error.clone(),
        _ => None,
    };
    StoppedEvent {
        reason: stopped_reason(thread.pause_reason),
        thread_id: thread.id,
        all_threads_stopped: false,
        description: condition_error.clone(),
        text: condition_error,
    }
}
