use std::io;

use thiserror::Error;

use super::codec::{ProtoReader, ProtoWriter};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to connect after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("debug connection closed")]
    ConnectionClosed,

    #[error("debug server error: {0}")]
    Remote(String),

    #[error("unexpected response payload, expected {0}")]
    UnexpectedResponse(&'static str),

    /// A complete frame whose payload did not decode. The frame has already
    /// been consumed, so the stream stays usable.
    #[error("skipped malformed {len}-byte frame: {source}")]
    MalformedFrame {
        len: usize,
        #[source]
        source: Box<WireError>,
    },
}

pub type Result<T> = std::result::Result<T, WireError>;

pub type ThreadId = i64;
pub type ValueId = i64;
pub type SequenceNumber = i64;

/// Sequence number carried by events the server sends on its own initiative.
pub const UNSOLICITED_SEQUENCE_NUMBER: SequenceNumber = 0;

/// A protobuf message with a hand-written codec.
pub trait Message: Sized {
    fn encode(&self, w: &mut ProtoWriter);

    fn decode(r: ProtoReader<'_>) -> Result<Self>;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        self.encode(&mut w);
        w.into_vec()
    }

    fn decode_from_slice(bytes: &[u8]) -> Result<Self> {
        Self::decode(ProtoReader::new(bytes))
    }

    /// Encode with a varint length prefix.
    fn encode_delimited(&self) -> Vec<u8> {
        super::codec::encode_delimited(&self.encode_to_vec())
    }
}

// ---------------------------------------------------------------------------
// Shared messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub line_number: u32,
    pub column_number: u32,
}

impl Message for Location {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_string(1, &self.path);
        w.write_uint32(2, self.line_number);
        w.write_uint32(3, self.column_number);
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.path = r.read_string()?,
                2 => out.line_number = r.read_uint32()?,
                3 => out.column_number = r.read_uint32()?,
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breakpoint {
    pub location: Option<Location>,
    /// Condition; the breakpoint only fires when this evaluates truthy.
    pub expression: Option<String>,
}

impl Message for Breakpoint {
    fn encode(&self, w: &mut ProtoWriter) {
        if let Some(location) = &self.location {
            w.write_message(1, |w| location.encode(w));
        }
        if let Some(expression) = &self.expression {
            w.write_string(2, expression);
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.location = Some(Location::decode(r.read_message()?)?),
                2 => out.expression = Some(r.read_string()?),
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

/// A Starlark value as rendered by the debug server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    pub label: String,
    pub description: String,
    pub type_name: String,
    pub has_children: bool,
    /// Server-assigned id used with `GetChildrenRequest`; 0 when the value has
    /// no children.
    pub id: ValueId,
}

impl Message for Value {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_string(1, &self.label);
        w.write_string(2, &self.description);
        w.write_string(3, &self.type_name);
        w.write_bool(4, self.has_children);
        w.write_int64(5, self.id);
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.label = r.read_string()?,
                2 => out.description = r.read_string()?,
                3 => out.type_name = r.read_string()?,
                4 => out.has_children = r.read_bool()?,
                5 => out.id = r.read_int64()?,
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub bindings: Vec<Value>,
}

impl Message for Scope {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_string(1, &self.name);
        for binding in &self.bindings {
            w.write_message(2, |w| binding.encode(w));
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.name = r.read_string()?,
                2 => out.bindings.push(Value::decode(r.read_message()?)?),
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub function_name: String,
    pub scopes: Vec<Scope>,
    pub location: Option<Location>,
}

impl Message for Frame {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_string(1, &self.function_name);
        for scope in &self.scopes {
            w.write_message(2, |w| scope.encode(w));
        }
        if let Some(location) = &self.location {
            w.write_message(3, |w| location.encode(w));
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.function_name = r.read_string()?,
                2 => out.scopes.push(Scope::decode(r.read_message()?)?),
                3 => out.location = Some(Location::decode(r.read_message()?)?),
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PauseReason {
    #[default]
    Unset,
    Stepping,
    AllThreadsPaused,
    HitBreakpoint,
    PauseThreadRequest,
    Initializing,
    ConditionalBreakpointError,
}

impl PauseReason {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Stepping,
            2 => Self::AllThreadsPaused,
            3 => Self::HitBreakpoint,
            4 => Self::PauseThreadRequest,
            5 => Self::Initializing,
            6 => Self::ConditionalBreakpointError,
            _ => Self::Unset,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unset => 0,
            Self::Stepping => 1,
            Self::AllThreadsPaused => 2,
            Self::HitBreakpoint => 3,
            Self::PauseThreadRequest => 4,
            Self::Initializing => 5,
            Self::ConditionalBreakpointError => 6,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PausedThread {
    pub id: ThreadId,
    pub name: String,
    pub pause_reason: PauseReason,
    pub location: Option<Location>,
    /// Message of the error raised while evaluating a breakpoint condition.
    pub condition_error: Option<String>,
}

impl Message for PausedThread {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_int64(1, self.id);
        w.write_string(2, &self.name);
        w.write_enum(3, self.pause_reason.as_i32());
        if let Some(location) = &self.location {
            w.write_message(4, |w| location.encode(w));
        }
        if let Some(message) = &self.condition_error {
            w.write_message(5, |w| w.write_string(1, message));
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut out = Self::default();
        while let Some((field, wire_type)) = r.read_key()? {
            match field {
                1 => out.id = r.read_int64()?,
                2 => out.name = r.read_string()?,
                3 => out.pause_reason = PauseReason::from_i32(r.read_enum()?),
                4 => out.location = Some(Location::decode(r.read_message()?)?),
                5 => out.condition_error = Some(decode_error_message(r.read_message()?)?),
                _ => r.skip(wire_type)?,
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Stepping {
    /// Plain continue.
    #[default]
    None,
    Into,
    Over,
    Out,
}

impl Stepping {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Into,
            2 => Self::Over,
            3 => Self::Out,
            _ => Self::None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Into => 1,
            Self::Over => 2,
            Self::Out => 3,
        }
    }
}

fn decode_error_message(mut r: ProtoReader<'_>) -> Result<String> {
    let mut message = String::new();
    while let Some((field, wire_type)) = r.read_key()? {
        match field {
            1 => message = r.read_string()?,
            _ => r.skip(wire_type)?,
        }
    }
    Ok(message)
}

/// Decode a submessage whose only interesting field is an `int64` at field 1.
fn decode_single_int64(mut r: ProtoReader<'_>) -> Result<i64> {
    let mut v = 0;
    while let Some((field, wire_type)) = r.read_key()? {
        match field {
            1 => v = r.read_int64()?,
            _ => r.skip(wire_type)?,
        }
    }
    Ok(v)
}

fn decode_repeated<T: Message>(mut r: ProtoReader<'_>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some((field, wire_type)) = r.read_key()? {
        match field {
            1 => out.push(T::decode(r.read_message()?)?),
            _ => r.skip(wire_type)?,
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

mod field {
    pub const SEQUENCE_NUMBER: u32 = 1;
    pub const LIST_FRAMES: u32 = 101;
    pub const SET_BREAKPOINTS: u32 = 104;
    pub const CONTINUE_EXECUTION: u32 = 105;
    pub const EVALUATE: u32 = 106;
    pub const START_DEBUGGING: u32 = 107;
    pub const PAUSE_THREAD: u32 = 108;
    pub const GET_CHILDREN: u32 = 109;
    pub const THREAD_PAUSED: u32 = 1001;
    pub const THREAD_CONTINUED: u32 = 1002;
    pub const ERROR: u32 = 99999;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    ListFrames { thread_id: ThreadId },
    SetBreakpoints { breakpoints: Vec<Breakpoint> },
    ContinueExecution { thread_id: ThreadId, stepping: Stepping },
    Evaluate { thread_id: ThreadId, statement: String },
    StartDebugging,
    /// `thread_id == 0` pauses every thread.
    PauseThread { thread_id: ThreadId },
    GetChildren { thread_id: ThreadId, value_id: ValueId },
}

impl RequestPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListFrames { .. } => "listFrames",
            Self::SetBreakpoints { .. } => "setBreakpoints",
            Self::ContinueExecution { .. } => "continueExecution",
            Self::Evaluate { .. } => "evaluate",
            Self::StartDebugging => "startDebugging",
            Self::PauseThread { .. } => "pauseThread",
            Self::GetChildren { .. } => "getChildren",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugRequest {
    pub sequence_number: SequenceNumber,
    pub payload: RequestPayload,
}

impl Message for DebugRequest {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_int64(field::SEQUENCE_NUMBER, self.sequence_number);
        match &self.payload {
            RequestPayload::ListFrames { thread_id } => {
                w.write_message(field::LIST_FRAMES, |w| w.write_int64(1, *thread_id));
            }
            RequestPayload::SetBreakpoints { breakpoints } => {
                w.write_message(field::SET_BREAKPOINTS, |w| {
                    for bp in breakpoints {
                        w.write_message(1, |w| bp.encode(w));
                    }
                });
            }
            RequestPayload::ContinueExecution {
                thread_id,
                stepping,
            } => {
                w.write_message(field::CONTINUE_EXECUTION, |w| {
                    w.write_int64(1, *thread_id);
                    w.write_enum(2, stepping.as_i32());
                });
            }
            RequestPayload::Evaluate {
                thread_id,
                statement,
            } => {
                w.write_message(field::EVALUATE, |w| {
                    w.write_int64(1, *thread_id);
                    w.write_string(2, statement);
                });
            }
            RequestPayload::StartDebugging => {
                w.write_message(field::START_DEBUGGING, |_| {});
            }
            RequestPayload::PauseThread { thread_id } => {
                w.write_message(field::PAUSE_THREAD, |w| w.write_int64(1, *thread_id));
            }
            RequestPayload::GetChildren {
                thread_id,
                value_id,
            } => {
                w.write_message(field::GET_CHILDREN, |w| {
                    w.write_int64(1, *thread_id);
                    w.write_int64(2, *value_id);
                });
            }
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut sequence_number = 0;
        let mut payload = None;
        while let Some((f, wire_type)) = r.read_key()? {
            match f {
                field::SEQUENCE_NUMBER => sequence_number = r.read_int64()?,
                field::LIST_FRAMES => {
                    payload = Some(RequestPayload::ListFrames {
                        thread_id: decode_single_int64(r.read_message()?)?,
                    })
                }
                field::SET_BREAKPOINTS => {
                    payload = Some(RequestPayload::SetBreakpoints {
                        breakpoints: decode_repeated(r.read_message()?)?,
                    })
                }
                field::CONTINUE_EXECUTION => {
                    let mut m = r.read_message()?;
                    let (mut thread_id, mut stepping) = (0, Stepping::None);
                    while let Some((f, wt)) = m.read_key()? {
                        match f {
                            1 => thread_id = m.read_int64()?,
                            2 => stepping = Stepping::from_i32(m.read_enum()?),
                            _ => m.skip(wt)?,
                        }
                    }
                    payload = Some(RequestPayload::ContinueExecution {
                        thread_id,
                        stepping,
                    });
                }
                field::EVALUATE => {
                    let mut m = r.read_message()?;
                    let (mut thread_id, mut statement) = (0, String::new());
                    while let Some((f, wt)) = m.read_key()? {
                        match f {
                            1 => thread_id = m.read_int64()?,
                            2 => statement = m.read_string()?,
                            _ => m.skip(wt)?,
                        }
                    }
                    payload = Some(RequestPayload::Evaluate {
                        thread_id,
                        statement,
                    });
                }
                field::START_DEBUGGING => {
                    r.skip(wire_type)?;
                    payload = Some(RequestPayload::StartDebugging);
                }
                field::PAUSE_THREAD => {
                    payload = Some(RequestPayload::PauseThread {
                        thread_id: decode_single_int64(r.read_message()?)?,
                    })
                }
                field::GET_CHILDREN => {
                    let mut m = r.read_message()?;
                    let (mut thread_id, mut value_id) = (0, 0);
                    while let Some((f, wt)) = m.read_key()? {
                        match f {
                            1 => thread_id = m.read_int64()?,
                            2 => value_id = m.read_int64()?,
                            _ => m.skip(wt)?,
                        }
                    }
                    payload = Some(RequestPayload::GetChildren {
                        thread_id,
                        value_id,
                    });
                }
                _ => r.skip(wire_type)?,
            }
        }
        let payload = payload
            .ok_or_else(|| WireError::Protocol("DebugRequest without payload".to_string()))?;
        Ok(Self {
            sequence_number,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Responses and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Request failed on the server side.
    Error { message: String },
    ListFrames { frames: Vec<Frame> },
    SetBreakpoints,
    ContinueExecution,
    Evaluate { result: Option<Value> },
    StartDebugging,
    PauseThread,
    GetChildren { children: Vec<Value> },
    ThreadPaused { thread: PausedThread },
    ThreadContinued { thread_id: ThreadId },
    /// A oneof member this client does not understand, or none at all.
    Unknown { field: u32 },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::ListFrames { .. } => "listFrames",
            Self::SetBreakpoints => "setBreakpoints",
            Self::ContinueExecution => "continueExecution",
            Self::Evaluate { .. } => "evaluate",
            Self::StartDebugging => "startDebugging",
            Self::PauseThread => "pauseThread",
            Self::GetChildren { .. } => "getChildren",
            Self::ThreadPaused { .. } => "threadPaused",
            Self::ThreadContinued { .. } => "threadContinued",
            Self::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub sequence_number: SequenceNumber,
    pub payload: EventPayload,
}

impl DebugEvent {
    pub fn is_unsolicited(&self) -> bool {
        self.sequence_number == UNSOLICITED_SEQUENCE_NUMBER
    }
}

impl Message for DebugEvent {
    fn encode(&self, w: &mut ProtoWriter) {
        w.write_int64(field::SEQUENCE_NUMBER, self.sequence_number);
        match &self.payload {
            EventPayload::Error { message } => {
                w.write_message(field::ERROR, |w| w.write_string(1, message));
            }
            EventPayload::ListFrames { frames } => {
                w.write_message(field::LIST_FRAMES, |w| {
                    for frame in frames {
                        w.write_message(1, |w| frame.encode(w));
                    }
                });
            }
            EventPayload::SetBreakpoints => w.write_message(field::SET_BREAKPOINTS, |_| {}),
            EventPayload::ContinueExecution => w.write_message(field::CONTINUE_EXECUTION, |_| {}),
            EventPayload::Evaluate { result } => {
                w.write_message(field::EVALUATE, |w| {
                    if let Some(value) = result {
                        w.write_message(1, |w| value.encode(w));
                    }
                });
            }
            EventPayload::StartDebugging => w.write_message(field::START_DEBUGGING, |_| {}),
            EventPayload::PauseThread => w.write_message(field::PAUSE_THREAD, |_| {}),
            EventPayload::GetChildren { children } => {
                w.write_message(field::GET_CHILDREN, |w| {
                    for child in children {
                        w.write_message(1, |w| child.encode(w));
                    }
                });
            }
            EventPayload::ThreadPaused { thread } => {
                w.write_message(field::THREAD_PAUSED, |w| {
                    w.write_message(1, |w| thread.encode(w));
                });
            }
            EventPayload::ThreadContinued { thread_id } => {
                w.write_message(field::THREAD_CONTINUED, |w| w.write_int64(1, *thread_id));
            }
            EventPayload::Unknown { .. } => {}
        }
    }

    fn decode(mut r: ProtoReader<'_>) -> Result<Self> {
        let mut sequence_number = 0;
        let mut payload = None;
        let mut unknown_field = 0;
        while let Some((f, wire_type)) = r.read_key()? {
            let decoded = match f {
                field::SEQUENCE_NUMBER => {
                    sequence_number = r.read_int64()?;
                    continue;
                }
                field::ERROR => EventPayload::Error {
                    message: decode_error_message(r.read_message()?)?,
                },
                field::LIST_FRAMES => EventPayload::ListFrames {
                    frames: decode_repeated(r.read_message()?)?,
                },
                field::SET_BREAKPOINTS => {
                    r.skip(wire_type)?;
                    EventPayload::SetBreakpoints
                }
                field::CONTINUE_EXECUTION => {
                    r.skip(wire_type)?;
                    EventPayload::ContinueExecution
                }
                field::EVALUATE => {
                    let mut m = r.read_message()?;
                    let mut result = None;
                    while let Some((f, wt)) = m.read_key()? {
                        match f {
                            1 => result = Some(Value::decode(m.read_message()?)?),
                            _ => m.skip(wt)?,
                        }
                    }
                    EventPayload::Evaluate { result }
                }
                field::START_DEBUGGING => {
                    r.skip(wire_type)?;
                    EventPayload::StartDebugging
                }
                field::PAUSE_THREAD => {
                    r.skip(wire_type)?;
                    EventPayload::PauseThread
                }
                field::GET_CHILDREN => EventPayload::GetChildren {
                    children: decode_repeated(r.read_message()?)?,
                },
                field::THREAD_PAUSED => {
                    let mut m = r.read_message()?;
                    let mut thread = PausedThread::default();
                    while let Some((f, wt)) = m.read_key()? {
                        match f {
                            1 => thread = PausedThread::decode(m.read_message()?)?,
                            _ => m.skip(wt)?,
                        }
                    }
                    EventPayload::ThreadPaused { thread }
                }
                field::THREAD_CONTINUED => EventPayload::ThreadContinued {
                    thread_id: decode_single_int64(r.read_message()?)?,
                },
                other => {
                    // Unknown fields never displace a payload already read.
                    r.skip(wire_type)?;
                    if payload.is_none() && unknown_field == 0 {
                        unknown_field = other;
                    }
                    continue;
                }
            };
            payload = Some(decoded);
        }
        Ok(Self {
            sequence_number,
            payload: payload.unwrap_or(EventPayload::Unknown {
                field: unknown_field,
            }),
        })
    }
}
