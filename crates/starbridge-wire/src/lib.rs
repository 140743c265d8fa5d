//! Wire-level client for Bazel's Starlark debug server.
//!
//! Bazel exposes its in-process Starlark debugger over a raw TCP socket when
//! started with `--experimental_skylark_debug`. Messages are protobuf-encoded
//! `DebugRequest`/`DebugEvent` envelopes, each prefixed with a varint length.
//!
//! `starbridge-dap` consumes this crate to bridge the editor's Debug Adapter
//! Protocol onto that socket.

pub mod wire;

pub use wire::{
    Breakpoint, ConnectionEvent, DebugConnection, DebugEvent, DebugRequest, EventPayload, Frame,
    Location, PauseReason, PausedThread, RequestPayload, Result, RetryPolicy, Scope, Stepping,
    ThreadId, Value, ValueId, WireError,
};

/// Decode a single, complete length-delimited `DebugEvent` frame.
///
/// Returns `Ok(None)` when `bytes` holds an incomplete frame. Trailing bytes
/// after the first frame are ignored.
pub fn decode_event_bytes(bytes: &[u8]) -> Result<Option<DebugEvent>> {
    let mut buffer = wire::FrameBuffer::new();
    buffer.extend(bytes);
    buffer.decode_next()
}

/// Decode a single, complete length-delimited `DebugRequest` frame.
pub fn decode_request_bytes(bytes: &[u8]) -> Result<Option<DebugRequest>> {
    let mut buffer = wire::FrameBuffer::new();
    buffer.extend(bytes);
    buffer.decode_next()
}
