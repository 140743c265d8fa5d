//! Wire-level Starlark debugging protocol.
//!
//! This module speaks Bazel's `starlark_debugging.proto` over TCP. It is
//! async (`tokio`) and correlates responses by sequence number.

mod buffer;
mod client;
mod codec;
mod pending;
pub mod types;

pub use buffer::FrameBuffer;
pub use client::{ConnectionEvent, DebugConnection, RetryPolicy};
pub use codec::{encode_delimited, split_frame, ProtoReader, ProtoWriter, WireType, MAX_FRAME_BYTES};
pub use pending::PendingRequests;
pub use types::{
    Breakpoint, DebugEvent, DebugRequest, EventPayload, Frame, Location, Message, PauseReason,
    PausedThread, RequestPayload, Result, Scope, SequenceNumber, Stepping, ThreadId, Value,
    ValueId, WireError, UNSOLICITED_SEQUENCE_NUMBER,
};

// The mock debug server is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
