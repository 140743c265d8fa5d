use thiserror::Error;

use starbridge_wire::WireError;

use crate::handles::HandleError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("not connected")]
    NotConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An `evaluate` against a frame handle that no longer exists, usually
    /// because execution resumed since the frame was listed.
    #[error("stale scope: frame {0} is no longer valid")]
    StaleHandle(i64),

    /// Execution resumed while the request waited on Bazel, so the frames or
    /// values it fetched are already gone.
    #[error("stale scope: thread {0} resumed while the request was in flight")]
    Resumed(i64),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("launch failed: {0}")]
    Launch(String),
}
