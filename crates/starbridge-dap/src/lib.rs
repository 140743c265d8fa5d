//! Debug Adapter Protocol bridge for Bazel's Starlark debugger.
//!
//! The adapter speaks DAP to the editor over stdio, launches Bazel with
//! `--experimental_skylark_debug`, and relays requests and events to Bazel's
//! debug server through [`starbridge_wire::DebugConnection`].

pub mod dap_tokio;
pub mod error;
pub mod handles;
pub mod launcher;
pub mod paths;
pub mod server;
pub mod session;

pub use crate::error::{SessionError, SessionResult};
pub use crate::handles::{Handle, HandleError, HandleRegistry, ThreadBound, NO_HANDLE};
pub use crate::launcher::LaunchArguments;
pub use crate::paths::BazelInfo;
pub use crate::session::{DebugSession, Phase};
