//! Spawning Bazel with the Starlark debugger enabled.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use starbridge_config::DebuggerConfig;

use crate::error::{SessionError, SessionResult};
use crate::paths::BazelInfo;

/// Arguments of the DAP `launch` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    /// Passed after the debug flags, typically target patterns.
    #[serde(default)]
    pub args: Vec<String>,
    /// `build`, `test`, `query`, ...
    pub bazel_command: String,
    #[serde(default)]
    pub bazel_executable_path: Option<String>,
    #[serde(default)]
    pub bazel_startup_options: Option<Vec<String>>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub verbose: Option<bool>,
}

impl LaunchArguments {
    pub fn executable<'a>(&'a self, config: &'a DebuggerConfig) -> &'a str {
        self.bazel_executable_path
            .as_deref()
            .filter(|path| !path.is_empty())
            .unwrap_or(&config.bazel_executable)
    }

    pub fn port(&self, config: &DebuggerConfig) -> u16 {
        self.port.unwrap_or(config.default_port)
    }

    pub fn startup_options(&self) -> &[String] {
        self.bazel_startup_options.as_deref().unwrap_or_default()
    }

    /// Full argument list for the debugged Bazel invocation.
    pub fn bazel_args(&self, port: u16) -> Vec<String> {
        let mut out = self.startup_options().to_vec();
        out.push(self.bazel_command.clone());
        out.push("--color=yes".to_string());
        out.push("--experimental_skylark_debug".to_string());
        out.push(format!("--experimental_skylark_debug_server_port={port}"));
        out.push(format!(
            "--experimental_skylark_debug_verbose_logging={}",
            self.verbose.unwrap_or(false)
        ));
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Run `bazel [startup options] info` in `cwd`.
pub async fn query_info(
    executable: &str,
    startup_options: &[String],
    cwd: &Path,
) -> SessionResult<BazelInfo> {
    let output = Command::new(executable)
        .args(startup_options)
        .arg("info")
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| SessionError::Launch(format!("failed to run {executable} info: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SessionError::Launch(format!(
            "{executable} info exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let info = BazelInfo::parse(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(target: "starbridge.dap", ?info, "bazel info");
    Ok(info)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout or stderr, without the trailing newline.
    Output(String),
    /// The process is gone. `None` when it was killed by a signal.
    Exited(Option<i32>),
}

/// Handle to a spawned Bazel process.
///
/// The child itself is owned by a supervisor task that reports
/// [`ProcessEvent::Exited`] once it has been reaped.
#[derive(Debug)]
pub struct BazelProcess {
    pid: Option<u32>,
    kill: CancellationToken,
}

impl BazelProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

pub fn spawn(
    executable: &str,
    args: &[String],
    cwd: &Path,
) -> SessionResult<(BazelProcess, mpsc::UnboundedReceiver<ProcessEvent>)> {
    let mut cmd = Command::new(executable);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| SessionError::Launch(format!("failed to spawn {executable}: {err}")))?;
    let pid = child.id();
    tracing::info!(target: "starbridge.dap", executable, ?args, ?pid, "spawned bazel");

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(forward_lines(stdout, events_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(forward_lines(stderr, events_tx.clone()));
    }

    let kill = CancellationToken::new();
    tokio::spawn(supervise(child, forwarders, kill.clone(), events_tx));

    Ok((BazelProcess { pid, kill }, events_rx))
}

fn forward_lines<R>(stream: R, events: mpsc::UnboundedSender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if events.send(ProcessEvent::Output(line)).is_err() {
                break;
            }
        }
    })
}

async fn supervise(
    mut child: Child,
    forwarders: Vec<JoinHandle<()>>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            (child.wait().await, true)
        }
    };

    for forwarder in forwarders {
        if killed {
            forwarder.abort();
        } else {
            // Drain whatever the process wrote before exiting.
            let _ = forwarder.await;
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(target: "starbridge.dap", error = %err, "failed to wait for bazel");
            None
        }
    };
    tracing::info!(target: "starbridge.dap", ?code, killed, "bazel exited");
    let _ = events.send(ProcessEvent::Exited(code));
}
