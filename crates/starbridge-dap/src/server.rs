use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use starbridge_config::DebuggerConfig;

use crate::{
    dap_tokio::{DapReader, DapWriter, Event, Outgoing, Request, Response, Result},
    error::SessionResult,
    session::DebugSession,
};

/// The single queue every response and event goes through on its way to the
/// editor. The writer task stamps sequence numbers in queue order.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbound {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_event(&self, event: Event) {
        let _ = self.tx.send(Outgoing::Event(event));
    }

    /// Answer `request` with the handler's outcome; errors become
    /// `success: false` with the error text as the message.
    pub fn respond(&self, request: &Request, result: SessionResult<Option<serde_json::Value>>) {
        let outcome = result.map_err(|err| {
            tracing::debug!(
                target: "starbridge.dap",
                command = %request.command,
                error = %err,
                "request failed"
            );
            err.to_string()
        });
        let _ = self
            .tx
            .send(Outgoing::Response(Response::to(request, outcome)));
    }
}

/// Serve DAP over stdio until the editor disconnects or closes stdin.
pub async fn run_stdio(config: DebuggerConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run_with_config(stdin, stdout, config)
        .await
        .map_err(anyhow::Error::from)
}

pub async fn run<R, W>(reader: R, writer: W) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    run_with_config(reader, writer, DebuggerConfig::default()).await
}

pub async fn run_with_config<R, W>(reader: R, writer: W, config: DebuggerConfig) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (out, mut out_rx) = Outbound::new();
    let writer_shutdown = CancellationToken::new();

    let writer_task = tokio::spawn({
        let shutdown = writer_shutdown.clone();
        async move {
            let mut writer = DapWriter::new(writer);
            loop {
                tokio::select! {
                    biased;
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(err) = writer.send(&msg).await {
                                tracing::warn!(target: "starbridge.dap", error = %err, "failed to write to client");
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = shutdown.cancelled() => {
                        // Background tasks may still hold senders; flush what is
                        // already queued and stop.
                        while let Ok(msg) = out_rx.try_recv() {
                            if writer.send(&msg).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                }
            }
        }
    });

    let session = DebugSession::new(config, out.clone());
    let mut reader = DapReader::new(reader);

    let result = loop {
        let request = match reader.read_request().await {
            Ok(Some(request)) => request,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        if request.command == "disconnect" {
            session.handle(request).await;
            break Ok(());
        }

        let session = session.clone();
        tokio::spawn(async move { session.handle(request).await });
    };

    // The editor is gone or asked to stop; make sure Bazel goes with it.
    if session.disconnect().await {
        tracing::info!(target: "starbridge.dap", "client went away; session torn down");
    }

    drop(session);
    drop(out);
    writer_shutdown.cancel();
    let _ = writer_task.await;
    result
}
