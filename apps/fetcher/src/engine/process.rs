//! Tunnel engine backed by an external tunnel-core process
//!
//! The process is launched with the resolved config written into the data root
//! directory. It reports progress as one JSON notice per line, for example
//! `{"noticeType":"ListeningSocksProxyPort","data":{"port":1080},"timestamp":"..."}`.
//! Both stdout and stderr are scanned for notices. Once both streams close
//! the process is reaped and its exit reported to the delegate.

use super::{EngineCallbacks, TunnelEngine};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunneled_fetch_common::constants::{ENGINE_CONFIG_FILE_NAME, ENGINE_SERVER_LIST_FILE_NAME};

/// A single notice line emitted by the engine process
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notice {
    notice_type: String,

    #[serde(default)]
    data: Value,

    #[serde(default)]
    timestamp: String,
}

/// Runs the tunnel engine as a child process
pub struct ProcessEngine {
    program: PathBuf,
    extra_args: Vec<String>,
    shutdown: Option<CancellationToken>,
    readers: Vec<AbortHandle>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
            shutdown: None,
            readers: Vec::new(),
        }
    }

    fn launch(
        &mut self,
        delegate: &Arc<dyn EngineCallbacks>,
        use_embedded_servers: bool,
    ) -> Result<()> {
        let config = delegate
            .provide_config()
            .ok_or_else(|| anyhow!("delegate provided no tunnel config"))?;

        let root = config.data_root_directory();
        let config_path = root.join(ENGINE_CONFIG_FILE_NAME);
        std::fs::write(&config_path, config.to_json_string()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;

        let mut command = Command::new(&self.program);
        command.arg("-config").arg(&config_path);

        if use_embedded_servers {
            match delegate.provide_embedded_server_list() {
                Some(entries) => {
                    let list_path = root.join(ENGINE_SERVER_LIST_FILE_NAME);
                    std::fs::write(&list_path, entries)
                        .with_context(|| format!("failed to write {}", list_path.display()))?;
                    command.arg("-serverList").arg(&list_path);
                }
                None => warn!("No embedded server entries available"),
            }
        }

        command
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_notices(stdout, Arc::clone(delegate))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_notices(stderr, Arc::clone(delegate))));
        }
        self.readers = readers.iter().map(JoinHandle::abort_handle).collect();

        info!(
            "Tunnel engine process started (pid {})",
            child.id().unwrap_or_default()
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(supervise(
            child,
            readers,
            Arc::clone(delegate),
            shutdown.clone(),
        ));
        self.shutdown = Some(shutdown);
        Ok(())
    }
}

impl TunnelEngine for ProcessEngine {
    fn start(&mut self, delegate: Arc<dyn EngineCallbacks>, use_embedded_servers: bool) -> bool {
        if self.shutdown.is_some() {
            warn!("Tunnel engine is already running");
            return false;
        }

        match self.launch(&delegate, use_embedded_servers) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start tunnel engine: {:#}", e);
                self.stop();
                false
            }
        }
    }

    fn stop(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }

        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Own the child until it exits or the engine is stopped
///
/// An exit that happens before `shutdown` is cancelled is reported through
/// `on_engine_exited`; a stopped engine kills the child instead.
async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    delegate: Arc<dyn EngineCallbacks>,
    shutdown: CancellationToken,
) {
    let exited = tokio::select! {
        _ = shutdown.cancelled() => None,
        status = wait_for_exit(&mut child, readers) => Some(status),
    };

    match exited {
        None => match child.start_kill() {
            Ok(()) => debug!("Tunnel engine process killed"),
            Err(e) => warn!("Failed to kill tunnel engine process: {}", e),
        },
        Some(Ok(status)) => {
            warn!("Tunnel engine process exited: {}", status);
            delegate.on_engine_exited(&status.to_string());
        }
        Some(Err(e)) => {
            error!("Failed to wait for tunnel engine process: {}", e);
            delegate.on_engine_exited(&e.to_string());
        }
    }
}

/// Drain both output readers, then reap the child
async fn wait_for_exit(
    child: &mut Child,
    readers: Vec<JoinHandle<()>>,
) -> std::io::Result<std::process::ExitStatus> {
    for reader in readers {
        if let Err(e) = reader.await {
            debug!("Tunnel engine output reader ended: {}", e);
        }
    }
    child.wait().await
}

/// Forward every line of `stream` to the delegate until the stream closes
async fn read_notices<R>(stream: R, delegate: Arc<dyn EngineCallbacks>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_notice(&line, delegate.as_ref()),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read tunnel engine output: {}", e);
                break;
            }
        }
    }

    debug!("Tunnel engine output closed");
}

/// Map one line of engine output onto the delegate callbacks
pub(crate) fn dispatch_notice(line: &str, delegate: &dyn EngineCallbacks) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let Ok(notice) = serde_json::from_str::<Notice>(line) else {
        delegate.on_diagnostic(line, "");
        return;
    };

    match notice.notice_type.as_str() {
        "ListeningSocksProxyPort" => match port_of(&notice.data) {
            Some(port) => delegate.on_listening_socks_port(port),
            None => delegate.on_diagnostic(line, &notice.timestamp),
        },
        "ListeningHttpProxyPort" => match port_of(&notice.data) {
            Some(port) => delegate.on_listening_http_port(port),
            None => delegate.on_diagnostic(line, &notice.timestamp),
        },
        "Tunnels" if tunnel_count(&notice.data) > 0 => delegate.on_connected(),
        _ => delegate.on_diagnostic(line, &notice.timestamp),
    }
}

fn port_of(data: &Value) -> Option<u16> {
    data.get("port")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port > 0)
}

fn tunnel_count(data: &Value) -> u64 {
    data.get("count").and_then(Value::as_u64).unwrap_or(0)
}
