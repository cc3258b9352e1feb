//! Line-delimited JSON-RPC client over a child process's stdio.
//!
//! One JSON document per line in each direction. Requests carry increasing
//! integer ids; a reader task parses every stdout line and hands the payload
//! to whichever caller is parked on that id, so concurrent calls to the same
//! child pipeline cleanly over the single channel. A JSON-RPC error response
//! resolves the caller's future to `Err`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::jsonrpc::{Request, Response, RpcError};

/// How long a child gets to wind down after its stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<std::result::Result<Value, RpcError>>>>>;

pub struct StdioRpcClient {
    name: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicI64,
}

impl StdioRpcClient {
    /// Spawn the child and wire up its pipes.
    ///
    /// The child gets a minimal environment (PATH and friends) with the
    /// configured variables layered on top. stderr is discarded unless
    /// `forward_stderr`, in which case each line is logged with an
    /// `[mcp:<name>]` prefix, redacted when `redact` is set.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        forward_stderr: bool,
        redact: bool,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .env_clear()
            .envs(minimal_env())
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if forward_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{command}'"))?;

        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        // Reader: one JSON document per stdout line.
        {
            let pending = Arc::clone(&pending);
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            dispatch_line(&name, &line, &pending);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(server = %name, error = %e, "stdout read failed");
                            break;
                        }
                    }
                }
                // Transport gone: fail every caller still waiting.
                let mut map = pending.lock();
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(RpcError {
                        code: crate::jsonrpc::INTERNAL_ERROR,
                        message: "server closed its stdio transport".to_string(),
                        data: None,
                    }));
                }
                debug!(server = %name, "stdout closed");
            });
        }

        if forward_stderr {
            if let Some(stderr) = child.stderr.take() {
                let name = name.to_string();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let line = if redact {
                            mcpbox_core::redact::redact_str(&line)
                        } else {
                            line
                        };
                        debug!("[mcp:{name}] {line}");
                    }
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            pending,
            next_id: AtomicI64::new(1),
        })
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = Request::new(id, method, params);
        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().remove(&id);
            return Err(RpcError {
                code: crate::jsonrpc::INTERNAL_ERROR,
                message: e.to_string(),
                data: None,
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError {
                code: crate::jsonrpc::INTERNAL_ERROR,
                message: "server closed its stdio transport".to_string(),
                data: None,
            }),
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.write_line(&Request::notification(method, params)).await
    }

    async fn write_line(&self, message: &Request) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .with_context(|| format!("stdin to '{}' already closed", self.name))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin and wait for the child to exit, killing it after a grace
    /// period.
    pub async fn shutdown(&self) -> Result<()> {
        // Dropping stdin sends EOF, the conventional stop signal for stdio
        // MCP servers.
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.name, %status, "child exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("waiting for child"),
            Err(_) => {
                warn!(server = %self.name, "child did not exit in time, killing");
                child.kill().await.context("killing child")?;
                Ok(())
            }
        }
    }
}

/// Route one stdout line to the caller waiting on its id.
fn dispatch_line(name: &str, line: &str, pending: &PendingMap) {
    // Responses have an id and a result or error. Anything with a `method`
    // is a server-initiated request or notification; this transport does not
    // serve those, so they are logged and dropped.
    match serde_json::from_str::<Response>(line) {
        Ok(response) if response.result.is_some() || response.error.is_some() => {
            let Some(id) = response.id.as_i64() else {
                debug!(server = %name, "response with non-integer id ignored");
                return;
            };
            let Some(tx) = pending.lock().remove(&id) else {
                debug!(server = %name, id, "response for unknown request id");
                return;
            };
            let outcome = match response.error {
                Some(error) => Err(error),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        _ => match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                debug!(server = %name, method = %request.method, "ignoring server-initiated message");
            }
            Err(e) => {
                warn!(server = %name, error = %e, "unparseable line from server");
            }
        },
    }
}

/// The handful of variables a child can reasonably expect, inherited from
/// the gateway's own environment when present.
fn minimal_env() -> HashMap<String, String> {
    ["PATH", "HOME", "USER", "LANG", "TMPDIR", "TZ"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_env_contains_path() {
        // PATH exists in any sane test environment and must pass through.
        assert!(minimal_env().contains_key("PATH"));
    }

    #[tokio::test]
    async fn test_request_against_cat_echo() {
        // `cat` echoes our request line back; the reader should treat the
        // echoed *request* (it has a method) as a server-initiated message,
        // not a response, so the pending call fails when stdin closes.
        let client = StdioRpcClient::spawn(
            "cat",
            "cat",
            &[],
            &HashMap::new(),
            false,
            true,
        )
        .unwrap();

        let pending = client.request("ping", None);
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.shutdown().await
        };
        let (result, _) = tokio::join!(pending, shutdown);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let result = StdioRpcClient::spawn(
            "ghost",
            "definitely-not-a-real-binary-mcpbox",
            &[],
            &HashMap::new(),
            false,
            true,
        );
        assert!(result.is_err());
    }
}
