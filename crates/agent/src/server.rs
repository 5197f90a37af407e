//! Unix-domain socket request server.
//!
//! One accepted connection, one request: the client writes a raw UTF-8
//! command and half-closes its write side, the server reads until EOF,
//! answers with a single UTF-8 JSON document, and closes. No framing, no
//! keep-alive — this mirrors the original agent's `asyncio.start_unix_server`
//! handler exactly.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::Module;

/// Handed back to the caller so it can ask the accept loop to stop.
pub(crate) struct ServerHandle {
    notify: Arc<Notify>,
}

impl ServerHandle {
    pub(crate) fn shutdown(&self) {
        self.notify.notify_waiters();
    }
}

/// Bind `socket_path` (mode `0o660`) and spawn the accept loop. Each
/// connection is handled on its own task so one slow client can't stall
/// others.
pub(crate) async fn serve(
    socket_path: &Path,
    modules: Arc<Vec<Module>>,
) -> std::io::Result<(ServerHandle, JoinHandle<()>)> {
    remove_socket(socket_path);
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    tracing::debug!(path = %socket_path.display(), "listening");

    let notify = Arc::new(Notify::new());
    let handle = ServerHandle { notify: notify.clone() };

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    tracing::debug!("stopping the server");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let modules = modules.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, &modules).await;
                            });
                        }
                        Err(err) => tracing::error!(error = %err, "failed to accept connection"),
                    }
                }
            }
        }
    });

    Ok((handle, task))
}

pub(crate) fn remove_socket(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

async fn handle_connection(mut stream: UnixStream, modules: &[Module]) {
    let mut data = Vec::new();
    if let Err(err) = stream.read_to_end(&mut data).await {
        tracing::warn!(error = %err, "failed to read request");
        return;
    }

    let Ok(message) = std::str::from_utf8(&data) else {
        tracing::warn!("invalid request: not valid UTF-8");
        return;
    };
    tracing::debug!(request = message, "received");

    let response = match message {
        "epilog" => serde_json::Value::Object(execute_epilog(modules).await),
        "status" => serde_json::Value::Object(execute_status(modules)),
        "version" => serde_json::Value::String(crate::VERSION.to_string()),
        _ => {
            tracing::warn!(request = message, "invalid request received");
            return;
        }
    };

    let Ok(encoded) = serde_json::to_vec(&response) else {
        tracing::error!("failed to encode response");
        return;
    };
    if let Err(err) = stream.write_all(&encoded).await {
        tracing::warn!(error = %err, "failed to write response");
    }
}

fn execute_status(modules: &[Module]) -> serde_json::Map<String, serde_json::Value> {
    modules.iter().map(|m| (m.name().to_string(), serde_json::Value::Object(m.monitor().status()))).collect()
}

async fn execute_epilog(modules: &[Module]) -> serde_json::Map<String, serde_json::Value> {
    let mut response = serde_json::Map::new();
    for module in modules {
        match module.monitor().epilog().await {
            Ok(serde_json::Value::Object(map)) => {
                response.insert(module.name().to_string(), serde_json::Value::Object(map));
            }
            Ok(_) => {
                tracing::warn!(module = module.name(), "epilog handler did not return an object; ignoring");
            }
            Err(err) => {
                tracing::error!(module = module.name(), error = %err, "epilog handler failed");
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    #[tokio::test]
    async fn status_request_aggregates_registered_module_names() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("health.sock");
        let modules: Arc<Vec<Module>> = Arc::new(Vec::new());

        let (handle, task) = serve(&socket_path, modules).await.unwrap();

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"status").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert!(value.is_object());
        assert!(value.as_object().unwrap().is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_request_closes_without_a_response() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("health.sock");
        let modules: Arc<Vec<Module>> = Arc::new(Vec::new());
        let (handle, task) = serve(&socket_path, modules).await.unwrap();

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"not-a-real-command").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn version_request_returns_the_package_version() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("health.sock");
        let modules: Arc<Vec<Module>> = Arc::new(Vec::new());
        let (handle, task) = serve(&socket_path, modules).await.unwrap();

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"version").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value, serde_json::Value::String(crate::VERSION.to_string()));

        handle.shutdown();
        task.await.unwrap();
    }
}
