//! broker_vault_rpc
//!
//! Unix-socket RPC server and client around `broker_vault::VaultStore`
//! (component B). Only processes with filesystem access to the socket can
//! connect; in-band authentication is intentionally absent — the socket
//! itself is the perimeter. The server serializes access behind a single
//! mutex (writes must be serialized; our store also needs `&mut self` to
//! refresh its cached derived key, so reads share the same short,
//! I/O-free critical section) and bounds every call with a timeout.

pub mod protocol;

use broker_vault::VaultStore;
use protocol::{Request, Response, ResponseOk, MAX_FRAME_BYTES};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("vault error: {0}")]
    Vault(#[from] broker_vault::VaultError),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("call timed out")]
    Timeout,
}

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>, RpcError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Runs the vault RPC server, accepting connections on `socket_path` until
/// the process is killed. Each connection may carry multiple sequential
/// request/response round-trips.
pub async fn serve(socket_path: impl AsRef<Path>, store: VaultStore) -> Result<(), RpcError> {
    let socket_path = socket_path.as_ref();
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    restrict_socket(socket_path)?;

    let store = Arc::new(Mutex::new(store));

    loop {
        let (stream, _addr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, store).await {
                debug!(error = %e, "vault rpc connection ended");
            }
        });
    }
}

#[cfg(unix)]
fn restrict_socket(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
#[cfg(not(unix))]
fn restrict_socket(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, store: Arc<Mutex<VaultStore>>) -> Result<(), RpcError> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(f) => f,
            Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(req) => {
                match tokio::time::timeout(DEFAULT_CALL_TIMEOUT, dispatch(req, &store)).await {
                    Ok(resp) => resp,
                    Err(_) => {
                        warn!("vault rpc call timed out");
                        Response::err("timeout")
                    }
                }
            }
            Err(e) => Response::err(format!("malformed request: {e}")),
        };

        let bytes = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &bytes).await?;
    }
}

async fn dispatch(req: Request, store: &Arc<Mutex<VaultStore>>) -> Response {
    let mut store = store.lock().await;
    match req {
        Request::Ping => Response::ok(ResponseOk::Pong),
        Request::Get { protocol, target } => match store.get(&protocol, &target) {
            Ok(entry) => Response::ok(ResponseOk::Get { entry }),
            Err(e) => {
                error!(error = %e, "vault get failed");
                Response::err("vault unavailable")
            }
        },
        Request::List { protocol } => match store.list(protocol.as_deref()) {
            Ok(entries) => Response::ok(ResponseOk::List { entries }),
            Err(e) => {
                error!(error = %e, "vault list failed");
                Response::err("vault unavailable")
            }
        },
        Request::Store { protocol, target, credential, label, allowed_paths, rate_limit_per_minute, expires_at } => {
            let opts = broker_vault::StoreOpts { label, allowed_paths, rate_limit_per_minute, expires_at };
            match store.store(&protocol, &target, credential, opts) {
                Ok(()) => Response::ok(ResponseOk::Store),
                Err(e) => {
                    error!(error = %e, "vault store failed");
                    Response::err("vault unavailable")
                }
            }
        }
        Request::Delete { protocol, target } => match store.delete(&protocol, &target) {
            Ok(deleted) => Response::ok(ResponseOk::Delete { deleted }),
            Err(e) => {
                error!(error = %e, "vault delete failed");
                Response::err("vault unavailable")
            }
        },
        Request::GetToken { target } => match store.get_oauth_access_token(&target) {
            Ok(token) => Response::ok(ResponseOk::GetToken { token }),
            Err(broker_vault::VaultError::NotFound(_)) => Response::err("not found"),
            Err(e) => {
                error!(error = %e, "vault get-token failed");
                Response::err("vault unavailable")
            }
        },
        Request::GetSecret { name } => match store.get("secret", &name) {
            Ok(Some(entry)) => match entry.credential {
                broker_vault::Credential::Opaque { value } => Response::ok(ResponseOk::GetSecret { value }),
                other => Response::err(format!("{} is not an opaque secret", other.type_name())),
            },
            Ok(None) => Response::err("not found"),
            Err(e) => {
                error!(error = %e, "vault get-secret failed");
                Response::err("vault unavailable")
            }
        },
    }
}

/// Thin client used by the proxies and the operator CLI.
#[derive(Clone)]
pub struct VaultRpcClient {
    socket_path: std::path::PathBuf,
    call_timeout: Duration,
}

impl VaultRpcClient {
    pub fn new(socket_path: impl Into<std::path::PathBuf>) -> Self {
        Self { socket_path: socket_path.into(), call_timeout: DEFAULT_CALL_TIMEOUT }
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.call_timeout = d;
        self
    }

    pub async fn call(&self, req: Request) -> Result<Response, RpcError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let payload = serde_json::to_vec(&req)?;
        tokio::time::timeout(self.call_timeout, async {
            write_frame(&mut stream, &payload).await?;
            let frame = read_frame(&mut stream).await?;
            let resp: Response = serde_json::from_slice(&frame)?;
            Ok::<_, RpcError>(resp)
        })
        .await
        .map_err(|_| RpcError::Timeout)?
    }

    pub async fn ping(&self) -> bool {
        matches!(self.call(Request::Ping).await, Ok(Response::Ok { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_vault::VaultStore;
    use protocol::Request;

    async fn spawn_test_server() -> (std::path::PathBuf, tokio::task::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("vault.sock");
        let vault_path = dir.path().join("vault.json");
        let store = VaultStore::open(&vault_path, "test-pass").unwrap();

        let sp = socket_path.clone();
        let handle = tokio::spawn(async move {
            let _ = serve(sp, store).await;
        });
        // Let the listener bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::mem::forget(dir); // keep tempdir alive for the test's duration
        (socket_path, handle)
    }

    #[tokio::test]
    async fn ping_roundtrips() {
        let (socket_path, handle) = spawn_test_server().await;
        let client = VaultRpcClient::new(socket_path);
        assert!(client.ping().await);
        handle.abort();
    }

    #[tokio::test]
    async fn store_then_get_roundtrips_over_socket() {
        let (socket_path, handle) = spawn_test_server().await;
        let client = VaultRpcClient::new(socket_path);

        let store_req = Request::Store {
            protocol: "http".into(),
            target: "api.example.com".into(),
            credential: broker_vault::Credential::Bearer { token: "tok123".into() },
            label: None,
            allowed_paths: None,
            rate_limit_per_minute: None,
            expires_at: None,
        };
        let resp = client.call(store_req).await.unwrap();
        assert!(matches!(resp, Response::Ok { ok: true, .. }));

        let get_req = Request::Get { protocol: "http".into(), target: "api.example.com".into() };
        let resp = client.call(get_req).await.unwrap();
        match resp {
            Response::Ok { body: ResponseOk::Get { entry: Some(entry) }, .. } => {
                assert_eq!(entry.protocol, "http");
            }
            other => panic!("unexpected response: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn get_missing_entry_returns_none_not_error() {
        let (socket_path, handle) = spawn_test_server().await;
        let client = VaultRpcClient::new(socket_path);
        let resp = client
            .call(Request::Get { protocol: "http".into(), target: "nope.example.com".into() })
            .await
            .unwrap();
        match resp {
            Response::Ok { body: ResponseOk::Get { entry: None }, .. } => {}
            other => panic!("unexpected response: {other:?}"),
        }
        handle.abort();
    }
}
