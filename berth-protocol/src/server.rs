#[cfg(not(unix))]
compile_error!("berth-protocol server requires a unix target (peer credentials, socket permissions)");

use std::{future::Future, path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tracing::{debug, error, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        ErrorKind, MAX_MESSAGE_SIZE, Request, Response, ResponseEnvelope, decode_envelope,
        encode_response,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;
pub type ShutdownTx = mpsc::Sender<()>;

/// Bounded channel capacity for the per-connection writer task.
const WRITER_CHANNEL_CAPACITY: usize = 256;

/// Unix-socket server that dispatches decoded requests to an async handler.
///
/// Each connection gets a dedicated writer task; each request is handled in
/// its own task so a slow operation submission never blocks status polls on
/// the same connection.
pub struct Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    socket_path: PathBuf,
    handler: Arc<F>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    pub fn new(socket_path: PathBuf, handler: F) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            socket_path,
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        // Refuse a symlinked socket path before any filesystem operations.
        if self.socket_path.exists() {
            let meta = std::fs::symlink_metadata(&self.socket_path).map_err(|e| {
                ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                }
            })?;
            if meta.file_type().is_symlink() {
                return Err(ServerError::SocketSymlink {
                    socket_path: self.socket_path.clone(),
                });
            }
        }

        // Remove a stale socket file from a previous run.
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                });
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ServerError::Bind {
            socket_path: self.socket_path.clone(),
            source: e,
        })?;

        // Owner-only access; the peer check below enforces the same policy
        // for processes that raced the chmod.
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ServerError::SocketPermissions {
                    socket_path: self.socket_path.clone(),
                    source: e,
                })?;
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let shutdown_tx = self.shutdown_tx.clone();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(handler, stream, shutdown_tx).await {
                                    debug!("client handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_client<F, Fut>(
    handler: Arc<F>,
    stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    debug!("client connected");

    // Only the daemon's own user (or root) may drive it.
    let cred = stream.peer_cred().map_err(ServerError::PeerCredentials)?;
    // SAFETY: getuid() has no failure modes.
    let daemon_uid = unsafe { libc::getuid() };
    if cred.uid() != 0 && cred.uid() != daemon_uid {
        debug!(
            "unauthorized connection attempt from UID {} (daemon UID {})",
            cred.uid(),
            daemon_uid
        );
        return Err(ServerError::Unauthorized {
            client_uid: cred.uid(),
            daemon_uid,
        });
    }

    let (read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("failed to write to client: {}", e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = read_half;

    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!("client disconnected (EOF)");
                drop(write_tx);
                let _ = writer_task.await;
                return Ok(());
            }
            return Err(ServerError::Receive(e));
        }
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            debug!("request exceeds maximum message size: {} bytes", msg_len);
            let envelope = ResponseEnvelope {
                id: 0,
                response: Response::error(
                    ErrorKind::Validation,
                    format!("request exceeds maximum message size of {} bytes", MAX_MESSAGE_SIZE),
                ),
            };
            if let Ok(bytes) = encode_response(&envelope) {
                let _ = write_tx.send(bytes).await;
            }
            drop(write_tx);
            let _ = writer_task.await;
            return Err(ServerError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(ServerError::Receive)?;

        let envelope = match decode_envelope(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("failed to parse request envelope: {}", e);
                let envelope = ResponseEnvelope {
                    id: 0,
                    response: Response::error(ErrorKind::Validation, "invalid request format"),
                };
                if let Ok(bytes) = encode_response(&envelope) {
                    let _ = write_tx.send(bytes).await;
                }
                continue;
            }
        };

        let request_id = envelope.id;
        debug!(
            "received request id={} {}",
            request_id,
            envelope.request.variant_name()
        );

        let handler = Arc::clone(&handler);
        let shutdown_tx = shutdown_tx.clone();
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let response = handler(envelope.request, shutdown_tx).await;
            let envelope = ResponseEnvelope {
                id: request_id,
                response,
            };
            match encode_response(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = write_tx.send(bytes).await {
                        debug!("failed to send response for request {}: {}", request_id, e);
                    }
                }
                Err(e) => {
                    error!("failed to encode response for request {}: {}", request_id, e);
                }
            }
        });
    }
}
