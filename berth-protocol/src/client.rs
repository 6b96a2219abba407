use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    errors::ClientError,
    protocol::{
        MAX_MESSAGE_SIZE, Request, RequestEnvelope, Response, decode_response, encode_envelope,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Bounded channel capacity for the client writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Async client for the daemon socket.
///
/// Requests are multiplexed: each carries a fresh id and the reader task
/// routes responses back through a pending map, so callers can have several
/// requests in flight on one connection.
pub struct Client {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    _reader_handle: JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
}

impl Client {
    /// Connect to the daemon at the given socket path.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;

        let (read_half, mut write_half) = stream.into_split();

        let pending: Arc<DashMap<u64, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("client writer error: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_pending = pending.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = read_half;

            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = reader.read_exact(&mut len_buf).await {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("daemon disconnected (EOF)");
                    } else {
                        debug!("client reader error: {}", e);
                    }
                    // Drop pending senders so waiters observe Disconnected.
                    reader_pending.clear();
                    return;
                }
                let msg_len = u32::from_be_bytes(len_buf) as usize;

                if msg_len > MAX_MESSAGE_SIZE {
                    debug!("daemon frame exceeds maximum size");
                    reader_pending.clear();
                    return;
                }

                let mut payload = vec![0u8; msg_len];
                if let Err(e) = reader.read_exact(&mut payload).await {
                    debug!("client reader error: {}", e);
                    reader_pending.clear();
                    return;
                }

                match decode_response(&payload) {
                    Ok(envelope) => {
                        if let Some((_, tx)) = reader_pending.remove(&envelope.id) {
                            let _ = tx.send(envelope.response);
                        } else {
                            debug!("response for unknown request id={}", envelope.id);
                        }
                    }
                    Err(e) => {
                        debug!("failed to decode daemon frame: {}", e);
                    }
                }
            }
        });

        Ok(Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        })
    }

    /// Check if the daemon is up by connecting and pinging.
    pub async fn is_daemon_running(socket_path: &Path) -> bool {
        if !socket_path.exists() {
            return false;
        }
        match Self::connect(socket_path).await {
            Ok(client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope { id, request };
        let bytes = encode_envelope(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.writer_tx.send(bytes).await.is_err() {
            self.pending.remove(&id);
            return Err(ClientError::Send(format!(
                "connection closed while sending {}",
                envelope.request.variant_name()
            )));
        }

        rx.await.map_err(|_| ClientError::Disconnected)
    }

    pub async fn start(&self, name: impl Into<String>) -> Result<Response> {
        self.request(Request::Start { name: name.into() }).await
    }

    pub async fn stop(&self, name: impl Into<String>) -> Result<Response> {
        self.request(Request::Stop { name: name.into() }).await
    }

    pub async fn restart(&self, name: impl Into<String>) -> Result<Response> {
        self.request(Request::Restart { name: name.into() }).await
    }

    pub async fn cleanup(&self, name: impl Into<String>) -> Result<Response> {
        self.request(Request::Cleanup { name: name.into() }).await
    }

    pub async fn group_start(&self, group: impl Into<String>) -> Result<Response> {
        self.request(Request::GroupStart {
            group: group.into(),
        })
        .await
    }

    pub async fn group_stop(&self, group: impl Into<String>) -> Result<Response> {
        self.request(Request::GroupStop {
            group: group.into(),
        })
        .await
    }

    pub async fn stop_all(&self) -> Result<Response> {
        self.request(Request::StopAll).await
    }

    pub async fn restart_all(&self) -> Result<Response> {
        self.request(Request::RestartAll).await
    }

    pub async fn cleanup_all(&self) -> Result<Response> {
        self.request(Request::CleanupAll).await
    }

    pub async fn operation_status(&self, id: impl Into<String>) -> Result<Response> {
        self.request(Request::OperationStatus { id: id.into() }).await
    }

    pub async fn cancel_operation(&self, id: impl Into<String>) -> Result<Response> {
        self.request(Request::CancelOperation { id: id.into() }).await
    }

    pub async fn group_status(&self, group: impl Into<String>) -> Result<Response> {
        self.request(Request::GroupStatus {
            group: group.into(),
        })
        .await
    }

    pub async fn list_managed(&self) -> Result<Response> {
        self.request(Request::ListManaged).await
    }

    pub async fn ping(&self) -> Result<Response> {
        self.request(Request::Ping).await
    }

    pub async fn shutdown(&self) -> Result<Response> {
        self.request(Request::Shutdown).await
    }
}
