use crate::config::SandboxConfig;
use crate::error::TransportError;
use bytes::BytesMut;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read buffer size; longer lines are assembled from successive chunks.
pub const BUFFER_LIMIT: usize = 1 << 20;

/// Async handler invoked for every line received on a serving connection.
/// A returned string is written back on the same connection.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct LocalSocket {
    path: PathBuf,
    retries: u32,
    backoff: Duration,
    open_lock: Mutex<()>,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    server_writer: Mutex<Option<SharedWriter>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl LocalSocket {
    pub fn new(path: impl Into<PathBuf>, retries: u32, backoff: Duration) -> Self {
        Self {
            path: path.into(),
            retries,
            backoff,
            open_lock: Mutex::new(()),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            server_writer: Mutex::new(None),
            server_task: Mutex::new(None),
            active: AtomicBool::new(true),
        }
    }

    /// Socket with a fresh address under the configured socket directory.
    pub fn for_plugin(config: &SandboxConfig) -> Self {
        let path = config
            .socket_dir
            .join(format!("plugin_socket_{}", uuid::Uuid::new_v4().simple()));
        Self::new(path, config.connect_retries, config.connect_backoff())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Lazily opens the client connection, retrying with a fixed backoff.
    ///
    /// Returns `false` once the retry budget is spent or the socket was closed.
    pub async fn connect(&self) -> bool {
        let _guard = self.open_lock.lock().await;

        if self.writer.lock().await.is_some() {
            return true;
        }

        for attempt in 1..=self.retries {
            if !self.is_active() {
                return false;
            }

            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    let (read, write) = stream.into_split();
                    *self.reader.lock().await = Some(BufReader::with_capacity(BUFFER_LIMIT, read));
                    *self.writer.lock().await = Some(write);
                    debug!(path = %self.path.display(), attempt, "Connected to plugin socket");
                    return true;
                }
                Err(e) => {
                    debug!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "Plugin socket not ready"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }

        false
    }

    /// Reads one frame from the client connection.
    ///
    /// `Ok(None)` means the peer closed the stream without sending anything;
    /// the cached connection is dropped so the next call reconnects.
    pub async fn read_line(&self) -> Result<Option<String>, TransportError> {
        if !self.connect().await {
            return Err(TransportError::NotConnected(self.path.display().to_string()));
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        let line = read_frame(reader).await;

        if !matches!(line, Ok(Some(_))) {
            guard.take();
            drop(guard);
            self.writer.lock().await.take();
        }

        line
    }

    pub async fn write_line(&self, message: &str) -> Result<(), TransportError> {
        if !self.connect().await {
            return Err(TransportError::NotConnected(self.path.display().to_string()));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        write_frame(writer, message).await
    }

    /// Binds the socket path and answers every accepted connection with `handler`.
    pub async fn serve(self: &Arc<Self>, handler: MessageHandler) -> Result<(), TransportError> {
        // A stale socket file from a crashed run would make bind fail
        let _ = tokio::fs::remove_file(&self.path).await;

        let listener = UnixListener::bind(&self.path).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to bind {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), "Serving plugin socket");

        let socket = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let socket = socket.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            socket.listen_for_method_calls(stream, handler).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Plugin socket accept failed");
                        break;
                    }
                }
            }
        });

        *self.server_task.lock().await = Some(task);
        Ok(())
    }

    /// Pushes an unsolicited frame to the most recently accepted client.
    pub async fn write_line_server(&self, message: &str) -> Result<(), TransportError> {
        let writer = self.server_writer.lock().await.clone();
        let writer =
            writer.ok_or_else(|| TransportError::NotConnected(self.path.display().to_string()))?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, message).await
    }

    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // The listener task may still own the reader; it is released when that task ends
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        self.server_writer.lock().await.take();
        if let Some(task) = self.server_task.lock().await.take() {
            task.abort();
            let _ = tokio::fs::remove_file(&self.path).await;
        }
    }

    async fn listen_for_method_calls(self: Arc<Self>, stream: UnixStream, handler: MessageHandler) {
        let (read, write) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(write));
        *self.server_writer.lock().await = Some(writer.clone());

        let mut reader = BufReader::with_capacity(BUFFER_LIMIT, read);
        while self.is_active() {
            match read_frame(&mut reader).await {
                Ok(Some(line)) => {
                    let handler = handler.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        if let Some(response) = handler(line).await {
                            let mut writer = writer.lock().await;
                            if let Err(e) = write_frame(&mut *writer, &response).await {
                                debug!(error = %e, "Failed to write response frame");
                            }
                        }
                    });
                }
                Ok(None) => {
                    debug!("Plugin socket client disconnected");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Plugin socket read failed");
                    break;
                }
            }
        }
    }
}

/// Reads up to and including the next `\n`.
///
/// Lines longer than the reader's buffer are collected chunk by chunk. Data
/// cut short by end of stream is still returned.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = BytesMut::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

        if available.is_empty() {
            break;
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            return Ok(Some(decode_line(&line)));
        }

        let n = available.len();
        line.extend_from_slice(available);
        reader.consume(n);
    }

    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(decode_line(&line)))
    }
}

pub async fn write_frame<W>(writer: &mut W, message: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(message.len() + 1);
    frame.extend_from_slice(message.as_bytes());
    if !message.ends_with('\n') {
        frame.extend_from_slice(b"\n");
    }

    writer
        .write_all(&frame)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tempfile::TempDir;

    fn socket_in(dir: &TempDir, retries: u32) -> LocalSocket {
        LocalSocket::new(dir.path().join("plugin.sock"), retries, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_read_frame_splits_lines() {
        let data: &[u8] = b"first\nsecond\r\n";
        let mut reader = BufReader::new(data);

        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("second"));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_assembles_oversized_line() {
        let mut data = vec![b'x'; 100];
        data.push(b'\n');
        data.extend_from_slice(b"tail");
        // Buffer far smaller than the line forces chunked reads
        let mut reader = BufReader::with_capacity(8, data.as_slice());

        let line = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(line.len(), 100);
        assert!(line.chars().all(|c| c == 'x'));

        // Truncated trailing data is still decoded
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("tail"));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let dir = TempDir::new().unwrap();
        let socket = socket_in(&dir, 3);

        assert!(!socket.connect().await);
        assert!(matches!(
            socket.write_line("{}").await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_echoes_handler_response() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugin.sock");

        let server = Arc::new(LocalSocket::new(&path, 1, Duration::from_millis(20)));
        let handler: MessageHandler = Arc::new(|line: String| {
            async move {
                if line == "silent" {
                    None
                } else {
                    Some(format!("echo:{line}"))
                }
            }
            .boxed()
        });
        server.serve(handler).await.unwrap();

        let client = LocalSocket::new(&path, 5, Duration::from_millis(20));
        client.write_line("silent").await.unwrap();
        client.write_line("hello").await.unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("echo:hello"));

        server.write_line_server("pushed").await.unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("pushed"));

        client.close().await;
        server.close().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_client_waits_for_late_server() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugin.sock");

        let client = LocalSocket::new(&path, 50, Duration::from_millis(20));
        let server_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let server = Arc::new(LocalSocket::new(server_path, 1, Duration::from_millis(20)));
            let handler: MessageHandler =
                Arc::new(|line: String| async move { Some(line) }.boxed());
            server.serve(handler).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        assert!(client.connect().await);
        client.write_line("ping").await.unwrap();
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("ping"));
    }
}
