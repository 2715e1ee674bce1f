//! Glue between async callers and blocking protocol sessions
//!
//! FTP and SFTP clients are synchronous. Their sessions run on the blocking
//! pool and exchange content with the async side through bounded channels,
//! so neither side has to hold a whole object in memory.

use bytes::Bytes;
use std::io::{self, Read};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::{ContentReader, ContentSource};

pub const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Blocking `Read` over chunks produced by an async task.
pub struct ChannelReader {
    receiver: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(receiver: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            receiver,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.receiver.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }

        let len = buf.len().min(self.current.len());
        buf[..len].copy_from_slice(&self.current[..len]);
        let _ = self.current.split_to(len);
        Ok(len)
    }
}

/// Create a channel whose receiving end is a blocking reader.
pub fn upload_channel() -> (mpsc::Sender<io::Result<Bytes>>, ChannelReader) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (tx, ChannelReader::new(rx))
}

/// Feed `content` into `sender` until EOF, cancellation or a closed receiver.
///
/// On cancellation an `Interrupted` error is pushed so the blocking side
/// aborts its transfer and closes its session.
pub async fn pump_content(
    content: &mut dyn ContentSource,
    sender: mpsc::Sender<io::Result<Bytes>>,
    cancel: &CancellationToken,
) -> StorageResult<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sender
                    .send(Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled")))
                    .await;
                return Err(StorageError::Cancelled);
            }
            read = content.read(&mut buffer) => read,
        };

        let read = match read {
            Ok(read) => read,
            Err(e) => {
                let message = e.to_string();
                let _ = sender.send(Err(e)).await;
                return Err(StorageError::Internal(format!("Failed to read upload content: {}", message)));
            }
        };

        if read == 0 {
            return Ok(total);
        }

        total += read as u64;
        if sender.send(Ok(Bytes::copy_from_slice(&buffer[..read]))).await.is_err() {
            // Receiver gone: the session failed and reports its own error.
            return Ok(total);
        }
    }
}

/// Sending half handed to a blocking session that produces download content.
pub struct DownloadSink {
    ready: Option<oneshot::Sender<StorageResult<()>>>,
    chunks: mpsc::Sender<io::Result<Bytes>>,
}

impl DownloadSink {
    /// Report whether the remote object was opened. Must be called once
    /// before any chunk is sent.
    pub fn opened(&mut self, result: StorageResult<()>) -> bool {
        let ok = result.is_ok();
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
        ok
    }

    /// Copy everything from `source` into the channel. Stops early when the
    /// consumer drops the stream or cancels.
    pub fn copy_from<R: Read>(&mut self, source: &mut R, cancel: &CancellationToken) -> io::Result<u64> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
            }

            let read = match source.read(&mut buffer) {
                Ok(read) => read,
                Err(e) => {
                    let _ = self.chunks.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                    return Err(e);
                }
            };
            if read == 0 {
                return Ok(total);
            }

            total += read as u64;
            if self
                .chunks
                .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..read])))
                .is_err()
            {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "download consumer went away"));
            }
        }
    }
}

impl Drop for DownloadSink {
    fn drop(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(StorageError::Internal(
                "Download session ended before opening the object".to_string(),
            )));
        }
    }
}

/// Run `session` on the blocking pool and return a stream of what it
/// writes into the sink, once it has reported the object as opened.
pub async fn spawn_download<F>(cancel: &CancellationToken, session: F) -> StorageResult<ContentReader>
where
    F: FnOnce(DownloadSink) + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(CHANNEL_DEPTH);

    let sink = DownloadSink {
        ready: Some(ready_tx),
        chunks: chunk_tx,
    };
    let handle = tokio::task::spawn_blocking(move || session(sink));

    let mut ready_rx = ready_rx;
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = &mut ready_rx => Some(opened),
    };

    let Some(opened) = opened else {
        // Closing both channels unblocks the session; wait for it to disconnect.
        drop(ready_rx);
        drop(chunk_rx);
        if let Err(e) = handle.await {
            debug!("Download session ended abnormally after cancellation: {}", e);
        }
        return Err(StorageError::Cancelled);
    };
    opened.map_err(|_| StorageError::Internal("Download session vanished".to_string()))??;

    let stream = futures::stream::unfold(chunk_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Ok(Box::pin(StreamReader::new(stream)))
}

/// Run a blocking session to completion.
///
/// The session receives a clone of the token and is expected to check it
/// between protocol steps with [`checkpoint`]. On cancellation the session
/// is still awaited, so its connection is closed before `Cancelled` is
/// reported.
pub async fn run_session<F, T>(cancel: &CancellationToken, session: F) -> StorageResult<T>
where
    F: FnOnce(CancellationToken) -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    let token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || session(token));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        joined = &mut handle => return joined?,
    }

    match handle.await {
        Ok(Ok(_)) => debug!("Session finished its last step after cancellation"),
        Ok(Err(e)) => debug!("Session stopped after cancellation: {}", e),
        Err(e) => debug!("Session ended abnormally after cancellation: {}", e),
    }
    Err(StorageError::Cancelled)
}

/// Fail with `Cancelled` once `token` fires. Sessions call this between
/// protocol steps so no further remote change starts after cancellation.
pub fn checkpoint(token: &CancellationToken) -> StorageResult<()> {
    if token.is_cancelled() {
        Err(StorageError::Cancelled)
    } else {
        Ok(())
    }
}

/// Read a whole stream into memory. Used by tests and small payloads.
pub async fn read_to_vec(mut reader: ContentReader) -> StorageResult<Vec<u8>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}
