//! Duplex byte-stream connection to a local IPC endpoint.
//!
//! A [`Connection`] owns two pumps: the read pump pushes raw chunks onto the
//! inbound queue, the write pump drains the outbound queue one write at a
//! time. Both watch a single [`CancellationToken`]; whichever pump fails first
//! cancels it and the other one stops.

use std::io;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay between connection attempts while the endpoint is absent or busy.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Win32 `ERROR_PIPE_BUSY`: every instance of the pipe is in use.
const ERROR_PIPE_BUSY: i32 = 231;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("Timed out after {timeout:?} waiting for {endpoint}: {source}")]
  Timeout {
    endpoint: String,
    timeout: Duration,
    #[source]
    source: io::Error,
  },
  #[error("Failed to connect to {endpoint}: {source}")]
  Connect {
    endpoint: String,
    #[source]
    source: io::Error,
  },
  #[error("Connection is closed")]
  Closed,
  #[error("Connection already closed")]
  AlreadyClosed,
}

impl TransportError {
  /// The dial failed only because nothing is listening on the endpoint.
  pub fn is_endpoint_absent(&self) -> bool {
    self.dial_source().is_some_and(is_absent)
  }

  /// The dial failed because the endpoint exists but cannot take a client yet.
  pub fn is_endpoint_busy(&self) -> bool {
    self.dial_source().is_some_and(is_busy)
  }

  fn dial_source(&self) -> Option<&io::Error> {
    match self {
      Self::Timeout { source, .. } | Self::Connect { source, .. } => Some(source),
      Self::Closed | Self::AlreadyClosed => None,
    }
  }
}

fn is_absent(err: &io::Error) -> bool {
  matches!(
    err.kind(),
    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
  )
}

fn is_busy(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
    || (cfg!(windows) && err.raw_os_error() == Some(ERROR_PIPE_BUSY))
}

#[cfg(unix)]
async fn connect_stream(endpoint: &str) -> io::Result<tokio::net::UnixStream> {
  tokio::net::UnixStream::connect(endpoint).await
}

#[cfg(windows)]
async fn connect_stream(
  endpoint: &str,
) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
  tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)
}

/// Connect to `endpoint`, retrying every [`RETRY_INTERVAL`] while it is absent
/// or busy. A zero `timeout` makes exactly one attempt.
pub async fn dial(endpoint: &str, timeout: Duration) -> Result<Connection, TransportError> {
  let deadline = Instant::now() + timeout;

  loop {
    match connect_stream(endpoint).await {
      Ok(stream) => {
        log::debug!("Connected to IPC endpoint {}", endpoint);
        return Ok(Connection::from_stream(stream));
      }
      Err(e) if is_absent(&e) || is_busy(&e) => {
        let now = Instant::now();
        if now >= deadline {
          return Err(TransportError::Timeout {
            endpoint: endpoint.to_string(),
            timeout,
            source: e,
          });
        }
        tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
      }
      Err(e) => {
        return Err(TransportError::Connect {
          endpoint: endpoint.to_string(),
          source: e,
        });
      }
    }
  }
}

struct Pumps {
  reader: JoinHandle<()>,
  writer: JoinHandle<()>,
}

/// An open duplex stream with its read and write pumps.
pub struct Connection {
  cancel: CancellationToken,
  write_tx: Sender<Vec<u8>>,
  inbound_rx: Receiver<Vec<u8>>,
  pumps: Mutex<Option<Pumps>>,
}

impl Connection {
  /// Start the pumps over an already connected stream.
  pub fn from_stream<S>(stream: S) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let (reader, writer) = tokio::io::split(stream);
    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded();

    let reader = tokio::spawn(read_pump(reader, inbound_tx, cancel.clone()));
    let writer = tokio::spawn(write_pump(writer, write_rx, cancel.clone()));

    Self {
      cancel,
      write_tx,
      inbound_rx,
      pumps: Mutex::new(Some(Pumps { reader, writer })),
    }
  }

  /// Queue bytes for the write pump. Fails once the connection is cancelled.
  pub fn write(&self, data: Vec<u8>) -> Result<(), TransportError> {
    if self.cancel.is_cancelled() {
      return Err(TransportError::Closed);
    }
    self
      .write_tx
      .try_send(data)
      .map_err(|_| TransportError::Closed)
  }

  /// Inbound byte chunks, in arrival order. The queue ends when the read pump stops.
  pub fn inbound(&self) -> Receiver<Vec<u8>> {
    self.inbound_rx.clone()
  }

  pub fn is_closed(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves once either pump has failed or the connection was closed.
  pub async fn closed(&self) {
    self.cancel.cancelled().await;
  }

  /// Cancel both pumps and wait for them to stop, releasing the stream.
  pub async fn close(&self) -> Result<(), TransportError> {
    let pumps = self.pumps.lock().take().ok_or(TransportError::AlreadyClosed)?;
    self.cancel.cancel();
    self.write_tx.close();
    join_pump("reader", pumps.reader).await;
    join_pump("writer", pumps.writer).await;
    log::debug!("IPC connection closed");
    Ok(())
  }

  /// Like [`close`](Self::close), but lets the write pump finish every queued
  /// write before the pumps are cancelled.
  pub async fn shutdown(&self) -> Result<(), TransportError> {
    let pumps = self.pumps.lock().take().ok_or(TransportError::AlreadyClosed)?;
    self.write_tx.close();
    join_pump("writer", pumps.writer).await;
    self.cancel.cancel();
    join_pump("reader", pumps.reader).await;
    log::debug!("IPC connection shut down");
    Ok(())
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

async fn join_pump(name: &str, handle: JoinHandle<()>) {
  if let Err(e) = handle.await {
    log::error!("IPC {} pump panicked: {}", name, e);
  }
}

async fn read_pump<R: AsyncRead + Unpin>(
  mut reader: R,
  inbound_tx: Sender<Vec<u8>>,
  cancel: CancellationToken,
) {
  log::debug!("IPC read pump started");
  let mut buffer = vec![0u8; READ_BUFFER_SIZE];

  loop {
    let read = tokio::select! {
      _ = cancel.cancelled() => break,
      read = reader.read(&mut buffer) => read,
    };

    match read {
      Ok(0) => {
        log::info!("IPC peer closed the connection");
        cancel.cancel();
        break;
      }
      Ok(n) => {
        if inbound_tx.send(buffer[..n].to_vec()).await.is_err() {
          log::warn!("IPC inbound queue closed, dropping {} bytes", n);
          cancel.cancel();
          break;
        }
      }
      Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
      Err(e) => {
        log::error!("IPC read error: {}", e);
        cancel.cancel();
        break;
      }
    }
  }

  log::debug!("IPC read pump stopped");
}

async fn write_pump<W: AsyncWrite + Unpin>(
  mut writer: W,
  write_rx: Receiver<Vec<u8>>,
  cancel: CancellationToken,
) {
  log::debug!("IPC write pump started");

  loop {
    let data = tokio::select! {
      _ = cancel.cancelled() => break,
      msg = write_rx.recv() => match msg {
        Ok(data) => data,
        // Queue closed and drained: graceful shutdown.
        Err(_) => {
          if let Err(e) = writer.shutdown().await {
            log::debug!("IPC write shutdown failed: {}", e);
          }
          break;
        }
      },
    };

    let written = tokio::select! {
      _ = cancel.cancelled() => break,
      written = write_and_flush(&mut writer, &data) => written,
    };

    if let Err(e) = written {
      log::error!("IPC write error: {}", e);
      cancel.cancel();
      break;
    }
  }

  log::debug!("IPC write pump stopped");
}

async fn write_and_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
  writer.write_all(data).await?;
  writer.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::duplex;

  async fn recv_exact(conn: &Connection, len: usize) -> Vec<u8> {
    let inbound = conn.inbound();
    let mut received = Vec::new();
    while received.len() < len {
      let chunk = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .expect("inbound chunk in time")
        .expect("inbound queue open");
      received.extend_from_slice(&chunk);
    }
    received
  }

  #[tokio::test]
  async fn test_write_reaches_peer() {
    let (local, mut peer) = duplex(1024);
    let conn = Connection::from_stream(local);

    conn.write(b"hello\n".to_vec()).unwrap();

    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(1), peer.read_exact(&mut buf))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(&buf, b"hello\n");
  }

  #[tokio::test]
  async fn test_reads_are_queued_in_order() {
    let (local, mut peer) = duplex(1024);
    let conn = Connection::from_stream(local);

    peer.write_all(b"first\n").await.unwrap();
    peer.write_all(b"second\n").await.unwrap();

    assert_eq!(recv_exact(&conn, 13).await, b"first\nsecond\n");
  }

  #[tokio::test]
  async fn test_peer_hangup_cancels_connection() {
    let (local, peer) = duplex(1024);
    let conn = Connection::from_stream(local);

    drop(peer);

    tokio::time::timeout(Duration::from_secs(1), conn.closed())
      .await
      .expect("connection should observe hangup");
    assert!(conn.is_closed());
    assert!(matches!(conn.write(b"x".to_vec()), Err(TransportError::Closed)));
    // Inbound queue ends once the read pump is gone.
    assert!(conn.inbound().recv().await.is_err());
  }

  #[tokio::test]
  async fn test_close_is_reported_once() {
    let (local, _peer) = duplex(1024);
    let conn = Connection::from_stream(local);

    conn.close().await.unwrap();
    assert!(matches!(conn.close().await, Err(TransportError::AlreadyClosed)));
    assert!(matches!(conn.shutdown().await, Err(TransportError::AlreadyClosed)));
    assert!(matches!(conn.write(b"x".to_vec()), Err(TransportError::Closed)));
  }

  #[tokio::test]
  async fn test_shutdown_flushes_queued_writes() {
    let (local, mut peer) = duplex(1024);
    let conn = Connection::from_stream(local);

    conn.write(b"[\"a\",".to_vec()).unwrap();
    conn.write(b"\"b\"]\n".to_vec()).unwrap();
    conn.shutdown().await.unwrap();

    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"[\"a\",\"b\"]\n");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_dial_times_out_within_one_retry_interval() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("missing.sock");
    let timeout = Duration::from_millis(100);

    let started = std::time::Instant::now();
    let err = match dial(endpoint.to_str().unwrap(), timeout).await {
      Ok(_) => panic!("dial should fail"),
      Err(e) => e,
    };
    let elapsed = started.elapsed();

    assert!(matches!(err, TransportError::Timeout { .. }));
    assert!(err.is_endpoint_absent());
    assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
    // Scheduling slack on top of the single retry interval.
    assert!(
      elapsed < timeout + RETRY_INTERVAL + Duration::from_millis(250),
      "returned late after {:?}",
      elapsed
    );
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_zero_timeout_is_single_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("missing.sock");

    let started = std::time::Instant::now();
    let result = dial(endpoint.to_str().unwrap(), Duration::ZERO).await;

    assert!(result.is_err_and(|e| e.is_endpoint_absent()));
    assert!(started.elapsed() < RETRY_INTERVAL + Duration::from_millis(250));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_dial_waits_for_endpoint_to_appear() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("late.sock");
    let bind_path = endpoint.clone();

    let server = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      let listener = tokio::net::UnixListener::bind(&bind_path).unwrap();
      let (mut stream, _) = listener.accept().await.unwrap();
      stream.write_all(b"ok\n").await.unwrap();
    });

    let conn = dial(endpoint.to_str().unwrap(), Duration::from_secs(2))
      .await
      .expect("dial should succeed once the listener exists");
    assert_eq!(recv_exact(&conn, 3).await, b"ok\n");
    server.await.unwrap();
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_dial_fails_fast_on_invalid_endpoint() {
    let endpoint = format!("/tmp/{}", "x".repeat(200));

    let started = std::time::Instant::now();
    let result = dial(&endpoint, Duration::from_secs(5)).await;

    assert!(matches!(result, Err(TransportError::Connect { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
  }
}
