//! Single-instance coordination.
//!
//! The first process binds a well-known endpoint and becomes the primary.
//! Later launches connect to it, hand over their command-line arguments as a
//! JSON array of strings terminated by a newline, and exit.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::ipc::{self, IpcListener, ServerStream, TransportError, RETRY_INTERVAL};

/// Upper bound on a single forwarded message.
const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum InstanceError {
  #[error("Another instance already owns {0}")]
  AlreadyRunning(String),
  #[error("Failed to bind {endpoint}: {source}")]
  Bind {
    endpoint: String,
    #[source]
    source: io::Error,
  },
  #[error("Failed to accept instance client: {0}")]
  Accept(#[source] io::Error),
  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),
  #[error("Failed to encode arguments: {0}")]
  Encode(#[from] serde_json::Error),
}

/// Hand `args` to the primary instance listening on `endpoint`.
///
/// Returns `Ok(false)` when no instance is listening. A busy endpoint is
/// retried for up to `wait` before giving up.
pub async fn forward_to_running_instance(
  endpoint: &str,
  args: &[String],
  wait: Duration,
) -> Result<bool, InstanceError> {
  let deadline = Instant::now() + wait;

  let conn = loop {
    match ipc::dial(endpoint, Duration::ZERO).await {
      Ok(conn) => break conn,
      Err(e) if e.is_endpoint_absent() => {
        log::debug!("No running instance on {}", endpoint);
        return Ok(false);
      }
      Err(e) if e.is_endpoint_busy() && Instant::now() < deadline => {
        tokio::time::sleep(RETRY_INTERVAL).await;
      }
      Err(e) => return Err(e.into()),
    }
  };

  let mut message = serde_json::to_vec(args)?;
  message.push(b'\n');
  conn.write(message)?;
  conn.shutdown().await?;

  log::info!("Forwarded {} argument(s) to running instance", args.len());
  Ok(true)
}

/// Owner of the instance endpoint.
pub struct InstanceServer {
  listener: IpcListener,
}

impl InstanceServer {
  /// Claim `endpoint`. Fails with [`InstanceError::AlreadyRunning`] if another
  /// process holds it.
  pub fn bind(endpoint: &str) -> Result<Self, InstanceError> {
    let listener = IpcListener::bind(endpoint).map_err(|e| {
      if e.kind() == io::ErrorKind::AddrInUse {
        InstanceError::AlreadyRunning(endpoint.to_string())
      } else {
        InstanceError::Bind {
          endpoint: endpoint.to_string(),
          source: e,
        }
      }
    })?;
    log::info!("Listening for other instances on {}", endpoint);
    Ok(Self { listener })
  }

  pub fn endpoint(&self) -> &str {
    self.listener.endpoint()
  }

  /// Accept clients until the listener fails, calling `on_args` with every
  /// argument list received. Each client is read on its own task.
  pub async fn serve<F>(mut self, on_args: F) -> Result<(), InstanceError>
  where
    F: Fn(Vec<String>) + Send + Sync + 'static,
  {
    let on_args = Arc::new(on_args);

    loop {
      let stream = self.listener.accept().await.map_err(InstanceError::Accept)?;
      let on_args = on_args.clone();
      tokio::spawn(async move {
        match read_args(stream).await {
          Ok(Some(args)) => {
            log::info!("Received arguments from another instance: {:?}", args);
            on_args(args);
          }
          Ok(None) => log::debug!("Instance client sent nothing"),
          Err(e) => log::warn!("Failed to read instance message: {}", e),
        }
      });
    }
  }
}

async fn read_args(stream: ServerStream) -> io::Result<Option<Vec<String>>> {
  let mut reader = BufReader::new(stream.take(MAX_MESSAGE_SIZE));
  let mut line = Vec::new();
  reader.read_until(b'\n', &mut line).await?;

  if line.iter().all(u8::is_ascii_whitespace) {
    return Ok(None);
  }
  let args = serde_json::from_slice(&line)?;
  Ok(Some(args))
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  const WAIT: Duration = Duration::from_millis(50);

  fn endpoint(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
  }

  #[tokio::test]
  async fn test_forward_reaches_primary() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(&dir, "unique.sock");

    let server = InstanceServer::bind(&endpoint).unwrap();
    let (tx, rx) = async_channel::unbounded();
    let serving = tokio::spawn(server.serve(move |args| {
      let _ = tx.try_send(args);
    }));

    let args = vec!["mpvrc".to_string(), "/media/movie.mkv".to_string()];
    assert!(forward_to_running_instance(&endpoint, &args, WAIT).await.unwrap());

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(received, args);

    serving.abort();
  }

  #[tokio::test]
  async fn test_no_instance_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(&dir, "nobody.sock");

    let forwarded = forward_to_running_instance(&endpoint, &["mpvrc".to_string()], WAIT)
      .await
      .unwrap();
    assert!(!forwarded);
  }

  #[tokio::test]
  async fn test_stale_socket_counts_as_no_instance() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(&dir, "stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&endpoint).unwrap());

    let forwarded = forward_to_running_instance(&endpoint, &[], WAIT)
      .await
      .unwrap();
    assert!(!forwarded);

    // The stale file does not stop a new primary either.
    InstanceServer::bind(&endpoint).unwrap();
  }

  #[tokio::test]
  async fn test_second_primary_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(&dir, "owned.sock");

    let _primary = InstanceServer::bind(&endpoint).unwrap();
    match InstanceServer::bind(&endpoint) {
      Err(InstanceError::AlreadyRunning(name)) => assert_eq!(name, endpoint),
      Err(e) => panic!("unexpected error: {}", e),
      Ok(_) => panic!("second bind should fail"),
    }
  }

  #[tokio::test]
  async fn test_malformed_message_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = endpoint(&dir, "garbage.sock");

    let server = InstanceServer::bind(&endpoint).unwrap();
    let (tx, rx) = async_channel::unbounded();
    let serving = tokio::spawn(server.serve(move |args| {
      let _ = tx.try_send(args);
    }));

    let mut raw = tokio::net::UnixStream::connect(&endpoint).await.unwrap();
    raw.write_all(b"not json\n").await.unwrap();
    drop(raw);

    let args = vec!["mpvrc".to_string()];
    assert!(forward_to_running_instance(&endpoint, &args, WAIT).await.unwrap());
    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(received, args);

    serving.abort();
  }
}
