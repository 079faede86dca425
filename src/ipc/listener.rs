//! Exclusive listener on a well-known local endpoint.
//!
//! Unix domain socket on Linux/macOS, named pipe on Windows. Binding fails
//! with [`io::ErrorKind::AddrInUse`] while another process owns the endpoint.

use std::io;

#[cfg(unix)]
pub type ServerStream = tokio::net::UnixStream;
#[cfg(windows)]
pub type ServerStream = tokio::net::windows::named_pipe::NamedPipeServer;

pub struct IpcListener {
  endpoint: String,
  #[cfg(unix)]
  listener: tokio::net::UnixListener,
  #[cfg(windows)]
  next: tokio::net::windows::named_pipe::NamedPipeServer,
}

#[cfg(unix)]
impl IpcListener {
  /// Bind `endpoint`, replacing a stale socket file nobody is listening on.
  pub fn bind(endpoint: &str) -> io::Result<Self> {
    use tokio::net::UnixListener;

    let listener = match UnixListener::bind(endpoint) {
      Ok(listener) => listener,
      Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
        if std::os::unix::net::UnixStream::connect(endpoint).is_ok() {
          return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is owned by a running process", endpoint),
          ));
        }
        log::warn!("Removing stale socket {}", endpoint);
        remove_socket_if_exists(endpoint)?;
        UnixListener::bind(endpoint)?
      }
      Err(e) => return Err(e),
    };

    Ok(Self {
      endpoint: endpoint.to_string(),
      listener,
    })
  }

  pub async fn accept(&mut self) -> io::Result<ServerStream> {
    let (stream, _) = self.listener.accept().await?;
    Ok(stream)
  }
}

#[cfg(unix)]
impl Drop for IpcListener {
  fn drop(&mut self) {
    if let Err(e) = remove_socket_if_exists(&self.endpoint) {
      log::warn!("Failed to remove socket {}: {}", self.endpoint, e);
    }
  }
}

#[cfg(unix)]
fn remove_socket_if_exists(endpoint: &str) -> io::Result<()> {
  match std::fs::remove_file(endpoint) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

#[cfg(windows)]
impl IpcListener {
  /// Create the first instance of the pipe; fails if the name already exists.
  pub fn bind(endpoint: &str) -> io::Result<Self> {
    use tokio::net::windows::named_pipe::ServerOptions;

    // Win32 ERROR_ACCESS_DENIED is what a second first_pipe_instance reports.
    const ERROR_ACCESS_DENIED: i32 = 5;

    let next = ServerOptions::new()
      .first_pipe_instance(true)
      .create(endpoint)
      .map_err(|e| {
        if e.raw_os_error() == Some(ERROR_ACCESS_DENIED) {
          io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is owned by a running process", endpoint),
          )
        } else {
          e
        }
      })?;

    Ok(Self {
      endpoint: endpoint.to_string(),
      next,
    })
  }

  pub async fn accept(&mut self) -> io::Result<ServerStream> {
    use tokio::net::windows::named_pipe::ServerOptions;

    self.next.connect().await?;
    let replacement = ServerOptions::new().create(&self.endpoint)?;
    Ok(std::mem::replace(&mut self.next, replacement))
  }
}

impl IpcListener {
  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}
