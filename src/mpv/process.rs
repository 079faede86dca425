//! MPV process detection and spawning.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|path| path.exists())
}

/// Command-line arguments that make MPV serve JSON IPC on `endpoint`.
pub fn mpv_args(endpoint: &str, extra_args: &[String], file: Option<&str>) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", endpoint),
    "--idle".to_string(),
    "--force-window".to_string(),
  ];
  args.extend(extra_args.iter().cloned());
  if let Some(file) = file {
    args.push(file.to_string());
  }
  args
}

/// Spawn MPV with its IPC server on `endpoint`, optionally opening `file`.
///
/// The child is killed if its handle is dropped.
pub fn spawn_mpv(
  mpv_path: Option<&Path>,
  endpoint: &str,
  extra_args: &[String],
  file: Option<&str>,
) -> Result<Child, ProcessError> {
  let mpv_exe = mpv_path
    .map(Path::to_path_buf)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  cleanup_ipc(endpoint);

  let args = mpv_args(endpoint, extra_args, file);
  log::info!("Spawning MPV: {:?} with args: {:?}", mpv_exe, args);

  let child = Command::new(&mpv_exe)
    .args(&args)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()?;

  Ok(child)
}

/// Remove a leftover socket file so the new MPV can bind it.
pub fn cleanup_ipc(endpoint: &str) {
  #[cfg(not(windows))]
  {
    match std::fs::remove_file(endpoint) {
      Ok(()) => log::debug!("Removed leftover socket {}", endpoint),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Failed to remove leftover socket {}: {}", endpoint, e),
    }
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = endpoint;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mpv_args_enable_ipc_and_idle() {
    let args = mpv_args("/tmp/mpvsocket", &[], None);
    assert_eq!(
      args,
      vec!["--input-ipc-server=/tmp/mpvsocket", "--idle", "--force-window"]
    );
  }

  #[test]
  fn test_mpv_args_append_extra_args_then_file() {
    let extra = vec!["--volume=50".to_string()];
    let args = mpv_args(r"\\.\pipe\mpvsocket", &extra, Some("movie.mkv"));
    assert_eq!(args[0], r"--input-ipc-server=\\.\pipe\mpvsocket");
    assert_eq!(&args[3..], ["--volume=50", "movie.mkv"]);
  }

  #[test]
  fn test_spawn_with_missing_binary_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-mpv");
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .unwrap();
    let _guard = runtime.enter();

    let result = spawn_mpv(Some(&missing), "/tmp/unused-mpvsocket", &[], None);
    assert!(matches!(result, Err(ProcessError::SpawnFailed(_))));
  }
}
