use std::process::ExitCode;
use std::sync::Arc;

pub mod app;
pub mod config;
pub mod hub;
pub mod instance;
pub mod ipc;
pub mod mpv;
pub mod properties;

pub use app::{App, AppError};
pub use config::AppConfig;
use instance::InstanceServer;
use tracing_subscriber::EnvFilter;

/// Install the log backend. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  if let Err(e) = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init()
  {
    eprintln!("Failed to initialize logging: {}", e);
  }
}

pub fn run() -> ExitCode {
  let config = match AppConfig::load() {
    Ok(config) => config,
    Err(e) => {
      init_logging("info");
      log::error!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  init_logging(&config.log_level);

  let runtime = match tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
  {
    Ok(runtime) => runtime,
    Err(e) => {
      log::error!("Failed to start async runtime: {}", e);
      return ExitCode::FAILURE;
    }
  };

  let args: Vec<String> = std::env::args().collect();
  match runtime.block_on(serve(config, args)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      log::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}

async fn serve(config: AppConfig, args: Vec<String>) -> Result<(), AppError> {
  // A later launch hands its arguments to the primary and exits.
  if instance::forward_to_running_instance(&config.instance_endpoint, &args, config.instance_wait())
    .await?
  {
    return Ok(());
  }
  log::info!("No running instance found, starting");

  let app = Arc::new(App::new(config.mpv_endpoint.clone()));

  let server = InstanceServer::bind(&config.instance_endpoint)?;
  let server_task = tokio::spawn({
    let app = app.clone();
    server.serve(move |args| {
      let app = app.clone();
      tokio::spawn(async move { app.handle_forwarded_args(args).await });
    })
  });

  // Stand-in viewer so notifications show up in the log.
  let viewer = app.hub().subscribe();
  let viewer_task = tokio::spawn(async move {
    while let Some(message) = viewer.recv().await {
      log::debug!("Notification: {}", message);
    }
  });

  let mut child = match mpv::spawn_mpv(
    config.mpv_path().as_deref(),
    &config.mpv_endpoint,
    &config.mpv_args,
    args.get(1).map(String::as_str),
  ) {
    Ok(child) => child,
    Err(e) => {
      server_task.abort();
      app.shutdown().await;
      return Err(e.into());
    }
  };

  if let Err(e) = app.connect_to_mpv(config.connect_timeout()).await {
    log::error!("Failed to connect to MPV after startup: {}", e);
    if let Err(e) = child.kill().await {
      log::error!("Failed to kill MPV: {}", e);
    }
    server_task.abort();
    app.shutdown().await;
    return Err(e);
  }

  log::info!("Waiting for MPV to exit...");
  let interrupted = tokio::select! {
    status = child.wait() => {
      match status {
        Ok(status) => log::info!("MPV exited with {}", status),
        Err(e) => log::error!("Failed to wait for MPV: {}", e),
      }
      false
    }
    signal = tokio::signal::ctrl_c() => {
      if let Err(e) = signal {
        log::error!("Failed to listen for Ctrl+C: {}", e);
      }
      true
    }
  };

  if interrupted {
    log::info!("Interrupted, stopping MPV");
    if let Err(e) = child.kill().await {
      log::error!("Failed to kill MPV: {}", e);
    }
  }

  app.shutdown().await;
  server_task.abort();
  match server_task.await {
    Ok(Err(e)) => log::error!("Instance server stopped: {}", e),
    Ok(Ok(())) => {}
    Err(_) => log::debug!("Instance server stopped"),
  }
  if let Err(e) = viewer_task.await {
    log::error!("Viewer task panicked: {}", e);
  }

  Ok(())
}
