#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use mpvrc_lib::hub::Subscriber;
use mpvrc_lib::{App, AppError};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::oneshot;

const EVENTS: &[&str] = &[
  r#"{"event":"property-change","id":3,"name":"pause","data":true}"#,
  r#"{"event":"idle"}"#,
  r#"{"event":"property-change","id":3,"name":"pause","data":true}"#,
  r#"{"event":"property-change","id":1,"name":"playback-time","data":12.7}"#,
];

/// One MPV session: answers every command with success, reports commands on
/// `commands`, emits `EVENTS` once all properties are observed and hangs up
/// when `hangup` fires.
async fn fake_mpv(
  listener: Arc<UnixListener>,
  commands: async_channel::Sender<Value>,
  mut hangup: oneshot::Receiver<()>,
) {
  let (stream, _) = listener.accept().await.unwrap();
  let (reader, mut writer) = stream.into_split();
  let mut lines = BufReader::new(reader).lines();
  let mut observed = 0;

  loop {
    tokio::select! {
      _ = &mut hangup => break,
      line = lines.next_line() => {
        let Some(line) = line.unwrap() else { break };
        let command: Value = serde_json::from_str(&line).unwrap();
        let reply = json!({"request_id": command["request_id"], "error": "success", "data": null});
        writer.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();

        if command["command"][0] == "observe_property" {
          observed += 1;
          if observed == 6 {
            for event in EVENTS {
              writer.write_all(format!("{}\n", event).as_bytes()).await.unwrap();
            }
          }
        }
        let _ = commands.send(command).await;
      }
    }
  }
}

async fn next(viewer: &Subscriber) -> Value {
  let message = tokio::time::timeout(Duration::from_secs(2), viewer.recv())
    .await
    .expect("notification in time")
    .expect("viewer still subscribed");
  serde_json::from_str(&message).unwrap()
}

async fn next_command(commands: &async_channel::Receiver<Value>) -> Value {
  tokio::time::timeout(Duration::from_secs(2), commands.recv())
    .await
    .expect("command in time")
    .unwrap()
}

fn global(name: &str, value: Value) -> Value {
  json!({"event": "set-global-property", "propertyName": name, "value": value})
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_against_fake_mpv() {
  let dir = tempfile::tempdir().unwrap();
  let endpoint = dir.path().join("mpvsocket");
  let listener = Arc::new(UnixListener::bind(&endpoint).unwrap());

  let (commands_tx, commands) = async_channel::unbounded();
  let (hangup, hangup_rx) = oneshot::channel();
  let session = tokio::spawn(fake_mpv(listener.clone(), commands_tx.clone(), hangup_rx));

  let app = Arc::new(App::new(endpoint.to_str().unwrap()));
  let viewer = app.hub().subscribe();

  assert!(app.connect_to_mpv(Duration::from_secs(1)).await.unwrap());
  assert!(!app.connect_to_mpv(Duration::from_secs(1)).await.unwrap());
  assert!(app.is_connected());

  for (i, name) in ["playback-time", "duration", "pause", "volume", "path", "speed"]
    .iter()
    .enumerate()
  {
    let command = next_command(&commands).await;
    assert_eq!(
      command["command"],
      json!(["observe_property", i as i64 + 1, name])
    );
  }

  // The repeated pause and the unknown event produce nothing.
  assert_eq!(next(&viewer).await, global("connected", json!(true)));
  assert_eq!(next(&viewer).await, global("pause", json!(true)));
  assert_eq!(next(&viewer).await, global("playbackTime", json!("00:00:12")));

  let startup = app.startup_events();
  assert_eq!(startup.len(), 8);
  assert_eq!(startup[0].value, json!(true));
  assert_eq!(startup[1].value, json!("00:00:12"));
  assert_eq!(startup[3].value, json!(true));
  assert_eq!(startup[7].property_name, "ready");

  let response = app
    .send_command(vec![json!("set_property"), json!("volume"), json!(80)], true)
    .await
    .unwrap();
  assert!(response.is_success());
  let command = next_command(&commands).await;
  assert_eq!(command["command"], json!(["set_property", "volume", 80]));
  assert_eq!(command["async"], json!(true));

  app
    .handle_forwarded_args(vec!["mpvrc".to_string(), "/media/next.mkv".to_string()])
    .await;
  let command = next_command(&commands).await;
  assert_eq!(command["command"], json!(["loadfile", "/media/next.mkv"]));

  hangup.send(()).unwrap();
  session.await.unwrap();

  assert_eq!(next(&viewer).await, global("connected", json!(false)));
  assert!(!app.is_connected());
  assert!(matches!(
    app.send_command(vec![json!("stop")], false).await,
    Err(AppError::NotConnected)
  ));

  // A fresh dial starts a new session with observer ids from 1 again.
  let (_hangup, hangup_rx) = oneshot::channel();
  let session = tokio::spawn(fake_mpv(listener.clone(), commands_tx, hangup_rx));
  assert!(app.connect_to_mpv(Duration::from_secs(1)).await.unwrap());
  assert_eq!(next(&viewer).await, global("connected", json!(true)));
  let command = next_command(&commands).await;
  assert_eq!(command["command"], json!(["observe_property", 1, "playback-time"]));

  app.shutdown().await;
  assert_eq!(next(&viewer).await, global("connected", json!(false)));
  assert_eq!(viewer.recv().await, None);
  session.abort();
}

#[tokio::test]
async fn test_connect_times_out_without_mpv() {
  let dir = tempfile::tempdir().unwrap();
  let endpoint = dir.path().join("mpvsocket");
  let app = Arc::new(App::new(endpoint.to_str().unwrap()));

  let started = std::time::Instant::now();
  assert!(app.connect_to_mpv(Duration::from_millis(50)).await.is_err());
  assert!(started.elapsed() >= Duration::from_millis(50));
  assert!(!app.is_connected());
  assert_eq!(app.startup_events()[0].value, json!(false));
}
