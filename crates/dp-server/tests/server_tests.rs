//! Control protocol integration tests
//!
//! Spins the real server on an ephemeral port, with the engine bound to
//! the simulated DAQ driver, and talks to it over a WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use dp_core::Sample;
use dp_daq::{DaqDriver, DeviceRegistry, Pace, SimDriver};
use dp_playback::{AudioSource, PlaybackResult, Transport};
use dp_server::ControlServer;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

struct ToneSource {
    sample_rate_hz: u32,
    total: u64,
    pos: u64,
}

impl AudioSource for ToneSource {
    fn read_into(&mut self, dest: &mut [Sample], max_frames: usize) -> PlaybackResult<usize> {
        let frames = max_frames.min((self.total - self.pos) as usize);
        for (i, sample) in dest[..frames * 2].iter_mut().enumerate() {
            *sample = if i % 2 == 0 { 0.25 } else { -0.25 };
        }
        self.pos += frames as u64;
        Ok(frames)
    }

    fn seek_to_sample(&mut self, sample: u64) -> PlaybackResult<()> {
        self.pos = sample.min(self.total);
        Ok(())
    }

    fn total_samples(&self) -> u64 {
        self.total
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn channel_count(&self) -> usize {
        2
    }

    fn bit_depth(&self) -> u32 {
        16
    }
}

/// Server over a turbo-paced simulated device and a synthetic stereo
/// source (`total` frames at 48 kHz).
async fn start_server(total: u64) -> SocketAddr {
    let driver = Arc::new(SimDriver::new().with_pace(Pace::Turbo));
    let registry = DeviceRegistry::new(driver as Arc<dyn DaqDriver>);
    let transport = Transport::with_source_factory(
        Arc::new(registry),
        Box::new(move |_| {
            Ok(Box::new(ToneSource {
                sample_rate_hz: 48_000,
                total,
                pos: 0,
            }) as Box<dyn AudioSource>)
        }),
    );

    let server = ControlServer::bind(Arc::new(transport), 0)
        .await
        .expect("bind on an ephemeral port");
    let addr = server.local_addr();
    tokio::spawn(server.run());
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .expect("client connects");
    client
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("server sends valid JSON")
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended unexpectedly: {:?}", other),
        }
    }
}

async fn rpc(client: &mut Client, id: &str, task: &str, data: Value) -> Value {
    let request = json!({ "id": id, "task": task, "data": data });
    client
        .send(Message::Text(request.to_string()))
        .await
        .expect("send succeeds");
    recv_json(client).await
}

fn load_data() -> Value {
    json!({
        "file_path": "/assets/session.flac",
        "device_name": "SimDev1",
        "ao_channels": ["ao0", "ao1"],
        "volume": 100,
        "samples_per_frame": 2048,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASICS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_healthcheck_and_pid() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "1", "healthcheck", Value::Null).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["lastmsg"], "1");
    assert_eq!(reply["data"]["ok"], true);
    assert!(reply["data"]["pid"].as_u64().unwrap() > 0);

    let reply = rpc(&mut client, "2", "pid", Value::Null).await;
    assert_eq!(
        reply["data"]["pid"].as_u64().unwrap(),
        u64::from(std::process::id())
    );
}

#[tokio::test]
async fn test_unknown_task_has_machine_readable_reason() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "1", "warp_speed", Value::Null).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["data"]["reason"], "unknown_task");
}

#[tokio::test]
async fn test_malformed_json_closes_the_connection() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();

    // The server must close; the next frames can only be Close or an error.
    loop {
        match client.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(_)) => break,
            Some(Ok(Message::Text(text))) => panic!("unexpected reply: {}", text),
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_devices_lists_the_sim_device() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "1", "devices", json!({ "refresh": true })).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["data"]["devices"][0]["name"], "SimDev1");
    assert!(reply["data"]["driver"].as_str().unwrap().contains("DAQmx"));
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLAYBACK SESSION
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_load_play_progress_and_completion() {
    let total = 96_000u64; // 2 s of source audio
    let addr = start_server(total).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "load-1", "load_audio", load_data()).await;
    assert_eq!(reply["status"], "success", "load reply: {}", reply);
    let info = &reply["data"]["player_info"];
    assert_eq!(info["state"], "loaded");
    assert_eq!(info["total_samples"], json!(total));
    assert_eq!(info["sample_rate_hz"], 48_000);

    // play answers with completed=false, then streams messages under the
    // same id until playback_completed.
    let opening = rpc(&mut client, "play-1", "play", Value::Null).await;
    assert_eq!(opening["status"], "success");
    assert_eq!(opening["completed"], false);
    assert_eq!(opening["id"], "play-1");

    let mut last_percent = -1.0f64;
    let final_status = loop {
        let message = recv_json(&mut client).await;
        assert_eq!(message["id"], "play-1", "stream keeps the play id");
        match message["task"].as_str() {
            Some("progress_update") => {
                let percent = message["data"]["progress_percent"].as_f64().unwrap();
                assert!(
                    percent >= last_percent,
                    "progress must be non-decreasing: {} < {}",
                    percent,
                    last_percent
                );
                last_percent = percent;
                assert_eq!(message["completed"], false);
            }
            Some("playback_completed") => {
                assert_eq!(message["completed"], true);
                break message["data"]["final_status"].clone();
            }
            other => panic!("unexpected stream message {:?}", other),
        }
    };

    assert_eq!(final_status["audio_completed"], true);
    assert_eq!(final_status["position_samples"], json!(total));

    let reply = rpc(&mut client, "status-1", "status", Value::Null).await;
    assert_eq!(reply["data"]["status"]["state"], "completed");
}

#[tokio::test]
async fn test_pause_seek_resume_round_trip() {
    // Long asset so turbo pacing cannot outrun the control calls.
    let total = 48_000u64 * 600;
    let addr = start_server(total).await;
    let mut client = connect(addr).await;

    rpc(&mut client, "1", "load_audio", load_data()).await;
    let opening = rpc(&mut client, "2", "play", Value::Null).await;
    assert_eq!(opening["completed"], false);

    // Pause from a second control connection, as the GUI does.
    let mut control = connect(addr).await;
    let reply = rpc(&mut control, "3", "pause", Value::Null).await;
    assert_eq!(reply["status"], "success", "pause reply: {}", reply);
    assert_eq!(reply["data"]["status"]["state"], "paused");

    let reply = rpc(&mut control, "4", "seek", json!({ "time": 45.5 })).await;
    assert_eq!(reply["status"], "success");
    let position = reply["data"]["new_position"].as_f64().unwrap();
    assert!((position - 45.5).abs() < 0.2, "position after seek: {}", position);

    let reply = rpc(&mut control, "5", "get_position", Value::Null).await;
    assert!((reply["data"]["position_s"].as_f64().unwrap() - 45.5).abs() < 0.2);
    assert!((reply["data"]["duration_s"].as_f64().unwrap() - 600.0).abs() < 0.01);

    let reply = rpc(&mut control, "6", "resume", Value::Null).await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["data"]["status"]["state"], "playing");

    let reply = rpc(&mut control, "7", "volume", json!({ "volume": 35 })).await;
    assert_eq!(reply["data"]["volume_percent"], 35);

    let reply = rpc(&mut control, "8", "volume", json!({ "volume": 250 })).await;
    assert_eq!(reply["status"], "error");

    let reply = rpc(&mut control, "9", "flip_lr_stereo", json!({ "flip_lr_stereo": true })).await;
    assert_eq!(reply["data"]["flip_lr_stereo"], true);
}

#[tokio::test]
async fn test_play_without_load_is_an_error() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "1", "play", Value::Null).await;
    assert_eq!(reply["status"], "error");
    assert!(reply["data"]["error"]
        .as_str()
        .unwrap()
        .contains("Load audio first"));
}

#[tokio::test]
async fn test_terminate_shuts_the_server_down() {
    let addr = start_server(48_000).await;
    let mut client = connect(addr).await;

    let reply = rpc(&mut client, "1", "terminate", Value::Null).await;
    assert_eq!(reply["status"], "success");

    // After the shutdown window, new connections must be refused.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert!(
        tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .is_err(),
        "server should no longer accept connections"
    );
}
