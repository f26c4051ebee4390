//! Task handlers
//!
//! Routes each request to the transport. State-mutating tasks run on the
//! blocking pool (the transport lock is synchronous) under the 5 s device
//! timeout; read-only tasks answer from the transport's snapshot without
//! queueing behind mutations.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use dp_core::LoopMode;
use dp_playback::{LoadRequest, PlaybackResult, PlayerStatus, Transport};

use crate::progress::monitor_playback;
use crate::protocol::{Reply, Request};
use crate::server::{AppState, ControlSession, SharedWriter};

/// Handlers that touch the device give up after this long.
const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns the reply and whether the connection should close afterwards.
pub async fn handle(
    state: &Arc<AppState>,
    session: &ControlSession,
    request: Request,
    writer: &SharedWriter,
) -> (Reply, bool) {
    let lastmsg = session.last_msg_id.clone();
    let data = request.data.clone();

    let reply = match request.task.as_str() {
        "healthcheck" => healthcheck(state, lastmsg),
        "pid" => Reply::success(json!({ "pid": std::process::id() }), lastmsg),
        "status" => status(state, lastmsg),
        "devices" => devices(state, &data, lastmsg).await,
        "get_position" => get_position(state, lastmsg),
        "load_audio" => load_audio(state, &data, lastmsg).await,
        "play" => play(state, &request, writer, lastmsg).await,
        "pause" => pause(state, &data, lastmsg).await,
        "resume" => run_blocking(state, lastmsg, |t| t.resume()).await,
        "volume" => volume(state, &data, lastmsg).await,
        "seek" => seek(state, &data, lastmsg).await,
        "flip_lr_stereo" => flip_lr_stereo(state, &data, lastmsg).await,
        "terminate" => return terminate(state, lastmsg).await,
        unknown => Reply::error_with_reason(
            "unknown_task",
            format!("Unknown task: {}", unknown),
            lastmsg,
        ),
    };
    (reply, false)
}

// ───────────────────────────────────────────────────────────────────────
// Simple reads
// ───────────────────────────────────────────────────────────────────────

fn healthcheck(state: &Arc<AppState>, lastmsg: Option<String>) -> Reply {
    Reply::success(
        json!({
            "ok": true,
            "server": "online",
            "pid": std::process::id(),
            "uptime_s": state.started_at.elapsed().as_secs(),
        }),
        lastmsg,
    )
}

fn status(state: &Arc<AppState>, lastmsg: Option<String>) -> Reply {
    let status = state.transport.status();
    Reply::success(
        json!({
            "message": "Current player status",
            "status": status_json(&status),
        }),
        lastmsg,
    )
}

fn get_position(state: &Arc<AppState>, lastmsg: Option<String>) -> Reply {
    let (position_s, duration_s) = state.transport.position();
    Reply::success(
        json!({ "position_s": position_s, "duration_s": duration_s }),
        lastmsg,
    )
}

async fn devices(state: &Arc<AppState>, data: &Option<Value>, lastmsg: Option<String>) -> Reply {
    let refresh = field_bool(data, "refresh").unwrap_or(false);
    let transport = Arc::clone(&state.transport);

    let enumerated = tokio::time::timeout(
        DEVICE_TIMEOUT,
        tokio::task::spawn_blocking(move || {
            if refresh {
                transport.registry().refresh();
            }
            (
                transport.registry().driver_version(),
                transport.registry().list_devices(),
            )
        }),
    )
    .await;

    match enumerated {
        Ok(Ok((driver, devices))) => Reply::success(
            json!({ "driver": driver, "devices": devices }),
            lastmsg,
        ),
        Ok(Err(e)) => Reply::error(format!("Device enumeration failed: {}", e), lastmsg),
        Err(_) => Reply::error("Device enumeration timed out after 5 s", lastmsg),
    }
}

// ───────────────────────────────────────────────────────────────────────
// Transport mutations
// ───────────────────────────────────────────────────────────────────────

async fn load_audio(state: &Arc<AppState>, data: &Option<Value>, lastmsg: Option<String>) -> Reply {
    let Some(file_path) = field_str(data, "file_path") else {
        return Reply::error("Missing required field: file_path", lastmsg);
    };
    let Some(device_name) = field_str(data, "device_name") else {
        return Reply::error("Missing required field: device_name", lastmsg);
    };
    let Some(ao_channels) = field_str_list(data, "ao_channels") else {
        return Reply::error("Missing required field: ao_channels", lastmsg);
    };

    let request = LoadRequest {
        file_path,
        device_name,
        ao_channels,
        do_channels: field_str_list(data, "do_channels").unwrap_or_default(),
        ai_channels: field_str_list(data, "ai_channels").unwrap_or_default(),
        volume_pct: field_u64(data, "volume").map(|v| v.min(100) as u8),
        samples_per_frame: field_u64(data, "samples_per_frame").map(|v| v as usize),
        flip_lr_stereo: field_bool(data, "flip_lr_stereo"),
    };

    match run_blocking(state, lastmsg.clone(), move |t| t.load(request)).await {
        reply if reply.status == "success" => {
            let status = state.transport.status();
            Reply::success(
                json!({
                    "message": "Audio file loaded successfully",
                    "player_info": status_json(&status),
                }),
                lastmsg,
            )
        }
        error_reply => error_reply,
    }
}

async fn play(
    state: &Arc<AppState>,
    request: &Request,
    writer: &SharedWriter,
    lastmsg: Option<String>,
) -> Reply {
    let data = &request.data;
    let start_position = field_f64(data, "start_position");
    let volume = field_u64(data, "volume").map(|v| v.min(100) as u8);
    let loop_mode = data
        .as_ref()
        .and_then(|d| d.get("loop"))
        .and_then(|v| serde_json::from_value::<LoopMode>(v.clone()).ok());

    let reply = run_blocking(state, lastmsg.clone(), move |t| {
        t.play(start_position, volume, loop_mode)
    })
    .await;
    if reply.status != "success" {
        return reply;
    }

    // The play session stays subscribed to progress until it closes or
    // playback completes.
    let stream_id = request
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tokio::spawn(monitor_playback(
        Arc::clone(state),
        Arc::clone(writer),
        stream_id.clone(),
        lastmsg.clone(),
    ));

    let status = state.transport.status();
    Reply::stream_opening(
        &stream_id,
        json!({
            "message": "Playback started",
            "status": status_json(&status),
        }),
        lastmsg,
    )
}

async fn pause(state: &Arc<AppState>, data: &Option<Value>, lastmsg: Option<String>) -> Reply {
    let stop = field_bool(data, "stop").unwrap_or(false);
    let reply = run_blocking(state, lastmsg.clone(), move |t| {
        let status = t.pause()?;
        if stop {
            // stop = pause and rewind to the beginning
            return t.seek_to_sample(0);
        }
        Ok(status)
    })
    .await;
    if reply.status != "success" {
        return reply;
    }

    let status = state.transport.status();
    let message = if stop { "Playback stopped" } else { "Playback paused" };
    Reply::success(
        json!({
            "message": message,
            "pause_position": status.position_s,
            "status": status_json(&status),
        }),
        lastmsg,
    )
}

async fn volume(state: &Arc<AppState>, data: &Option<Value>, lastmsg: Option<String>) -> Reply {
    let Some(volume) = field_u64(data, "volume") else {
        return Reply::error("Missing required field: volume", lastmsg);
    };
    if volume > 100 {
        return Reply::error("volume must be <= 100", lastmsg);
    }

    let reply = run_blocking(state, lastmsg.clone(), move |t| t.set_volume(volume as u8)).await;
    if reply.status != "success" {
        return reply;
    }
    let status = state.transport.status();
    Reply::success(
        json!({
            "message": format!("Volume set to {}%", volume),
            "volume_percent": volume,
            "status": status_json(&status),
        }),
        lastmsg,
    )
}

async fn seek(state: &Arc<AppState>, data: &Option<Value>, lastmsg: Option<String>) -> Reply {
    let time = field_f64(data, "time");
    let position = field_u64(data, "position");
    if time.is_none() && position.is_none() {
        return Reply::error(
            "Missing required field: 'position' or 'time' (time in seconds)",
            lastmsg,
        );
    }
    if let Some(t) = time {
        if t < 0.0 {
            return Reply::error("time must be >= 0", lastmsg);
        }
        let duration = state.transport.status().duration_s;
        if t > duration {
            return Reply::error(format!("time must be <= {}", duration), lastmsg);
        }
    }

    let reply = run_blocking(state, lastmsg.clone(), move |t| match (time, position) {
        (Some(seconds), _) => t.seek_to_time(seconds),
        (None, Some(sample)) => t.seek_to_sample(sample),
        (None, None) => unreachable!("validated above"),
    })
    .await;
    if reply.status != "success" {
        return reply;
    }

    let status = state.transport.status();
    Reply::success(
        json!({
            "message": format!("Seeked to {:.2}s", status.position_s),
            "new_position": status.position_s,
            "duration": status.duration_s,
            "status": status_json(&status),
        }),
        lastmsg,
    )
}

async fn flip_lr_stereo(
    state: &Arc<AppState>,
    data: &Option<Value>,
    lastmsg: Option<String>,
) -> Reply {
    let flip = field_bool(data, "flip_lr_stereo");
    if data.is_some()
        && data.as_ref().unwrap().get("flip_lr_stereo").is_some()
        && flip.is_none()
    {
        return Reply::error("flip_lr_stereo must be a boolean value", lastmsg);
    }

    let transport = Arc::clone(&state.transport);
    let result = tokio::task::spawn_blocking(move || transport.set_flip_lr_stereo(flip)).await;
    match result {
        Ok(Ok((current, status))) => Reply::success(
            json!({
                "message": format!("Flip L/R stereo is {}", current),
                "flip_lr_stereo": current,
                "status": status_json(&status),
            }),
            lastmsg,
        ),
        Ok(Err(e)) => Reply::error(e.to_string(), lastmsg),
        Err(e) => Reply::error(format!("flip task failed: {}", e), lastmsg),
    }
}

async fn terminate(state: &Arc<AppState>, lastmsg: Option<String>) -> (Reply, bool) {
    let reply = run_blocking(state, lastmsg.clone(), |t| {
        t.terminate();
        Ok(t.status())
    })
    .await;

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        // Let the reply flush before the accept loop stops.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = shutdown.send(());
    });

    if reply.status == "success" {
        (
            Reply::success(
                json!({ "message": "Server is shutting down gracefully" }),
                lastmsg,
            ),
            true,
        )
    } else {
        (reply, true)
    }
}

// ───────────────────────────────────────────────────────────────────────
// Plumbing
// ───────────────────────────────────────────────────────────────────────

/// Run a transport mutation on the blocking pool with the device timeout.
/// The resulting status (or error) becomes a generic reply; callers
/// usually wrap it with task-specific data.
async fn run_blocking<F>(state: &Arc<AppState>, lastmsg: Option<String>, f: F) -> Reply
where
    F: FnOnce(&Transport) -> PlaybackResult<PlayerStatus> + Send + 'static,
{
    let transport = Arc::clone(&state.transport);
    let result = tokio::time::timeout(
        DEVICE_TIMEOUT,
        tokio::task::spawn_blocking(move || f(&transport)),
    )
    .await;

    match result {
        Ok(Ok(Ok(status))) => Reply::success(json!({ "status": status_json(&status) }), lastmsg),
        Ok(Ok(Err(e))) => Reply::error(e.to_string(), lastmsg),
        Ok(Err(e)) => Reply::error(format!("Task panicked: {}", e), lastmsg),
        Err(_) => Reply::error("Operation timed out after 5 s", lastmsg),
    }
}

pub(crate) fn status_json(status: &PlayerStatus) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

fn field_str(data: &Option<Value>, key: &str) -> Option<String> {
    data.as_ref()?.get(key)?.as_str().map(str::to_string)
}

fn field_str_list(data: &Option<Value>, key: &str) -> Option<Vec<String>> {
    data.as_ref()?
        .get(key)?
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn field_u64(data: &Option<Value>, key: &str) -> Option<u64> {
    data.as_ref()?.get(key)?.as_u64()
}

fn field_f64(data: &Option<Value>, key: &str) -> Option<f64> {
    data.as_ref()?.get(key)?.as_f64()
}

fn field_bool(data: &Option<Value>, key: &str) -> Option<bool> {
    data.as_ref()?.get(key)?.as_bool()
}
