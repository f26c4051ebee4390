//! Progress telemetry for the play session
//!
//! One periodic task per `play` request. Each tick samples the latest
//! transport snapshot, so updates are coalesced by construction no matter
//! how fast the audio thread advances. Exactly one `playback_completed`
//! message ends a stream that ran to the end of the asset; faults end it
//! with a terminal error message instead.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;

use dp_playback::TransportState;

use crate::handlers::status_json;
use crate::protocol::Reply;
use crate::server::{send_reply, AppState, SharedWriter};

/// Tick chosen to balance GUI smoothness against overhead.
pub const PROGRESS_TICK: Duration = Duration::from_millis(330);

pub async fn monitor_playback(
    state: Arc<AppState>,
    writer: SharedWriter,
    stream_id: String,
    lastmsg: Option<String>,
) {
    // First tick lands one period out, after the play reply has flushed.
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + PROGRESS_TICK, PROGRESS_TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_underflows = state.transport.status().underflow_events;

    loop {
        interval.tick().await;
        let status = state.transport.status();

        match status.state {
            TransportState::Playing => {
                let delta = status.underflow_events.saturating_sub(last_underflows);
                last_underflows = status.underflow_events;

                let update = Reply::stream_message(
                    &stream_id,
                    "progress_update",
                    json!({
                        "playing": true,
                        "audio_completed": status.audio_completed,
                        "duration": status.duration_s,
                        "progress_percent": status.progress_percent(),
                        "position_samples": status.position_samples,
                        "position_s": status.position_s,
                        "underflow_events_since_last": delta,
                    }),
                    false,
                    lastmsg.clone(),
                );
                if send_reply(&writer, &update).await.is_err() {
                    // The requesting connection is gone; that cancels play.
                    log::info!("Play session disconnected, pausing playback");
                    let transport = Arc::clone(&state.transport);
                    let _ = tokio::task::spawn_blocking(move || transport.pause()).await;
                    return;
                }
            }
            TransportState::Completed => {
                let done = Reply::stream_message(
                    &stream_id,
                    "playback_completed",
                    json!({
                        "message": "Playback completed",
                        "final_status": status_json(&status),
                    }),
                    true,
                    lastmsg.clone(),
                );
                let _ = send_reply(&writer, &done).await;
                return;
            }
            TransportState::Seeking => {}
            TransportState::Paused | TransportState::Idle | TransportState::Loaded => {
                // Paused with an error field (underflow escalation) and
                // Idle (device fault) get a terminal error message; a
                // plain pause or reload just ends the stream.
                if let Some(error) = &status.error {
                    let mut terminal = Reply::error(error.clone(), lastmsg.clone());
                    terminal.id = stream_id.clone();
                    terminal.task = Some("playback_error".to_string());
                    terminal.data = Some(json!({
                        "error": error,
                        "status": status_json(&status),
                    }));
                    let _ = send_reply(&writer, &terminal).await;
                }
                return;
            }
        }
    }
}
