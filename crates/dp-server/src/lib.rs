//! dp-server: the control protocol endpoint
//!
//! A WebSocket server on localhost speaking message-framed JSON. Short
//! control connections and one long-lived `play` session coexist; the
//! play session receives coalesced progress telemetry until it closes or
//! playback completes.

mod handlers;
mod progress;
mod protocol;
mod server;

pub use progress::*;
pub use protocol::*;
pub use server::*;
