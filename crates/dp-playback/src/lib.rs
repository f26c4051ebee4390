//! dp-playback: the frame-clocked playback engine
//!
//! ```text
//! ┌───────────┐    ┌───────────────┐    ┌───────────────┐
//! │ Transport │───▶│   FramePump   │───▶│ OutputSession │
//! │           │    │ (audio thread)│    │   (dp-daq)    │
//! │ - states  │    │ - decode      │    │ - AO write    │
//! │ - job     │    │ - map + gain  │    │ - DO sync     │
//! │ - control │    │ - underflows  │    │ - backpressure│
//! └───────────┘    └───────────────┘    └───────────────┘
//! ```
//!
//! The transport owns the state machine and the job; the pump is a
//! dedicated audio thread that drains the decoder through the channel
//! mapper into the device buffer. Control handlers mutate shared
//! parameters under a short lock; the pump reads them once per frame.

mod decoder;
mod error;
mod job;
mod mapper;
mod pump;
mod transport;

pub use decoder::*;
pub use error::*;
pub use job::*;
pub use mapper::*;
pub use pump::*;
pub use transport::*;
