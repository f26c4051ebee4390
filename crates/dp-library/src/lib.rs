//! dp-library: the library subsystem
//!
//! Everything the player consumes around the engine: directory scanning
//! for audio files, metadata extraction (tags, cover art, chapters), the
//! persistent library/history stores with their binary cache, and the
//! multi-track composer that assembles a chaptered FLAC from a YAML
//! playlist.

mod compose;
mod error;
mod metadata;
mod scan;
mod store;

pub use compose::*;
pub use error::*;
pub use metadata::*;
pub use scan::*;
pub use store::*;
