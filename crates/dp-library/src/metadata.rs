//! Audio asset metadata
//!
//! Symphonia does the heavy lifting (codec parameters, tags, visuals).
//! Fallbacks cover what it misses in the wild: ID3 tags written into WAV
//! files, cue points in PCM/Wave containers, and `cover`/`folder` images
//! next to the file.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use symphonia::core::codecs::{CodecType, CODEC_TYPE_NULL};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{StandardTagKey, Tag, Value, Visual};
use symphonia::core::probe::Hint;

use crate::{LibraryError, LibraryResult};

/// A named offset within an asset, used for navigation.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Chapter {
    /// Start timestamp in seconds.
    pub timestamp_s: f64,
    pub title: String,
    pub description: Option<String>,
    pub start_sample: Option<u64>,
}

/// Immutable description of one audio file.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AudioAsset {
    /// Identity.
    pub path: String,
    /// Display name: track title, falling back to the file stem.
    pub name: String,
    pub artist: Option<String>,
    /// Cover art as a base64 data URI.
    pub thumbnail: Option<String>,
    pub sample_rate_hz: u32,
    pub bit_depth: u32,
    pub channel_count: u32,
    pub duration_s: f64,
    pub size_bytes: u64,
    /// Ordered, non-decreasing timestamps within `[0, duration_s]`.
    pub chapters: Option<Vec<Chapter>>,
}

fn picture_to_data_uri(mime_type: &str, data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        general_purpose::STANDARD.encode(data)
    )
}

/// Extract the full asset description for one file.
pub fn extract_metadata(path: &Path) -> LibraryResult<AudioAsset> {
    let size_bytes = std::fs::metadata(path)
        .map_err(|e| LibraryError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .len();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut asset = AudioAsset {
        path: path.display().to_string(),
        name: stem,
        artist: None,
        thumbnail: None,
        sample_rate_hz: 0,
        bit_depth: 0,
        channel_count: 0,
        duration_s: 0.0,
        size_bytes,
        chapters: None,
    };

    let file = File::open(path).map_err(|e| LibraryError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, stream, &Default::default(), &Default::default())
        .map_err(|e| LibraryError::Metadata(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| LibraryError::Metadata("no supported audio tracks".to_string()))?;
    let codec = track.codec_params.codec;

    asset.sample_rate_hz = track.codec_params.sample_rate.unwrap_or(0);
    asset.channel_count = track.codec_params.channels.map_or(0, |c| c.count() as u32);
    asset.bit_depth = track.codec_params.bits_per_sample.unwrap_or(0);
    asset.duration_s = track
        .codec_params
        .n_frames
        .map_or(0.0, |f| f as f64 / asset.sample_rate_hz.max(1) as f64);

    let mut metadata = format.metadata();
    if let Some(revision) = metadata.skip_to_latest() {
        let tags = revision.tags();
        asset.thumbnail = extract_thumbnail(revision.visuals(), local_thumbnails(path));
        asset.chapters = chapters_from_tags(tags);
        apply_known_tags(&mut asset, tags);
    }

    // Markers usually live in metadata tags; cues in the format itself
    // are the rarer fallback.
    if asset.chapters.is_none() {
        for cue in format.cues() {
            if let Some(chapters) = chapters_from_tags(&cue.tags) {
                asset.chapters = Some(chapters);
                break;
            }
        }
    }

    // Symphonia sometimes misses ID3 tags written into WAV by taggers.
    fill_from_id3(&mut asset, path);

    // PCM/Wave cue points are a last resort for chapters.
    if asset.chapters.is_none() && is_pcm_wave(codec) {
        asset.chapters = wav_cue_chapters(path);
    }

    if asset.thumbnail.is_none() {
        asset.thumbnail = local_thumbnails(path);
    }

    if let Some(chapters) = asset.chapters.take() {
        asset.chapters = Some(normalize_chapters(
            chapters,
            asset.duration_s,
            asset.sample_rate_hz,
        ));
    }

    Ok(asset)
}

fn apply_known_tags(asset: &mut AudioAsset, tags: &[Tag]) {
    for tag in tags {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => asset.name = tag.value.to_string(),
            Some(StandardTagKey::Artist) => asset.artist = Some(tag.value.to_string()),
            _ => {}
        }
    }
}

/// Pick the best visual: square aspect first, then highest resolution.
fn extract_thumbnail(visuals: &[Visual], fallback: Option<String>) -> Option<String> {
    if visuals.is_empty() {
        return fallback;
    }

    let mut indices: Vec<usize> = (0..visuals.len()).collect();
    let area = |v: &Visual| {
        v.dimensions
            .map(|d| u64::from(d.width) * u64::from(d.height))
            .unwrap_or(0)
    };
    let square = |v: &Visual| v.dimensions.is_some_and(|d| d.width == d.height);
    indices.sort_by(|&a, &b| {
        square(&visuals[b])
            .cmp(&square(&visuals[a]))
            .then(area(&visuals[b]).cmp(&area(&visuals[a])))
    });

    let best = &visuals[indices[0]];
    if best.data.is_empty() {
        return fallback;
    }
    Some(picture_to_data_uri(&best.media_type, &best.data))
}

/// Cover/folder images next to the file serve as a default thumbnail.
fn local_thumbnails(path: &Path) -> Option<String> {
    let parent = path.parent()?;
    let names = ["cover", "folder"];

    for entry in parent.read_dir().ok()? {
        let entry = entry.ok()?.path();
        let stem = entry.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        let ext = entry
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let mime_type = match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            _ => continue,
        };
        if !names.iter().any(|name| stem.contains(name)) {
            continue;
        }
        if let Ok(data) = std::fs::read(&entry) {
            return Some(picture_to_data_uri(mime_type, &data));
        }
    }

    None
}

/// Chapters from embedded cuesheet tags.
fn chapters_from_tags(tags: &[Tag]) -> Option<Vec<Chapter>> {
    let mut chapters = Vec::new();
    for tag in tags {
        if let Value::String(ref text) = tag.value {
            if tag.key.to_lowercase().contains("cuesheet") {
                if let Some(parsed) = cuesheet_to_chapters(text) {
                    chapters.extend(parsed);
                }
            }
        }
    }
    (!chapters.is_empty()).then_some(chapters)
}

/// Parse an embedded cuesheet into chapter markers (INDEX 01 entries).
pub fn cuesheet_to_chapters(cuesheet: &str) -> Option<Vec<Chapter>> {
    // Some taggers prepend headers; the track data starts at FILE.
    let track_data = cuesheet
        .lines()
        .skip_while(|line| !line.trim().starts_with("FILE"))
        .collect::<Vec<_>>()
        .join("\n");

    let commands = match cue_sheet::parser::parse_cue(&track_data) {
        Ok(commands) => commands,
        Err(e) => {
            log::warn!("Failed to parse cuesheet: {:?}", e);
            return None;
        }
    };

    let mut chapters = Vec::new();
    let mut current_title = String::new();
    for command in commands {
        match command {
            cue_sheet::parser::Command::Title(title) => current_title = title,
            cue_sheet::parser::Command::Index(index, timestamp) => {
                if index == 1 {
                    chapters.push(Chapter {
                        timestamp_s: timestamp.total_seconds(),
                        title: current_title.clone(),
                        description: None,
                        start_sample: None,
                    });
                }
            }
            _ => {}
        }
    }

    (!chapters.is_empty()).then_some(chapters)
}

/// Cue points embedded in PCM/Wave files.
fn wav_cue_chapters(path: &Path) -> Option<Vec<Chapter>> {
    let mut reader = bwavfile::WaveReader::open(path).ok()?;
    let cue_points = reader.cue_points().ok()?;
    let format = reader.format().ok()?;

    let width = cue_points.len().to_string().len();
    let chapters: Vec<Chapter> = cue_points
        .iter()
        .enumerate()
        .map(|(i, cue)| Chapter {
            timestamp_s: f64::from(cue.frame) / f64::from(format.sample_rate),
            title: cue
                .label
                .clone()
                .unwrap_or(format!("Chapter #{:0width$}", i + 1, width = width)),
            description: cue.note.clone(),
            start_sample: Some(u64::from(cue.frame)),
        })
        .collect();

    (!chapters.is_empty()).then_some(chapters)
}

/// Read ID3 tags directly when symphonia left gaps.
fn fill_from_id3(asset: &mut AudioAsset, path: &Path) {
    let Ok(tag) = id3::Tag::read_from_path(path) else {
        return;
    };
    use id3::TagLike;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if asset.name.is_empty() || asset.name == stem {
        if let Some(title) = tag.title() {
            asset.name = title.to_string();
        }
    }
    if asset.artist.is_none() {
        asset.artist = tag.artist().map(str::to_string);
    }
    if asset.thumbnail.is_none() {
        if let Some(picture) = tag.pictures().next() {
            asset.thumbnail = Some(picture_to_data_uri(&picture.mime_type, &picture.data));
        }
    }
}

/// Any CodecType from 0x100 up to 0x125 is PCM/Wave.
fn is_pcm_wave(codec: CodecType) -> bool {
    let codec_str = format!("{}", codec);
    codec_str
        .strip_prefix("0x")
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .is_some_and(|value| (0x100..=0x125).contains(&value))
}

/// Enforce the chapter invariants: sorted non-decreasing, clamped to
/// `[0, duration]`, deduplicated by timestamp, sample offsets filled in.
fn normalize_chapters(mut chapters: Vec<Chapter>, duration_s: f64, rate_hz: u32) -> Vec<Chapter> {
    chapters.retain(|c| c.timestamp_s.is_finite());
    for chapter in &mut chapters {
        chapter.timestamp_s = chapter.timestamp_s.clamp(0.0, duration_s.max(0.0));
    }
    chapters.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));

    let mut seen = HashSet::new();
    chapters.retain(|c| seen.insert(c.timestamp_s.to_bits()));

    if rate_hz > 0 {
        for chapter in &mut chapters {
            if chapter.start_sample.is_none() {
                chapter.start_sample = Some((chapter.timestamp_s * f64::from(rate_hz)) as u64);
            }
        }
    }
    chapters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuesheet_parses_index_01_markers() {
        let cuesheet = concat!(
            "FILE \"session.flac\" WAVE\n",
            "  TRACK 01 AUDIO\n",
            "    TITLE \"Intro\"\n",
            "    INDEX 01 00:00:00\n",
            "  TRACK 02 AUDIO\n",
            "    TITLE \"Stimulus\"\n",
            "    INDEX 01 01:30:00\n",
        );
        let chapters = cuesheet_to_chapters(cuesheet).expect("two markers");
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Intro");
        assert_eq!(chapters[0].timestamp_s, 0.0);
        assert_eq!(chapters[1].title, "Stimulus");
        assert!((chapters[1].timestamp_s - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_sorts_clamps_and_fills_samples() {
        let raw = vec![
            Chapter {
                timestamp_s: 95.0,
                title: "late".into(),
                description: None,
                start_sample: None,
            },
            Chapter {
                timestamp_s: -3.0,
                title: "early".into(),
                description: None,
                start_sample: None,
            },
            Chapter {
                timestamp_s: 10.0,
                title: "mid".into(),
                description: None,
                start_sample: None,
            },
        ];
        let chapters = normalize_chapters(raw, 60.0, 48_000);
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].title, "early");
        assert_eq!(chapters[0].timestamp_s, 0.0);
        assert_eq!(chapters[1].timestamp_s, 10.0);
        assert_eq!(chapters[1].start_sample, Some(480_000));
        assert_eq!(chapters[2].timestamp_s, 60.0, "clamped to duration");
    }

    #[test]
    fn test_duplicate_timestamps_deduplicated() {
        let raw = vec![
            Chapter {
                timestamp_s: 5.0,
                title: "a".into(),
                description: None,
                start_sample: None,
            },
            Chapter {
                timestamp_s: 5.0,
                title: "b".into(),
                description: None,
                start_sample: None,
            },
        ];
        assert_eq!(normalize_chapters(raw, 60.0, 44_100).len(), 1);
    }

    #[test]
    fn test_data_uri_shape() {
        let uri = picture_to_data_uri("image/png", &[1, 2, 3]);
        assert!(uri.starts_with("data:image/png;base64,"));
    }
}
