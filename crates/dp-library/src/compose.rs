//! Multi-track composition
//!
//! Turns a declarative YAML playlist into a single chaptered FLAC: each
//! track is decoded, resampled to the highest track rate, mixed to mono,
//! and concatenated with generated pause segments. Chapter offsets are
//! recorded per segment and embedded as a cuesheet tag, so the result
//! flows through the ordinary metadata and playback paths.
//!
//! Pause segments are written as `pause_<ms>ms` or `pause_[min|max]ms`
//! (uniformly random in the range, reproducible via `RandSeed`), with an
//! optional ` | Title` suffix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use flacenc::component::BitRepr;
use flacenc::error::Verify;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rubato::{FftFixedInOut, Resampler};
use serde::{Deserialize, Serialize};

use dp_playback::{AudioSource, AudioDecoder};

use crate::{Chapter, LibraryError, LibraryResult};

const COMPOSE_BITS_PER_SAMPLE: u32 = 16;
/// Cuesheet timestamps tick at 75 frames per second.
const CUE_FRAMES_PER_SECOND: f64 = 75.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistTrack {
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Alias")]
    pub alias: String,
}

/// The declarative playlist. Common tags are carried into the output's
/// vorbis comments; `Content` sequences track aliases and pauses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(rename = "Album", default)]
    pub album: Option<String>,
    #[serde(rename = "Artist", default)]
    pub artist: Option<String>,
    #[serde(rename = "Date", default)]
    pub date: Option<String>,
    #[serde(rename = "Genre", default)]
    pub genre: Option<String>,
    #[serde(rename = "Comment", default)]
    pub comment: Option<String>,
    #[serde(rename = "AlbumCover", default)]
    pub album_cover: Option<String>,
    #[serde(rename = "RandSeed", default)]
    pub rand_seed: Option<u64>,
    #[serde(rename = "Tracks", default)]
    pub tracks: Vec<PlaylistTrack>,
    #[serde(rename = "Content", default)]
    pub content: Option<Vec<Option<String>>>,
}

pub fn parse_playlist(path: &Path) -> LibraryResult<Playlist> {
    let content = std::fs::read_to_string(path).map_err(|e| LibraryError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_yml::from_str(&content).map_err(|e| LibraryError::Playlist(e.to_string()))
}

/// Result of a composition run.
#[derive(Debug, Clone)]
pub struct ComposedInfo {
    pub path: PathBuf,
    pub sample_rate_hz: u32,
    pub total_samples: u64,
    pub chapters: Vec<Chapter>,
}

/// Compose `playlist` into a FLAC file at `output`.
pub fn compose_playlist(playlist_path: &Path, output: &Path) -> LibraryResult<ComposedInfo> {
    let playlist = parse_playlist(playlist_path)?;
    if playlist.tracks.is_empty() {
        return Err(LibraryError::Playlist("playlist has no tracks".into()));
    }
    let base_dir = playlist_path.parent().unwrap_or(Path::new("."));

    // Load every track mixed to mono at its native rate.
    let mut loaded: HashMap<String, (Vec<f32>, u32, String)> = HashMap::new();
    let mut target_rate = 0u32;
    for track in &playlist.tracks {
        let path = resolve_track_path(base_dir, &track.file);
        let (samples, rate) = load_mono(&path)?;
        target_rate = target_rate.max(rate);
        loaded.insert(track.alias.clone(), (samples, rate, track.title.clone()));
    }

    let mut rng = StdRng::seed_from_u64(playlist.rand_seed.unwrap_or(0));

    // Default content: every track once, in declared order.
    let sequence: Vec<String> = match &playlist.content {
        Some(content) => content.iter().flatten().cloned().collect(),
        None => playlist.tracks.iter().map(|t| t.alias.clone()).collect(),
    };

    let mut samples: Vec<f32> = Vec::new();
    let mut chapters: Vec<Chapter> = Vec::new();

    for item in &sequence {
        if item.starts_with("pause_") {
            let pause = create_pause(item, target_rate, &mut rng);
            if let Some(title) = &pause.title {
                chapters.push(chapter_at(samples.len(), target_rate, title, None));
            }
            samples.extend(pause.data);
            continue;
        }

        let (track_samples, rate, title) = loaded
            .get(item)
            .ok_or_else(|| LibraryError::Playlist(format!("unknown alias: {}", item)))?;
        chapters.push(chapter_at(samples.len(), target_rate, title, None));
        if *rate == target_rate {
            samples.extend_from_slice(track_samples);
        } else {
            samples.extend(resample(track_samples, *rate, target_rate)?);
        }
    }

    encode_flac(&samples, target_rate, output)?;
    write_tags(&playlist, &chapters, base_dir, output)?;

    Ok(ComposedInfo {
        path: output.to_path_buf(),
        sample_rate_hz: target_rate,
        total_samples: samples.len() as u64,
        chapters,
    })
}

fn resolve_track_path(base_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn chapter_at(offset: usize, rate: u32, title: &str, description: Option<String>) -> Chapter {
    Chapter {
        timestamp_s: offset as f64 / f64::from(rate.max(1)),
        title: title.to_string(),
        description,
        start_sample: Some(offset as u64),
    }
}

/// Decode a whole file and fold its channels down to mono.
fn load_mono(path: &Path) -> LibraryResult<(Vec<f32>, u32)> {
    let mut decoder =
        AudioDecoder::open(path).map_err(|e| LibraryError::Compose(e.to_string()))?;
    let rate = decoder.sample_rate_hz();
    let channels = decoder.channel_count();

    let mut mono = Vec::new();
    let mut buffer = vec![0.0f32; 8192 * channels];
    loop {
        let frames = decoder
            .read_into(&mut buffer, 8192)
            .map_err(|e| LibraryError::Compose(e.to_string()))?;
        if frames == 0 {
            break;
        }
        for frame in buffer[..frames * channels].chunks_exact(channels) {
            let sum: f64 = frame.iter().map(|&s| f64::from(s)).sum();
            mono.push((sum / channels as f64) as f32);
        }
    }
    Ok((mono, rate))
}

fn resample(input: &[f32], from_hz: u32, to_hz: u32) -> LibraryResult<Vec<f32>> {
    let mut resampler = FftFixedInOut::<f32>::new(from_hz as usize, to_hz as usize, 1024, 1)
        .map_err(|e| LibraryError::Compose(e.to_string()))?;

    let mut output = Vec::with_capacity(input.len() * to_hz as usize / from_hz as usize);
    let mut cursor = 0;
    while cursor < input.len() {
        let need = resampler.input_frames_next();
        let mut chunk = vec![0.0f32; need];
        let take = need.min(input.len() - cursor);
        chunk[..take].copy_from_slice(&input[cursor..cursor + take]);
        cursor += take;

        let resampled = resampler
            .process(&[chunk], None)
            .map_err(|e| LibraryError::Compose(e.to_string()))?;
        output.extend_from_slice(&resampled[0]);
    }
    Ok(output)
}

fn encode_flac(samples: &[f32], rate: u32, output: &Path) -> LibraryResult<()> {
    let quantized: Vec<i32> = samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i32)
        .collect();

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|e| LibraryError::Compose(format!("encoder config: {:?}", e)))?;
    let source = flacenc::source::MemSource::from_samples(
        &quantized,
        1,
        COMPOSE_BITS_PER_SAMPLE as usize,
        rate as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| LibraryError::Compose(format!("encode: {:?}", e)))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| LibraryError::Compose(format!("write: {:?}", e)))?;
    std::fs::write(output, sink.as_slice()).map_err(|e| LibraryError::Write {
        path: output.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

fn write_tags(
    playlist: &Playlist,
    chapters: &[Chapter],
    base_dir: &Path,
    output: &Path,
) -> LibraryResult<()> {
    let mut tag = metaflac::Tag::read_from_path(output)
        .map_err(|e| LibraryError::Compose(format!("tagging: {}", e)))?;

    tag.set_vorbis("CUESHEET", vec![build_cuesheet(output, chapters)]);
    if let Some(album) = &playlist.album {
        tag.set_vorbis("ALBUM", vec![album.clone()]);
        tag.set_vorbis("TITLE", vec![album.clone()]);
    }
    if let Some(artist) = &playlist.artist {
        tag.set_vorbis("ARTIST", vec![artist.clone()]);
    }
    if let Some(date) = &playlist.date {
        tag.set_vorbis("DATE", vec![date.clone()]);
    }
    if let Some(genre) = &playlist.genre {
        tag.set_vorbis("GENRE", vec![genre.clone()]);
    }
    if let Some(comment) = &playlist.comment {
        tag.set_vorbis("COMMENT", vec![comment.clone()]);
    }

    if let Some(cover) = &playlist.album_cover {
        let cover_path = resolve_track_path(base_dir, cover);
        if let Ok(data) = std::fs::read(&cover_path) {
            let mime = match cover_path.extension().and_then(|e| e.to_str()) {
                Some("png") => "image/png",
                _ => "image/jpeg",
            };
            tag.add_picture(mime, metaflac::block::PictureType::CoverFront, data);
        } else {
            log::warn!("Album cover not found: {}", cover_path.display());
        }
    }

    tag.save()
        .map_err(|e| LibraryError::Compose(format!("tag save: {}", e)))
}

/// Render chapters as a cuesheet the metadata extractor reads back.
fn build_cuesheet(output: &Path, chapters: &[Chapter]) -> String {
    let file_name = output
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("output.flac");

    let mut sheet = format!("FILE \"{}\" WAVE\n", file_name);
    for (i, chapter) in chapters.iter().enumerate() {
        let total_frames = (chapter.timestamp_s * CUE_FRAMES_PER_SECOND).round() as u64;
        let minutes = total_frames / (75 * 60);
        let seconds = (total_frames / 75) % 60;
        let frames = total_frames % 75;
        sheet.push_str(&format!("  TRACK {:02} AUDIO\n", i + 1));
        sheet.push_str(&format!("    TITLE \"{}\"\n", chapter.title));
        sheet.push_str(&format!(
            "    INDEX 01 {:02}:{:02}:{:02}\n",
            minutes, seconds, frames
        ));
    }
    sheet
}

// ───────────────────────────────────────────────────────────────────────
// Pause segments
// ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PauseData {
    pub signature: String,
    pub title: Option<String>,
    pub sample_rate_hz: u32,
    pub data: Vec<f32>,
}

/// Parse a pause signature into milliseconds and an optional title,
/// evaluating a random range if the signature requests one.
fn parse_pause_signature(signature: &str, rng: &mut StdRng) -> (u32, Option<String>) {
    let Some(body) = signature.strip_prefix("pause_") else {
        return (0, None);
    };

    let (duration, title) = match body.split_once("ms") {
        Some((duration, rest)) => {
            let title = rest
                .trim()
                .strip_prefix('|')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
            (duration.trim(), title)
        }
        None => return (0, None),
    };

    let millis = if let Some(range) = duration.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        let (min, max) = range.split_once('|').unwrap_or((range, range));
        let min: u32 = min.trim().parse().unwrap_or(0);
        let max: u32 = max.trim().parse().unwrap_or(min);
        if max > min {
            rng.random_range(min..=max)
        } else {
            min
        }
    } else {
        duration.parse().unwrap_or(0)
    };

    (millis, title)
}

pub fn create_pause(signature: &str, sample_rate_hz: u32, rng: &mut StdRng) -> PauseData {
    let (millis, title) = parse_pause_signature(signature, rng);
    let len = (u64::from(sample_rate_hz) * u64::from(millis) / 1000) as usize;
    PauseData {
        signature: signature.to_string(),
        title,
        sample_rate_hz,
        data: vec![0.0; len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_fixed_pause_signature() {
        let pause = create_pause("pause_1000ms", 48_000, &mut rng());
        assert_eq!(pause.data.len(), 48_000);
        assert!(pause.title.is_none());
    }

    #[test]
    fn test_pause_with_title() {
        let pause = create_pause("pause_500ms | Inter-trial", 44_100, &mut rng());
        assert_eq!(pause.data.len(), 22_050);
        assert_eq!(pause.title.as_deref(), Some("Inter-trial"));
    }

    #[test]
    fn test_random_pause_is_seed_stable_and_in_range() {
        let a = create_pause("pause_[8000|12000]ms", 1000, &mut rng());
        let b = create_pause("pause_[8000|12000]ms", 1000, &mut rng());
        assert_eq!(a.data.len(), b.data.len(), "same seed, same draw");
        assert!((8000..=12000).contains(&(a.data.len() as u32)));
    }

    #[test]
    fn test_malformed_signature_is_empty() {
        assert!(create_pause("pause_oops", 48_000, &mut rng()).data.is_empty());
        assert!(create_pause("notapause", 48_000, &mut rng()).data.is_empty());
    }

    #[test]
    fn test_cuesheet_layout() {
        let chapters = vec![
            Chapter {
                timestamp_s: 0.0,
                title: "One".into(),
                description: None,
                start_sample: Some(0),
            },
            Chapter {
                timestamp_s: 90.5,
                title: "Two".into(),
                description: None,
                start_sample: None,
            },
        ];
        let sheet = build_cuesheet(Path::new("/tmp/out.flac"), &chapters);
        assert!(sheet.starts_with("FILE \"out.flac\" WAVE"));
        assert!(sheet.contains("TRACK 01 AUDIO"));
        assert!(sheet.contains("INDEX 01 00:00:00"));
        assert!(sheet.contains("TITLE \"Two\""));
        assert!(sheet.contains("INDEX 01 01:30:3"), "90.5s = 1m30s + 37.5 frames");
    }

    #[test]
    fn test_playlist_yaml_parsing() {
        let yaml = concat!(
            "Album: Session A\n",
            "Artist: Lab\n",
            "RandSeed: 42\n",
            "Tracks:\n",
            "  - File: tone.wav\n",
            "    Title: Tone\n",
            "    Alias: tone\n",
            "Content:\n",
            "  - tone\n",
            "  - pause_2000ms | Rest\n",
            "  - tone\n",
        );
        let playlist: Playlist = serde_yml::from_str(yaml).unwrap();
        assert_eq!(playlist.album.as_deref(), Some("Session A"));
        assert_eq!(playlist.tracks.len(), 1);
        assert_eq!(playlist.rand_seed, Some(42));
        let content = playlist.content.unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[1].as_deref(), Some("pause_2000ms | Rest"));
    }

    #[test]
    fn test_resample_preserves_duration_roughly() {
        let input: Vec<f32> = (0..44_100).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let output = resample(&input, 44_100, 48_000).unwrap();
        let expected = 48_000f64;
        // FFT resampling pads to whole chunks; duration stays within one
        // chunk of the exact ratio.
        assert!((output.len() as f64 - expected).abs() < 2048.0);
    }
}
