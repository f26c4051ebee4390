//! Channel fan-out and gain
//!
//! Expands S source channels onto A analog output lines:
//! - S = 1: every AO line carries the mono signal
//! - S = 2: even lines carry LEFT, odd lines RIGHT (roles swap when the
//!   stereo flip is on; flipping is meaningless for S ≠ 2 and is ignored)
//! - S ≥ 3: AO line `i` carries source channel `i mod S`
//!
//! Gain is applied after mapping as `muted ? 0 : volume_pct / 100`, with
//! no smoothing. The mapping is pure and allocation-free.

use dp_core::Sample;

#[derive(Debug, Clone, Copy)]
pub struct ChannelMapper {
    src_channels: usize,
    ao_count: usize,
}

impl ChannelMapper {
    pub fn new(src_channels: usize, ao_count: usize) -> Self {
        debug_assert!(src_channels > 0 && ao_count > 0);
        Self {
            src_channels,
            ao_count,
        }
    }

    pub fn ao_count(&self) -> usize {
        self.ao_count
    }

    /// Whether a stereo flip has any effect for this source layout.
    pub fn flip_applies(&self) -> bool {
        self.src_channels == 2
    }

    /// Map `frames` interleaved source frames into the AO-interleaved
    /// destination, applying `gain`. `dest` must hold at least
    /// `frames * ao_count` samples; the caller zero-fills any tail.
    pub fn map_into(
        &self,
        src: &[Sample],
        frames: usize,
        gain: f32,
        flip_lr: bool,
        dest: &mut [Sample],
    ) {
        let s = self.src_channels;
        let a = self.ao_count;
        let flip = flip_lr && s == 2;

        for frame in 0..frames {
            let src_frame = &src[frame * s..(frame + 1) * s];
            let dst_frame = &mut dest[frame * a..(frame + 1) * a];

            for (line, out) in dst_frame.iter_mut().enumerate() {
                let channel = match s {
                    1 => 0,
                    2 => (line % 2) ^ usize::from(flip),
                    _ => line % s,
                };
                *out = src_frame[channel] * gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(mapper: &ChannelMapper, src: &[Sample], gain: f32, flip: bool) -> Vec<Sample> {
        let frames = src.len() / mapper.src_channels;
        let mut dest = vec![0.0; frames * mapper.ao_count];
        mapper.map_into(src, frames, gain, flip, &mut dest);
        dest
    }

    #[test]
    fn test_mono_fans_out_to_all_lines() {
        let mapper = ChannelMapper::new(1, 4);
        let out = map(&mapper, &[0.5, -0.25], 1.0, false);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.5, -0.25, -0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_stereo_even_left_odd_right() {
        let mapper = ChannelMapper::new(2, 4);
        let out = map(&mapper, &[0.1, 0.2], 1.0, false);
        assert_eq!(out, vec![0.1, 0.2, 0.1, 0.2]);
    }

    #[test]
    fn test_stereo_flip_swaps_roles() {
        let mapper = ChannelMapper::new(2, 4);
        let out = map(&mapper, &[0.1, 0.2], 1.0, true);
        assert_eq!(out, vec![0.2, 0.1, 0.2, 0.1]);
    }

    #[test]
    fn test_flip_is_identity_for_non_stereo() {
        for channels in [1, 3, 4, 5] {
            let mapper = ChannelMapper::new(channels, 6);
            let src: Vec<Sample> = (0..channels * 3).map(|i| i as f32 * 0.01).collect();
            assert_eq!(
                map(&mapper, &src, 1.0, false),
                map(&mapper, &src, 1.0, true),
                "flip must be a no-op for {} channels",
                channels
            );
        }
    }

    #[test]
    fn test_multichannel_wraps_around() {
        let mapper = ChannelMapper::new(3, 5);
        let out = map(&mapper, &[0.1, 0.2, 0.3], 1.0, false);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.1, 0.2]);
    }

    #[test]
    fn test_gain_and_mute() {
        let mapper = ChannelMapper::new(1, 2);
        assert_eq!(map(&mapper, &[0.8], 0.5, false), vec![0.4, 0.4]);
        assert_eq!(map(&mapper, &[0.8], 0.0, false), vec![0.0, 0.0]);
    }

    #[test]
    fn test_output_is_finite() {
        let mapper = ChannelMapper::new(2, 8);
        let src: Vec<Sample> = (0..256).map(|i| ((i as f32) * 0.37).sin()).collect();
        let out = map(&mapper, &src, 0.73, true);
        assert_eq!(out.len(), 128 * 8);
        assert!(out.iter().all(|s| s.is_finite()));
    }
}
