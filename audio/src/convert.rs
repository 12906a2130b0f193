//! Stateful PCM conversion: sample format, channel count, sample rate.
//!
//! The converter is a streaming component: it carries the last input frame
//! and the fractional resampling phase across calls, so feeding one large
//! block or many small blocks produces the same sample sequence with no
//! artifacts at block boundaries. It is single-threaded by design.

use crate::error::{Error, Result};

/// PCM sample encodings understood by the converter (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed integer.
    S16,
    /// 32-bit IEEE float.
    F32,
}

impl SampleFormat {
    /// Size of one sample in bytes.
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Size of one interleaved frame in bytes.
#[inline]
pub const fn bytes_per_frame(format: SampleFormat, channels: u16) -> usize {
    format.bytes_per_sample() * channels as usize
}

/// Streaming PCM converter.
///
/// Given N input frames, the stream yields `ceil(N * out_rate / in_rate)`
/// output frames; a single call may hold back up to one frame's worth of
/// output until the next block arrives when the interpolation window spans
/// a block boundary.
#[derive(Debug)]
pub struct PcmConverter {
    in_format: SampleFormat,
    in_rate: u32,
    in_channels: u16,
    out_format: SampleFormat,
    out_rate: u32,
    out_channels: u16,
    /// Source positions advanced per output frame.
    step: f64,
    /// Source position of the next output frame, relative to the start of
    /// the next input block; -1.0 addresses `carry`.
    phase: f64,
    /// Last frame of the previous block, for interpolation across blocks.
    carry: Option<f32>,
}

impl PcmConverter {
    pub fn new(
        in_format: SampleFormat,
        in_rate: u32,
        in_channels: u16,
        out_format: SampleFormat,
        out_rate: u32,
        out_channels: u16,
    ) -> Result<Self> {
        if in_rate == 0 || out_rate == 0 {
            return Err(Error::ConverterConfig("sample rate must be non-zero".into()));
        }
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::ConverterConfig("channel count must be non-zero".into()));
        }
        Ok(Self {
            in_format,
            in_rate,
            in_channels,
            out_format,
            out_rate,
            out_channels,
            step: in_rate as f64 / out_rate as f64,
            phase: 0.0,
            carry: None,
        })
    }

    /// Converts one block of interleaved input PCM, returning interleaved
    /// output PCM. Trailing bytes that do not form a whole frame are
    /// dropped. An empty input yields an empty output.
    pub fn convert(&mut self, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let mono = self.decode_mono(data);
        let resampled = self.resample(&mono);
        self.encode(&resampled)
    }

    /// Decodes interleaved input to f32 and mixes down to mono.
    fn decode_mono(&self, data: &[u8]) -> Vec<f32> {
        let frame_bytes = bytes_per_frame(self.in_format, self.in_channels);
        let channels = self.in_channels as usize;
        let mut mono = Vec::with_capacity(data.len() / frame_bytes);
        for frame in data.chunks_exact(frame_bytes) {
            let mut acc = 0.0f32;
            match self.in_format {
                SampleFormat::S16 => {
                    for s in frame.chunks_exact(2) {
                        acc += i16::from_le_bytes([s[0], s[1]]) as f32 / 32768.0;
                    }
                }
                SampleFormat::F32 => {
                    for s in frame.chunks_exact(4) {
                        acc += f32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    }
                }
            }
            mono.push(acc / channels as f32);
        }
        mono
    }

    /// Linear resampling with state carried across blocks.
    fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        let len = input.len();
        if len == 0 {
            return Vec::new();
        }
        let mut out =
            Vec::with_capacity((len as f64 / self.step).ceil() as usize + 1);
        let mut t = self.phase;
        loop {
            if t < 0.0 {
                // Between the carried frame and the first frame of this block.
                let Some(a) = self.carry else { break };
                let b = input[0];
                out.push(a + (b - a) * (t + 1.0) as f32);
                t += self.step;
                continue;
            }
            let i = t as usize;
            if i >= len {
                break;
            }
            let frac = t - i as f64;
            if frac == 0.0 {
                out.push(input[i]);
            } else if i + 1 < len {
                let a = input[i];
                let b = input[i + 1];
                out.push(a + (b - a) * frac as f32);
            } else {
                // The interpolation window needs the next block's first frame.
                break;
            }
            t += self.step;
        }
        self.carry = Some(input[len - 1]);
        self.phase = t - len as f64;
        out
    }

    /// Encodes mono f32 samples to the interleaved output format.
    fn encode(&self, mono: &[f32]) -> Vec<u8> {
        let frame_bytes = bytes_per_frame(self.out_format, self.out_channels);
        let mut out = Vec::with_capacity(mono.len() * frame_bytes);
        for &sample in mono {
            for _ in 0..self.out_channels {
                match self.out_format {
                    SampleFormat::S16 => {
                        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        out.extend_from_slice(&s.to_le_bytes());
                    }
                    SampleFormat::F32 => {
                        out.extend_from_slice(&sample.to_le_bytes());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn f32_samples(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn test_downsample_24k_to_8k_count() {
        let mut conv =
            PcmConverter::new(SampleFormat::F32, 24000, 1, SampleFormat::F32, 8000, 1).unwrap();
        let input: Vec<f32> = (0..2400).map(|i| (i as f32 / 2400.0).sin()).collect();
        let out = conv.convert(&f32_bytes(&input));
        // 2400 frames at 24 kHz resample to 800 +/- 1 frames at 8 kHz.
        assert!((3196..=3204).contains(&out.len()), "got {} bytes", out.len());
        assert_eq!(out.len() % 4, 0);
    }

    #[test]
    fn test_downsample_state_across_blocks() {
        let input: Vec<f32> = (0..2400).map(|i| (i as f32 * 0.01).cos()).collect();

        let mut whole =
            PcmConverter::new(SampleFormat::F32, 24000, 1, SampleFormat::F32, 8000, 1).unwrap();
        let expect = whole.convert(&f32_bytes(&input));

        let mut split =
            PcmConverter::new(SampleFormat::F32, 24000, 1, SampleFormat::F32, 8000, 1).unwrap();
        let mut got = split.convert(&f32_bytes(&input[..1200]));
        got.extend(split.convert(&f32_bytes(&input[1200..])));

        assert_eq!(got, expect);
    }

    #[test]
    fn test_same_rate_passthrough() {
        let mut conv =
            PcmConverter::new(SampleFormat::F32, 16000, 1, SampleFormat::F32, 16000, 1).unwrap();
        let input = vec![0.25f32, -0.5, 0.75, 1.0];
        let out = f32_samples(&conv.convert(&f32_bytes(&input)));
        assert_eq!(out, input);
    }

    #[test]
    fn test_upsample_total_count() {
        let mut conv =
            PcmConverter::new(SampleFormat::F32, 8000, 1, SampleFormat::F32, 24000, 1).unwrap();
        let block: Vec<f32> = vec![0.5; 800];
        let mut total = conv.convert(&f32_bytes(&block)).len();
        total += conv.convert(&f32_bytes(&block)).len();
        let frames = total / 4;
        // Two 800-frame blocks at 8 kHz yield ~4800 frames at 24 kHz; the
        // tail held for the next block accounts for the slack.
        assert!((4797..=4800).contains(&frames), "got {frames} frames");
    }

    #[test]
    fn test_constant_signal_stays_constant() {
        let mut conv =
            PcmConverter::new(SampleFormat::F32, 24000, 1, SampleFormat::F32, 8000, 1).unwrap();
        let out = f32_samples(&conv.convert(&f32_bytes(&vec![0.5f32; 300])));
        assert!(!out.is_empty());
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_s16_to_f32_scaling() {
        let mut conv =
            PcmConverter::new(SampleFormat::S16, 16000, 1, SampleFormat::F32, 16000, 1).unwrap();
        let input: Vec<u8> = [16384i16, -16384, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = f32_samples(&conv.convert(&input));
        assert_eq!(out, vec![0.5, -0.5, 0.0]);
    }

    #[test]
    fn test_stereo_mixdown() {
        let mut conv =
            PcmConverter::new(SampleFormat::S16, 16000, 2, SampleFormat::S16, 16000, 1).unwrap();
        // L=1000 R=2000 -> M=1500
        let input: Vec<u8> = [1000i16, 2000, 1000, 2000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = conv.convert(&input);
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples.len(), 2);
        for s in samples {
            assert!((1498..=1501).contains(&s), "got {s}");
        }
    }

    #[test]
    fn test_empty_input() {
        let mut conv =
            PcmConverter::new(SampleFormat::F32, 24000, 1, SampleFormat::F32, 8000, 1).unwrap();
        assert!(conv.convert(&[]).is_empty());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let r = PcmConverter::new(SampleFormat::F32, 0, 1, SampleFormat::F32, 8000, 1);
        assert!(r.is_err());
    }
}
