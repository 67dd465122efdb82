use crate::error::{ModemError, Result};

pub const SUPPORTED_BITS_PER_SAMPLE: [u16; 4] = [8, 16, 24, 32];
pub const MAX_CHANNELS: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn mono(sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample,
        }
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_sample.div_ceil(8)
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bytes_per_sample()
    }

    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.block_align() as u64
    }

    /// Largest positive sample value.
    pub fn full_scale(&self) -> i32 {
        ((1i64 << (self.bits_per_sample - 1)) - 1) as i32
    }

    pub fn check(&self) -> Result<()> {
        if !SUPPORTED_BITS_PER_SAMPLE.contains(&self.bits_per_sample) {
            return Err(ModemError::UnsupportedFormat(format!(
                "{} bits per sample (supported: {:?})",
                self.bits_per_sample, SUPPORTED_BITS_PER_SAMPLE
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ModemError::UnsupportedFormat(format!(
                "{} channels (supported: 1..={})",
                self.channels, MAX_CHANNELS
            )));
        }
        if self.sample_rate == 0 {
            return Err(ModemError::UnsupportedFormat("sample rate 0".into()));
        }
        if self.byte_rate() > u32::MAX as u64 {
            return Err(ModemError::UnsupportedFormat(format!(
                "sample rate {} Hz overflows the byte rate field",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Interleaved signed PCM samples. 8-bit audio is held signed here
/// (-128..=127) even though WAV stores it unsigned.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub format: PcmFormat,
    pub samples: Vec<i32>,
}

impl PcmBuffer {
    pub fn new(format: PcmFormat, samples: Vec<i32>) -> Self {
        Self { format, samples }
    }

    /// Number of sample frames (one sample per channel each).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames() as f32 / self.format.sample_rate as f32
    }

    /// Normalise to [-1.0, 1.0] and average all channels.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.format.channels.max(1) as usize;
        let scale = (1i64 << (self.format.bits_per_sample - 1)) as f32;

        self.samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| s as f32 / scale).sum();
                sum / channels as f32
            })
            .collect()
    }
}

/// Linear-interpolation sample-rate conversion.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let step = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / step).floor() as usize;

    (0..new_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = position.floor() as usize;
            let fraction = (position - index as f64) as f32;
            match samples.get(index + 1) {
                Some(&next) => samples[index] * (1.0 - fraction) + next * fraction,
                None => samples[index],
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_derived_fields() {
        let format = PcmFormat {
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 24,
        };
        assert_eq!(format.bytes_per_sample(), 3);
        assert_eq!(format.block_align(), 6);
        assert_eq!(format.byte_rate(), 264600);
        assert_eq!(format.full_scale(), 8_388_607);
        assert!(format.check().is_ok());
    }

    #[test]
    fn test_unsupported_formats() {
        let format = PcmFormat::mono(44100, 12);
        assert!(matches!(format.check(), Err(ModemError::UnsupportedFormat(_))));

        let format = PcmFormat {
            sample_rate: 44100,
            channels: 6,
            bits_per_sample: 16,
        };
        assert!(matches!(format.check(), Err(ModemError::UnsupportedFormat(_))));

        let format = PcmFormat::mono(0, 16);
        assert!(matches!(format.check(), Err(ModemError::UnsupportedFormat(_))));

        let format = PcmFormat::mono(0x8000_0000, 16);
        assert_eq!(format.byte_rate(), 1 << 32);
        assert!(matches!(format.check(), Err(ModemError::UnsupportedFormat(_))));

        let format = PcmFormat {
            sample_rate: 0x8000_0000,
            channels: 2,
            bits_per_sample: 32,
        };
        assert!(matches!(format.check(), Err(ModemError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_stereo_to_mono() {
        let format = PcmFormat {
            sample_rate: 8000,
            channels: 2,
            bits_per_sample: 16,
        };
        let pcm = PcmBuffer::new(format, vec![16384, 0, -32768, -16384]);
        let mono = pcm.to_mono();

        assert_eq!(pcm.frames(), 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.25).abs() < 1e-6);
        assert!((mono[1] + 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_eight_bit_normalisation() {
        let pcm = PcmBuffer::new(PcmFormat::mono(8000, 8), vec![-128, 0, 64]);
        assert_eq!(pcm.to_mono(), vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_lengths() {
        let samples = vec![0.0f32; 4800];
        assert_eq!(resample(&samples, 48000, 44100).len(), 4410);
        assert_eq!(resample(&samples, 48000, 96000).len(), 9600);
    }

    #[test]
    fn test_resample_interpolates() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let upsampled = resample(&samples, 1, 2);
        assert_eq!(upsampled.len(), 8);
        assert!((upsampled[1] - 0.5).abs() < 1e-6);
        assert!((upsampled[5] + 0.5).abs() < 1e-6);
    }
}
