use crate::audio::{PcmBuffer, PcmFormat};
use crate::detect::Timing;
use crate::error::{ModemError, Result};
use crate::{ModemConfig, TransmissionMode};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::f64::consts::TAU;

/// Relative energy difference under which the two tones count as equal.
pub const AMBIGUITY_TOLERANCE: f32 = 1e-4;

pub const SPECTRUM_FFT_SIZE: usize = 4096;

/// One transmitted unit: a tone held for a fixed number of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Symbol {
    pub frequency: f32,
    pub duration: usize,
}

/// Bits of `bytes`, most significant bit first.
pub fn frame_bits(bytes: &[u8]) -> impl Iterator<Item = bool> + '_ {
    bytes
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
}

#[derive(Debug, Clone, Copy)]
pub struct LineEncoder {
    mode: TransmissionMode,
    samples_per_symbol: usize,
}

impl LineEncoder {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            mode: config.mode,
            samples_per_symbol: config.samples_per_symbol,
        }
    }

    pub fn symbol(&self, bit: bool) -> Symbol {
        Symbol {
            frequency: self.mode.frequency(bit),
            duration: self.samples_per_symbol,
        }
    }

    /// One symbol per frame bit, in transmission order.
    pub fn encode<'a>(&self, frame: &'a [u8]) -> impl Iterator<Item = Symbol> + 'a {
        let encoder = *self;
        frame_bits(frame).map(move |bit| encoder.symbol(bit))
    }
}

/// Render symbols into PCM. Phase carries over symbol boundaries so the
/// waveform has no discontinuities. `amplitude` is a fraction of full scale.
pub fn synthesize<I>(symbols: I, format: PcmFormat, amplitude: f32) -> Result<PcmBuffer>
where
    I: IntoIterator<Item = Symbol>,
{
    if !(0.0..=1.0).contains(&amplitude) {
        return Err(ModemError::AmplitudeOutOfRange(amplitude));
    }
    format.check()?;

    let peak = amplitude as f64 * format.full_scale() as f64;
    let sample_rate = format.sample_rate as f64;
    let channels = format.channels as usize;

    let mut samples = Vec::new();
    let mut phase = 0.0f64;

    for symbol in symbols {
        let step = TAU * symbol.frequency as f64 / sample_rate;
        samples.reserve(symbol.duration * channels);

        for _ in 0..symbol.duration {
            let value = (peak * phase.sin()).round() as i32;
            samples.extend(std::iter::repeat(value).take(channels));
            phase = (phase + step) % TAU;
        }
    }

    Ok(PcmBuffer::new(format, samples))
}

pub struct FskDemodulator {
    sample_rate: u32,
    zero_hz: f32,
    one_hz: f32,
    fft_planner: FftPlanner<f32>,
}

impl FskDemodulator {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            zero_hz: config.mode.zero_frequency(),
            one_hz: config.mode.one_frequency(),
            fft_planner: FftPlanner::new(),
        }
    }

    /// Single-frequency signal power over `samples`.
    pub fn goertzel(&self, samples: &[f32], target_freq: f32) -> f32 {
        let omega = 2.0 * PI * target_freq / self.sample_rate as f32;
        let coeff = 2.0 * omega.cos();

        let mut s1 = 0.0f32;
        let mut s2 = 0.0f32;

        for &sample in samples {
            let s0 = sample + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }

        (s1 * s1 + s2 * s2 - s1 * s2 * coeff).max(0.0)
    }

    /// Classify one symbol window. `None` when neither tone dominates.
    pub fn classify(&self, window: &[f32]) -> Option<bool> {
        let zero = self.goertzel(window, self.zero_hz);
        let one = self.goertzel(window, self.one_hz);
        let total = zero + one;

        if total <= f32::MIN_POSITIVE || (one - zero).abs() <= AMBIGUITY_TOLERANCE * total {
            None
        } else {
            Some(one > zero)
        }
    }

    /// Lazily classify consecutive symbol windows starting at the frame
    /// offset. The stream ends when the next window would run past the
    /// buffer.
    pub fn symbols<'a>(&'a self, samples: &'a [f32], timing: &Timing) -> SymbolStream<'a> {
        SymbolStream {
            demodulator: self,
            samples,
            timing: *timing,
            index: 0,
        }
    }

    pub fn analyze_spectrum(&mut self, samples: &[f32]) -> Vec<(f32, f32)> {
        let fft = self.fft_planner.plan_fft_forward(SPECTRUM_FFT_SIZE);

        let mut input: Vec<Complex<f32>> = samples
            .iter()
            .take(SPECTRUM_FFT_SIZE)
            .map(|&s| Complex::new(s, 0.0))
            .collect();
        input.resize(SPECTRUM_FFT_SIZE, Complex::new(0.0, 0.0));

        fft.process(&mut input);

        let freq_resolution = self.sample_rate as f32 / SPECTRUM_FFT_SIZE as f32;

        input
            .iter()
            .take(SPECTRUM_FFT_SIZE / 2)
            .enumerate()
            .map(|(i, c)| {
                let freq = i as f32 * freq_resolution;
                let magnitude = c.norm() / SPECTRUM_FFT_SIZE as f32;
                (freq, magnitude)
            })
            .collect()
    }

    /// Strongest spectral peaks, more than three FFT bins apart, loudest first.
    pub fn dominant_frequencies(&mut self, samples: &[f32], count: usize) -> Vec<f32> {
        let mut spectrum = self.analyze_spectrum(samples);
        let min_spacing = 3.0 * self.sample_rate as f32 / SPECTRUM_FFT_SIZE as f32;
        spectrum.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut peaks: Vec<f32> = Vec::with_capacity(count);
        for (freq, magnitude) in spectrum {
            if peaks.len() == count || magnitude <= 0.0 {
                break;
            }
            if peaks.iter().all(|&p| (p - freq).abs() > min_spacing) {
                peaks.push(freq);
            }
        }
        peaks
    }
}

pub struct SymbolStream<'a> {
    demodulator: &'a FskDemodulator,
    samples: &'a [f32],
    timing: Timing,
    index: usize,
}

impl Iterator for SymbolStream<'_> {
    type Item = Result<bool>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.timing.symbol_offset(self.index);
        let end = start + self.timing.window_len();
        if end > self.samples.len() {
            return None;
        }

        let index = self.index;
        self.index += 1;

        Some(
            self.demodulator
                .classify(&self.samples[start..end])
                .ok_or(ModemError::AmbiguousSymbol {
                    index,
                    offset: start,
                }),
        )
    }
}

/// Pack up to `count` bytes (MSB first) from a bit stream. Returns fewer
/// bytes when the stream ends early; the first classification error aborts.
pub fn read_bytes<I>(symbols: &mut I, count: usize) -> Result<Vec<u8>>
where
    I: Iterator<Item = Result<bool>>,
{
    let mut bytes = Vec::with_capacity(count);

    while bytes.len() < count {
        let mut byte = 0u8;
        for _ in 0..8 {
            match symbols.next() {
                Some(bit) => byte = (byte << 1) | bit? as u8,
                None => return Ok(bytes),
            }
        }
        bytes.push(byte);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing_at(frame_offset: usize, samples_per_symbol: usize) -> Timing {
        Timing {
            frame_offset,
            samples_per_symbol: samples_per_symbol as f64,
            score: 1.0,
        }
    }

    fn render(bits: &[u8], config: &ModemConfig) -> Vec<f32> {
        let encoder = LineEncoder::new(config);
        synthesize(encoder.encode(bits), config.pcm_format(), config.amplitude)
            .unwrap()
            .to_mono()
    }

    #[test]
    fn test_frame_bits_msb_first() {
        let bits: Vec<bool> = frame_bits(&[0b1010_0001]).collect();
        assert_eq!(
            bits,
            vec![true, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn test_line_encoder_symbols() {
        let config = ModemConfig::default();
        let symbols: Vec<Symbol> = LineEncoder::new(&config).encode(&[0x80, 0x01]).collect();

        assert_eq!(symbols.len(), 16);
        assert_eq!(symbols[0].frequency, config.mode.one_frequency());
        assert_eq!(symbols[1].frequency, config.mode.zero_frequency());
        assert_eq!(symbols[15].frequency, config.mode.one_frequency());
        assert!(symbols.iter().all(|s| s.duration == config.samples_per_symbol));
    }

    #[test]
    fn test_synthesize_length_and_peak() {
        let config = ModemConfig::default();
        let encoder = LineEncoder::new(&config);
        let pcm = synthesize(encoder.encode(&[0x5A, 0xC3]), config.pcm_format(), 1.0).unwrap();

        assert_eq!(pcm.samples.len(), 16 * config.samples_per_symbol);
        let peak = pcm.samples.iter().map(|s| s.abs()).max().unwrap();
        assert!(peak <= i16::MAX as i32);
        assert!(peak > (i16::MAX as i32) * 99 / 100);
    }

    #[test]
    fn test_synthesize_amplitude_out_of_range() {
        let format = PcmFormat::mono(44100, 16);
        let symbols = [Symbol {
            frequency: 1000.0,
            duration: 10,
        }];

        for amplitude in [1.5, -0.1, f32::NAN] {
            assert!(matches!(
                synthesize(symbols, format, amplitude),
                Err(ModemError::AmplitudeOutOfRange(_))
            ));
        }
    }

    #[test]
    fn test_synthesize_phase_continuous() {
        let config = ModemConfig::default();
        let samples = render(&[0x55, 0xAA, 0x0F], &config);

        // The steepest tone moves at most `amplitude * step` per sample; a
        // phase reset at a symbol boundary would exceed that.
        let step = 2.0 * PI * config.mode.one_frequency() / config.sample_rate as f32;
        let max_jump = config.amplitude * step * 1.01 + 1e-4;
        for pair in samples.windows(2) {
            assert!(
                (pair[1] - pair[0]).abs() <= max_jump,
                "jump {} exceeds {}",
                (pair[1] - pair[0]).abs(),
                max_jump
            );
        }
    }

    #[test]
    fn test_goertzel() {
        let config = ModemConfig::default();
        let demodulator = FskDemodulator::new(&config);

        let freq = 1200.0;
        let samples: Vec<f32> = (0..4410)
            .map(|i| (2.0 * PI * freq * i as f32 / config.sample_rate as f32).sin())
            .collect();

        let power = demodulator.goertzel(&samples, freq);
        assert!(power > 1000.0);

        let other_power = demodulator.goertzel(&samples, 2200.0);
        assert!(power > other_power * 100.0);
    }

    #[test]
    fn test_classify_silence_is_ambiguous() {
        let demodulator = FskDemodulator::new(&ModemConfig::default());
        assert_eq!(demodulator.classify(&[0.0; 441]), None);
    }

    #[test]
    fn test_demodulate_aligned_symbols() {
        let config = ModemConfig::default();
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let samples = render(&data, &config);

        let demodulator = FskDemodulator::new(&config);
        let timing = timing_at(0, config.samples_per_symbol);
        let mut symbols = demodulator.symbols(&samples, &timing);

        assert_eq!(read_bytes(&mut symbols, 4).unwrap(), data);
        assert!(symbols.next().is_none());
    }

    #[test]
    fn test_read_bytes_stops_at_end_of_buffer() {
        let config = ModemConfig::default();
        let samples = render(&[0x12, 0x34], &config);

        let demodulator = FskDemodulator::new(&config);
        let timing = timing_at(0, config.samples_per_symbol);
        let mut symbols = demodulator.symbols(&samples, &timing);

        assert_eq!(read_bytes(&mut symbols, 10).unwrap(), vec![0x12, 0x34]);
    }

    #[test]
    fn test_ambiguous_symbol_reports_position() {
        let config = ModemConfig::default();
        let mut samples = render(&[0xFF], &config);
        let sps = config.samples_per_symbol;
        samples.extend(vec![0.0; sps]);

        let demodulator = FskDemodulator::new(&config);
        let timing = timing_at(0, sps);
        let bits: Vec<Result<bool>> = demodulator.symbols(&samples, &timing).collect();

        assert_eq!(bits.len(), 9);
        assert!(bits[..8].iter().all(|b| matches!(b, Ok(true))));
        match &bits[8] {
            Err(ModemError::AmbiguousSymbol { index, offset }) => {
                assert_eq!(*index, 8);
                assert_eq!(*offset, 8 * sps);
            }
            other => panic!("Expected AmbiguousSymbol, got {:?}", other),
        }
    }

    #[test]
    fn test_dominant_frequencies() {
        let config = ModemConfig::default();
        let samples: Vec<f32> = (0..SPECTRUM_FFT_SIZE)
            .map(|i| {
                let t = i as f32 / config.sample_rate as f32;
                (2.0 * PI * 1200.0 * t).sin() + 0.5 * (2.0 * PI * 2200.0 * t).sin()
            })
            .collect();

        let mut demodulator = FskDemodulator::new(&config);
        let peaks = demodulator.dominant_frequencies(&samples, 2);

        assert_eq!(peaks.len(), 2);
        assert!((peaks[0] - 1200.0).abs() < 15.0, "peaks: {:?}", peaks);
        assert!((peaks[1] - 2200.0).abs() < 15.0, "peaks: {:?}", peaks);
    }
}
