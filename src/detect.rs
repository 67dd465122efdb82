use crate::error::{ModemError, Result};
use crate::modulation::frame_bits;
use crate::ModemConfig;
use rustfft::num_complex::Complex;
use std::f64::consts::TAU;
use std::ops::Range;

/// Granularity of the symbol-period search, in samples.
const PERIOD_STEP: f64 = 0.1;

/// Score gain required before a drifted timing replaces the nominal one.
const REFINE_MARGIN: f64 = 1e-6;

/// Symbol timing established from the preamble.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Sample at which the first preamble symbol starts.
    pub frame_offset: usize,
    pub samples_per_symbol: f64,
    /// Mean agreement between received windows and the preamble pattern.
    pub score: f32,
}

impl Timing {
    pub fn symbol_offset(&self, index: usize) -> usize {
        self.frame_offset + (index as f64 * self.samples_per_symbol).round() as usize
    }

    pub fn window_len(&self) -> usize {
        self.samples_per_symbol.round() as usize
    }

    /// First sample after a preamble of `preamble_bits` symbols.
    pub fn data_offset(&self, preamble_bits: usize) -> usize {
        self.symbol_offset(preamble_bits)
    }
}

/// Prefix sums are kept for this many preamble spans at a time.
const CHUNK_SPANS: usize = 4;

/// Samples needed to score one preamble alignment at the longest period
/// the drift search may try.
fn preamble_span(config: &ModemConfig) -> usize {
    let nominal = config.samples_per_symbol as f64;
    let longest = (nominal * (1.0 + config.detection.drift_tolerance as f64)).ceil() as usize;
    (config.preamble.len() * 8 + 1) * longest
}

/// Running sums of the signal mixed down by each tone, so the tone energy
/// of any window is a single subtraction.
///
/// Only one chunk of the buffer is held in prefix-sum form; it is rebuilt
/// whenever a query leaves it, so memory stays proportional to the
/// preamble length rather than the recording length.
pub struct ToneCorrelator<'a> {
    samples: &'a [f32],
    zero_cycles: f64,
    one_cycles: f64,
    chunk_len: usize,
    base: usize,
    zero: Vec<Complex<f64>>,
    one: Vec<Complex<f64>>,
}

impl<'a> ToneCorrelator<'a> {
    pub fn new(samples: &'a [f32], config: &ModemConfig) -> Self {
        let sample_rate = config.sample_rate as f64;
        Self {
            samples,
            zero_cycles: config.mode.zero_frequency() as f64 / sample_rate,
            one_cycles: config.mode.one_frequency() as f64 / sample_rate,
            chunk_len: (CHUNK_SPANS * preamble_span(config)).max(1),
            base: 0,
            zero: Vec::new(),
            one: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample range currently held in prefix-sum form.
    pub fn chunk(&self) -> Range<usize> {
        self.base..self.base + self.zero.len().saturating_sub(1)
    }

    /// Make sure `start..end` lies inside the current chunk.
    fn cover(&mut self, start: usize, end: usize) {
        let chunk = self.chunk();
        if start >= chunk.start && end <= chunk.end {
            return;
        }

        let stop = end.max(start + self.chunk_len).min(self.samples.len());
        let samples = &self.samples[start..stop];
        prefix_sums(&mut self.zero, samples, start, self.zero_cycles);
        prefix_sums(&mut self.one, samples, start, self.one_cycles);
        self.base = start;
    }

    /// Energies of the zero and one tones over `len` samples at `start`.
    ///
    /// Panics if the window runs past the end of the buffer.
    pub fn energies(&mut self, start: usize, len: usize) -> (f64, f64) {
        let end = start + len;
        self.cover(start, end);

        let (from, to) = (start - self.base, end - self.base);
        (
            (self.zero[to] - self.zero[from]).norm_sqr(),
            (self.one[to] - self.one[from]).norm_sqr(),
        )
    }

    /// Soft decision in [-1, 1], positive for the one tone. Windows whose
    /// dominant tone amplitude is below `gate` carry no evidence.
    pub fn soft_bit(&mut self, start: usize, len: usize, gate: f64) -> f64 {
        let (zero, one) = self.energies(start, len);
        let amplitude = 2.0 * zero.max(one).sqrt() / len as f64;
        if amplitude < gate {
            return 0.0;
        }
        (one - zero) / (one + zero)
    }
}

fn prefix_sums(sums: &mut Vec<Complex<f64>>, samples: &[f32], first: usize, cycles_per_sample: f64) {
    sums.clear();
    sums.reserve(samples.len() + 1);

    let mut acc = Complex::new(0.0, 0.0);
    sums.push(acc);
    for (n, &sample) in samples.iter().enumerate() {
        let phase = TAU * ((first + n) as f64 * cycles_per_sample).fract();
        acc += Complex::from_polar(sample as f64, -phase);
        sums.push(acc);
    }
}

struct PreambleMatcher<'a> {
    correlator: ToneCorrelator<'a>,
    pattern: Vec<f64>,
    gate: f64,
}

impl PreambleMatcher<'_> {
    /// Mean agreement with the preamble for a frame starting at `offset`,
    /// or `None` if the preamble would not fit in the buffer.
    fn score(&mut self, offset: usize, period: f64) -> Option<f64> {
        let window = period.round() as usize;
        if window == 0 || self.pattern.is_empty() {
            return None;
        }
        let last_start = offset + ((self.pattern.len() - 1) as f64 * period).round() as usize;
        if last_start + window > self.correlator.len() {
            return None;
        }
        self.correlator.cover(offset, last_start + window);

        let mut sum = 0.0;
        for (bit, &sign) in self.pattern.iter().enumerate() {
            let start = offset + (bit as f64 * period).round() as usize;
            sum += sign * self.correlator.soft_bit(start, window, self.gate);
        }

        Some(sum / self.pattern.len() as f64)
    }
}

/// A sample offset at which the preamble agreement reaches the lock score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub offset: usize,
    pub score: f32,
}

/// Lazy per-sample scan for preamble candidates at the nominal period.
pub struct PreambleScanner<'a> {
    matcher: PreambleMatcher<'a>,
    period: f64,
    threshold: f64,
    next: usize,
    best_score: f64,
}

impl<'a> PreambleScanner<'a> {
    pub fn new(samples: &'a [f32], config: &ModemConfig) -> Self {
        let pattern = frame_bits(&config.preamble)
            .map(|bit| if bit { 1.0 } else { -1.0 })
            .collect();

        Self {
            matcher: PreambleMatcher {
                correlator: ToneCorrelator::new(samples, config),
                pattern,
                gate: config.detection.min_amplitude as f64,
            },
            period: config.samples_per_symbol as f64,
            threshold: config.detection.lock_score as f64,
            next: 0,
            best_score: 0.0,
        }
    }

    /// Highest agreement seen so far, whether or not it reached the lock score.
    pub fn best_score(&self) -> f32 {
        self.best_score as f32
    }

    /// Number of offsets examined so far.
    pub fn scanned(&self) -> usize {
        self.next
    }

    /// Sample range the scanner currently holds prefix sums for.
    pub fn chunk(&self) -> Range<usize> {
        self.matcher.correlator.chunk()
    }
}

impl Iterator for PreambleScanner<'_> {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        while let Some(score) = self.matcher.score(self.next, self.period) {
            let offset = self.next;
            self.next += 1;
            self.best_score = self.best_score.max(score);

            if score >= self.threshold {
                return Some(Candidate {
                    offset,
                    score: score as f32,
                });
            }
        }
        None
    }
}

/// Locate the frame preamble and establish symbol timing.
///
/// The first offset whose agreement reaches the lock score sits on the
/// rising edge of the correlation peak, so the peak is searched within the
/// following symbol. The period is then refined within the drift tolerance.
pub fn detect_preamble(samples: &[f32], config: &ModemConfig) -> Result<Timing> {
    let mut scanner = PreambleScanner::new(samples, config);

    let Some(first) = scanner.next() else {
        log::debug!(
            "No preamble in {} samples, best agreement {:.3}",
            samples.len(),
            scanner.best_score()
        );
        return Err(ModemError::NotFound {
            scanned: samples.len(),
            best_score: scanner.best_score(),
        });
    };
    log::debug!(
        "Preamble candidate at sample {} (agreement {:.3})",
        first.offset,
        first.score
    );

    let matcher = &mut scanner.matcher;
    let nominal = config.samples_per_symbol as f64;

    let mut peak = (first.offset, first.score as f64);
    for offset in first.offset + 1..first.offset + config.samples_per_symbol {
        match matcher.score(offset, nominal) {
            Some(score) if score > peak.1 => peak = (offset, score),
            Some(_) => {}
            None => break,
        }
    }

    let timing = refine(matcher, peak.0, peak.1, config);
    log::info!(
        "Locked at sample {} with {:.2} samples/symbol (agreement {:.3})",
        timing.frame_offset,
        timing.samples_per_symbol,
        timing.score
    );

    Ok(timing)
}

fn refine(
    matcher: &mut PreambleMatcher<'_>,
    offset: usize,
    score: f64,
    config: &ModemConfig,
) -> Timing {
    let nominal = config.samples_per_symbol as f64;
    let steps = (nominal * config.detection.drift_tolerance as f64 / PERIOD_STEP).floor() as i64;
    let max_shift = config.samples_per_symbol / 8;

    let mut best = (offset, nominal, score);
    for step in -steps..=steps {
        let period = nominal + step as f64 * PERIOD_STEP;
        for candidate in offset.saturating_sub(max_shift)..=offset + max_shift {
            if let Some(s) = matcher.score(candidate, period) {
                if s > best.2 + REFINE_MARGIN {
                    best = (candidate, period, s);
                }
            }
        }
    }

    Timing {
        frame_offset: best.0,
        samples_per_symbol: best.1,
        score: best.2 as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modulation::FskDemodulator;

    fn render(payload: &[u8], config: &ModemConfig) -> Vec<f32> {
        crate::encode_pcm(payload, config).unwrap().to_mono()
    }

    #[test]
    fn test_correlator_matches_goertzel() {
        let config = ModemConfig::default();
        let samples = render(b"energy", &config);
        let mut correlator = ToneCorrelator::new(&samples, &config);
        let demodulator = FskDemodulator::new(&config);

        for start in [0, 441, 1000, 5000] {
            let window = &samples[start..start + 441];
            let (zero, one) = correlator.energies(start, 441);
            let g_zero = demodulator.goertzel(window, config.mode.zero_frequency()) as f64;
            let g_one = demodulator.goertzel(window, config.mode.one_frequency()) as f64;

            let scale = zero.max(one);
            assert!((zero - g_zero).abs() <= 1e-3 * scale, "{} vs {}", zero, g_zero);
            assert!((one - g_one).abs() <= 1e-3 * scale, "{} vs {}", one, g_one);
        }
    }

    #[test]
    fn test_detect_at_start() {
        let config = ModemConfig::default();
        let samples = render(b"timing", &config);
        let timing = detect_preamble(&samples, &config).unwrap();

        assert_eq!(timing.frame_offset, 0);
        assert_eq!(timing.samples_per_symbol, 441.0);
        assert!(timing.score > 0.95);
        assert_eq!(timing.data_offset(32), 32 * 441);
    }

    #[test]
    fn test_detect_after_silence() {
        let config = ModemConfig::default();
        let mut samples = vec![0.0f32; 1234];
        samples.extend(render(b"offset", &config));

        let timing = detect_preamble(&samples, &config).unwrap();
        assert_eq!(timing.frame_offset, 1234);
        assert_eq!(timing.window_len(), 441);
    }

    #[test]
    fn test_silence_not_found() {
        let config = ModemConfig::default();
        let samples = vec![0.0f32; 44100];

        match detect_preamble(&samples, &config) {
            Err(ModemError::NotFound {
                scanned,
                best_score,
            }) => {
                assert_eq!(scanned, 44100);
                assert_eq!(best_score, 0.0);
            }
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_short_buffer_not_found() {
        let config = ModemConfig::default();
        let samples = render(b"", &config);
        let cut = &samples[..20 * config.samples_per_symbol];
        assert!(matches!(
            detect_preamble(cut, &config),
            Err(ModemError::NotFound { .. })
        ));
    }

    #[test]
    fn test_quiet_noise_not_found() {
        let config = ModemConfig::default();
        let mut state = 98765u32;
        let samples: Vec<f32> = (0..44100)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                ((state >> 16) as f32 / 65536.0 - 0.5) * 0.05
            })
            .collect();

        assert!(matches!(
            detect_preamble(&samples, &config),
            Err(ModemError::NotFound { .. })
        ));
    }

    #[test]
    fn test_scanner_candidates_precede_peak() {
        let config = ModemConfig::default();
        let mut samples = vec![0.0f32; 2000];
        samples.extend(render(b"lazy", &config));

        let mut scanner = PreambleScanner::new(&samples, &config);
        let first = scanner.next().unwrap();

        assert!(first.offset <= 2000);
        assert!(first.offset + config.samples_per_symbol > 2000);
        assert!(first.score >= config.detection.lock_score);
        assert_eq!(scanner.scanned(), first.offset + 1);
    }

    #[test]
    fn test_refines_drifted_period() {
        let sent = ModemConfig {
            samples_per_symbol: 444,
            ..Default::default()
        };
        let mut samples = vec![0.0f32; 500];
        samples.extend(render(b"drift", &sent));

        let config = ModemConfig::default();
        let timing = detect_preamble(&samples, &config).unwrap();

        assert!(
            (timing.samples_per_symbol - 444.0).abs() < 0.5,
            "period {}",
            timing.samples_per_symbol
        );
        assert!((timing.frame_offset as i64 - 500).abs() <= 4, "offset {}", timing.frame_offset);
    }

    #[test]
    fn test_correlator_holds_one_chunk() {
        let config = ModemConfig::default();
        let samples = render(&[0x5A; 200], &config);
        let mut correlator = ToneCorrelator::new(&samples, &config);
        let demodulator = FskDemodulator::new(&config);
        let limit = CHUNK_SPANS * preamble_span(&config);
        assert!(limit < samples.len() / 2);

        for start in [0, 300_000, 12_345, samples.len() - 441] {
            let (zero, one) = correlator.energies(start, 441);
            let chunk = correlator.chunk();
            assert!(chunk.contains(&start));
            assert!(chunk.len() <= limit, "chunk {:?}", chunk);

            let window = &samples[start..start + 441];
            let g_zero = demodulator.goertzel(window, config.mode.zero_frequency()) as f64;
            let g_one = demodulator.goertzel(window, config.mode.one_frequency()) as f64;
            let scale = zero.max(one);
            assert!((zero - g_zero).abs() <= 1e-3 * scale, "{} vs {}", zero, g_zero);
            assert!((one - g_one).abs() <= 1e-3 * scale, "{} vs {}", one, g_one);
        }
    }

    #[test]
    fn test_long_lead_in_keeps_chunk_bounded() {
        let config = ModemConfig::default();
        let mut samples = vec![0.0f32; 20 * 44100];
        samples.extend(render(b"late", &config));

        let mut scanner = PreambleScanner::new(&samples, &config);
        let first = scanner.next().unwrap();
        assert!(first.offset <= 20 * 44100);
        assert!(scanner.chunk().len() <= CHUNK_SPANS * preamble_span(&config));

        let timing = detect_preamble(&samples, &config).unwrap();
        assert_eq!(timing.frame_offset, 20 * 44100);
        assert_eq!(timing.samples_per_symbol, 441.0);
    }
}
