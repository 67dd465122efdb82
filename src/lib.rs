//! Audio data modem: binary FSK over PCM / WAV.
//!
//! Encoding turns a byte payload into a self-delimiting frame, maps every
//! frame bit to one of two tones and renders them phase-continuously into a
//! PCM buffer. Decoding locks onto the frame preamble, classifies each symbol
//! window with Goertzel energy detection and validates the frame checksum.
//!
//! ```
//! use wav_modem_core::{decode, encode, ModemConfig};
//!
//! let config = ModemConfig::default();
//! let wav = encode(b"hello", &config).unwrap();
//! assert_eq!(decode(&wav, &config).unwrap(), b"hello");
//! ```

pub mod protocol;
pub mod modulation;
pub mod detect;
pub mod audio;
pub mod wav;
pub mod error;

pub use protocol::*;
pub use modulation::*;
pub use detect::*;
pub use audio::*;
pub use wav::*;
pub use error::*;

pub const SAMPLE_RATE: u32 = 44100;
pub const DEFAULT_SAMPLES_PER_SYMBOL: usize = 441;
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;
pub const DEFAULT_AMPLITUDE: f32 = 0.5;

/// Shortest symbol window the demodulator can classify.
pub const MIN_SAMPLES_PER_SYMBOL: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransmissionMode {
    Audible,
    Ultrasonic,
    Custom { zero_hz: f32, one_hz: f32 },
}

impl TransmissionMode {
    /// Tone used for a 0 bit.
    pub fn zero_frequency(&self) -> f32 {
        match self {
            TransmissionMode::Audible => 1200.0,
            TransmissionMode::Ultrasonic => 18000.0,
            TransmissionMode::Custom { zero_hz, .. } => *zero_hz,
        }
    }

    /// Tone used for a 1 bit.
    pub fn one_frequency(&self) -> f32 {
        match self {
            TransmissionMode::Audible => 2200.0,
            TransmissionMode::Ultrasonic => 19000.0,
            TransmissionMode::Custom { one_hz, .. } => *one_hz,
        }
    }

    pub fn frequency(&self, bit: bool) -> f32 {
        if bit {
            self.one_frequency()
        } else {
            self.zero_frequency()
        }
    }
}

/// Thresholds used by the signal detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionConfig {
    /// Noise gate: windows whose dominant tone is quieter than this fraction
    /// of full scale carry no preamble evidence.
    pub min_amplitude: f32,
    /// Minimum mean agreement (0..=1) between the received windows and the
    /// preamble bit pattern before the detector locks.
    pub lock_score: f32,
    /// Relative symbol-period range searched around the nominal period.
    pub drift_tolerance: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_amplitude: 0.01,
            lock_score: 0.6,
            drift_tolerance: 0.01,
        }
    }
}

/// Parameters shared by encoder and decoder. Both sides must agree on every
/// field except `amplitude` for a round trip to succeed.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub mode: TransmissionMode,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub samples_per_symbol: usize,
    pub amplitude: f32,
    pub preamble: Vec<u8>,
    pub checksum: Checksum,
    pub detection: DetectionConfig,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            mode: TransmissionMode::Audible,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
            samples_per_symbol: DEFAULT_SAMPLES_PER_SYMBOL,
            amplitude: DEFAULT_AMPLITUDE,
            preamble: DEFAULT_PREAMBLE.to_vec(),
            checksum: Checksum::Crc32,
            detection: DetectionConfig::default(),
        }
    }
}

impl ModemConfig {
    /// Set the symbol length from a baud rate at the current sample rate.
    /// A baud rate of zero yields a zero symbol length, which `validate`
    /// rejects.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.samples_per_symbol = self.sample_rate.checked_div(baud).unwrap_or(0) as usize;
        self
    }

    pub fn baud_rate(&self) -> f32 {
        self.sample_rate as f32 / self.samples_per_symbol as f32
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::mono(self.sample_rate, self.bits_per_sample)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(ModemError::InvalidConfig(reason));

        if self.sample_rate == 0 {
            return invalid("sample rate must be non-zero".into());
        }
        if self.samples_per_symbol < MIN_SAMPLES_PER_SYMBOL {
            return invalid(format!(
                "{} samples per symbol is below the minimum of {}",
                self.samples_per_symbol, MIN_SAMPLES_PER_SYMBOL
            ));
        }

        let nyquist = self.sample_rate as f32 / 2.0;
        let zero = self.mode.zero_frequency();
        let one = self.mode.one_frequency();
        for freq in [zero, one] {
            if !(freq > 0.0 && freq < nyquist) {
                return invalid(format!("tone {} Hz outside 0..{} Hz", freq, nyquist));
            }
        }

        let bin_width = self.sample_rate as f32 / self.samples_per_symbol as f32;
        if (one - zero).abs() < bin_width {
            return invalid(format!(
                "tones {} Hz and {} Hz are closer than one analysis bin ({} Hz)",
                zero, one, bin_width
            ));
        }

        if !SUPPORTED_BITS_PER_SAMPLE.contains(&self.bits_per_sample) {
            return invalid(format!("{} bits per sample", self.bits_per_sample));
        }
        if self.preamble.is_empty() {
            return invalid("preamble must not be empty".into());
        }

        let detection = &self.detection;
        if !(detection.min_amplitude > 0.0 && detection.min_amplitude <= 1.0) {
            return invalid(format!("noise gate {} outside (0, 1]", detection.min_amplitude));
        }
        if !(detection.lock_score > 0.0 && detection.lock_score <= 1.0) {
            return invalid(format!("lock score {} outside (0, 1]", detection.lock_score));
        }
        if !(0.0..0.5).contains(&detection.drift_tolerance) {
            return invalid(format!(
                "drift tolerance {} outside [0, 0.5)",
                detection.drift_tolerance
            ));
        }

        Ok(())
    }
}

/// Frame, line-encode and synthesize a payload into a mono PCM buffer.
pub fn encode_pcm(payload: &[u8], config: &ModemConfig) -> Result<PcmBuffer> {
    config.validate()?;

    let frame = protocol::frame(payload, config)?;
    log::debug!("Framed {} payload bytes into {} frame bytes", payload.len(), frame.len());

    let encoder = LineEncoder::new(config);
    let pcm = synthesize(encoder.encode(&frame), config.pcm_format(), config.amplitude)?;
    log::debug!(
        "Synthesized {} symbols into {} samples",
        frame.len() * 8,
        pcm.samples.len()
    );

    Ok(pcm)
}

/// Encode a payload into a complete WAV file image.
pub fn encode(payload: &[u8], config: &ModemConfig) -> Result<Vec<u8>> {
    let pcm = encode_pcm(payload, config)?;
    write_wav(&pcm)
}

/// Recover a payload from PCM samples. The buffer may be multi-channel or
/// recorded at a different sample rate; it is mixed down and resampled to
/// the modem rate first.
pub fn decode_pcm(pcm: &PcmBuffer, config: &ModemConfig) -> Result<Vec<u8>> {
    config.validate()?;
    let samples = modem_samples(pcm, config)?;

    let timing = detect_preamble(&samples, config)?;

    let demodulator = FskDemodulator::new(config);
    let mut symbols = demodulator.symbols(&samples, &timing);

    let header_len = protocol::header_len(config);
    let mut frame = read_bytes(&mut symbols, header_len)?;
    let total_len = protocol::frame_len(&frame, config)?;
    frame.extend(read_bytes(&mut symbols, total_len - header_len)?);
    log::debug!("Demodulated {} frame bytes", frame.len());

    protocol::deframe(&frame, config)
}

/// Mix a PCM buffer down to mono at the modem sample rate.
///
/// Recordings whose Nyquist frequency does not reach the higher tone cannot
/// carry a transmission and are rejected before resampling.
pub fn modem_samples(pcm: &PcmBuffer, config: &ModemConfig) -> Result<Vec<f32>> {
    pcm.format.check()?;

    let samples = pcm.to_mono();
    let from_rate = pcm.format.sample_rate;
    if from_rate == config.sample_rate {
        return Ok(samples);
    }

    let highest_tone = config.mode.zero_frequency().max(config.mode.one_frequency());
    if from_rate as f32 / 2.0 <= highest_tone {
        return Err(ModemError::UnsupportedFormat(format!(
            "{} Hz recording cannot carry a {} Hz tone",
            from_rate, highest_tone
        )));
    }

    log::warn!(
        "Resampling input from {} Hz to {} Hz",
        from_rate,
        config.sample_rate
    );
    Ok(resample(&samples, from_rate, config.sample_rate))
}

/// Recover a payload from a WAV file image.
pub fn decode(wav_bytes: &[u8], config: &ModemConfig) -> Result<Vec<u8>> {
    let pcm = read_wav(wav_bytes)?;
    decode_pcm(&pcm, config)
}
