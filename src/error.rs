use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModemError {
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Amplitude out of range: {0} (must be within 0.0..=1.0)")]
    AmplitudeOutOfRange(f32),

    #[error("Invalid WAV container at byte {offset}: {reason}")]
    InvalidContainer { offset: usize, reason: String },

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("Truncated WAV container: data chunk declares {declared} bytes, {available} available")]
    TruncatedContainer { declared: usize, available: usize },

    #[error("No preamble found in {scanned} samples (best agreement {best_score:.2})")]
    NotFound { scanned: usize, best_score: f32 },

    #[error("Ambiguous symbol {index} at sample {offset}")]
    AmbiguousSymbol { index: usize, offset: usize },

    #[error("Preamble mismatch at frame byte {offset}")]
    PreambleMismatch { offset: usize },

    #[error("Truncated frame: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Checksum mismatch: frame carries {expected:#x}, computed {computed:#x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ModemError {
    /// Short human-readable category, stable across error details.
    pub fn category(&self) -> &'static str {
        match self {
            ModemError::PayloadTooLarge { .. } => "payload too large",
            ModemError::AmplitudeOutOfRange(_) => "amplitude out of range",
            ModemError::InvalidContainer { .. } => "invalid container",
            ModemError::UnsupportedFormat(_) => "unsupported format",
            ModemError::TruncatedContainer { .. } => "truncated container",
            ModemError::NotFound { .. } => "no signal",
            ModemError::AmbiguousSymbol { .. } => "ambiguous symbol",
            ModemError::PreambleMismatch { .. } => "preamble mismatch",
            ModemError::Truncated { .. } => "truncated frame",
            ModemError::ChecksumMismatch { .. } => "checksum mismatch",
            ModemError::InvalidConfig(_) => "invalid configuration",
            ModemError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, ModemError>;
