use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use wav_modem_core::{
    detect_preamble, encode_pcm, modem_samples, read_wav, write_wav, Checksum, FskDemodulator,
    ModemConfig, ModemError, TransmissionMode,
};

#[derive(Parser)]
#[command(name = "wav-modem")]
#[command(about = "Encode data into WAV audio and decode it back", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModemArgs {
    /// Use the ultrasonic tone pair (18 kHz / 19 kHz)
    #[arg(long, short)]
    ultrasonic: bool,

    /// Symbols per second
    #[arg(long, default_value = "100")]
    baud: u32,

    /// Modem sample rate in Hz
    #[arg(long, default_value = "44100")]
    sample_rate: u32,

    /// Protect frames with CRC-16 instead of CRC-32
    #[arg(long)]
    crc16: bool,
}

impl ModemArgs {
    fn config(&self) -> ModemConfig {
        ModemConfig {
            mode: if self.ultrasonic {
                TransmissionMode::Ultrasonic
            } else {
                TransmissionMode::Audible
            },
            sample_rate: self.sample_rate,
            checksum: if self.crc16 {
                Checksum::Crc16
            } else {
                Checksum::Crc32
            },
            ..Default::default()
        }
        .with_baud(self.baud)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Encode data into a WAV file
    Encode {
        #[command(flatten)]
        modem: ModemArgs,

        /// Amplitude as a fraction of full scale (0.0 - 1.0)
        #[arg(long, default_value = "0.5")]
        amplitude: f32,

        /// Bits per sample of the generated WAV (8, 16, 24 or 32)
        #[arg(long, default_value = "16")]
        bits: u16,

        /// Data to encode (if not provided, reads from stdin)
        #[arg(short, long)]
        data: Option<String>,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },

    /// Decode a WAV file back into data
    Decode {
        #[command(flatten)]
        modem: ModemArgs,

        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Write the payload to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the format, timing lock and dominant tones of a WAV file
    Inspect {
        #[command(flatten)]
        modem: ModemArgs,

        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode {
            modem,
            amplitude,
            bits,
            data,
            output,
        } => {
            let input_data = match data {
                Some(d) => d.into_bytes(),
                None => {
                    let mut buffer = Vec::new();
                    io::stdin().read_to_end(&mut buffer)?;
                    buffer
                }
            };

            let config = ModemConfig {
                amplitude,
                bits_per_sample: bits,
                ..modem.config()
            };

            encode_file(&input_data, &config, &output)?;
        }

        Commands::Decode {
            modem,
            input,
            output,
        } => match decode_file(&input, &modem.config()) {
            Ok(data) => match output {
                Some(path) => {
                    std::fs::write(&path, &data)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    io::stdout().write_all(&data)?;
                    io::stdout().flush()?;
                }
            },
            Err(err) => {
                match err.downcast_ref::<ModemError>() {
                    Some(modem_err) => {
                        eprintln!("Decode failed ({}): {}", modem_err.category(), modem_err)
                    }
                    None => eprintln!("Decode failed: {:#}", err),
                }
                std::process::exit(1);
            }
        },

        Commands::Inspect { modem, input } => {
            inspect_file(&input, &modem.config())?;
        }
    }

    Ok(())
}

fn encode_file(data: &[u8], config: &ModemConfig, output: &Path) -> Result<()> {
    eprintln!("Preparing to encode {} bytes...", data.len());

    let pcm = encode_pcm(data, config)?;
    eprintln!(
        "Symbols: {} at {:.1} baud",
        pcm.frames() / config.samples_per_symbol,
        config.baud_rate()
    );
    eprintln!("Audio duration: {:.2} s", pcm.duration_secs());

    let wav = write_wav(&pcm)?;
    std::fs::write(output, &wav).with_context(|| format!("writing {}", output.display()))?;
    eprintln!("Wrote {} bytes to {}", wav.len(), output.display());

    Ok(())
}

fn decode_file(input: &Path, config: &ModemConfig) -> Result<Vec<u8>> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    eprintln!("Read {} bytes from {}", bytes.len(), input.display());

    let data = wav_modem_core::decode(&bytes, config)?;
    eprintln!("Decoded {} bytes", data.len());

    Ok(data)
}

fn inspect_file(input: &Path, config: &ModemConfig) -> Result<()> {
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let pcm = read_wav(&bytes)?;

    println!(
        "Format: {} Hz, {} channel(s), {} bit",
        pcm.format.sample_rate, pcm.format.channels, pcm.format.bits_per_sample
    );
    println!("Duration: {:.2} s ({} frames)", pcm.duration_secs(), pcm.frames());

    let samples = modem_samples(&pcm, config)?;

    let start = match detect_preamble(&samples, config) {
        Ok(timing) => {
            println!(
                "Preamble: sample {} ({:.3} s), {:.2} samples/symbol, agreement {:.2}",
                timing.frame_offset,
                timing.frame_offset as f32 / config.sample_rate as f32,
                timing.samples_per_symbol,
                timing.score
            );
            timing.frame_offset
        }
        Err(err) => {
            println!("Preamble: none ({})", err);
            0
        }
    };

    let mut demodulator = FskDemodulator::new(config);
    let peaks = demodulator.dominant_frequencies(&samples[start.min(samples.len())..], 3);
    let peaks: Vec<String> = peaks.iter().map(|f| format!("{:.0} Hz", f)).collect();
    println!("Dominant tones: {}", peaks.join(", "));

    match wav_modem_core::decode_pcm(&pcm, config) {
        Ok(payload) => println!("Payload: {} bytes", payload.len()),
        Err(err) => println!("Payload: undecodable ({})", err.category()),
    }

    Ok(())
}
