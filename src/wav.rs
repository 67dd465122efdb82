use crate::audio::{PcmBuffer, PcmFormat};
use crate::error::{ModemError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::Write;

pub const WAV_HEADER_SIZE: usize = 44;

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const FMT_CHUNK_SIZE: u32 = 16;

/// Serialize PCM samples into a canonical 44-byte-header WAV image.
pub fn write_wav(pcm: &PcmBuffer) -> Result<Vec<u8>> {
    let format = pcm.format;
    format.check()?;
    if pcm.samples.len() % format.channels as usize != 0 {
        return Err(ModemError::UnsupportedFormat(format!(
            "{} samples do not divide into {}-channel frames",
            pcm.samples.len(),
            format.channels
        )));
    }

    let data_size = pcm.samples.len() * format.bytes_per_sample() as usize;
    if data_size > (u32::MAX - 36) as usize {
        return Err(ModemError::UnsupportedFormat(format!(
            "{} data bytes exceed the RIFF size limit",
            data_size
        )));
    }

    let mut out = Vec::with_capacity(WAV_HEADER_SIZE + data_size);
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(36 + data_size as u32)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(FMT_CHUNK_SIZE)?;
    out.write_u16::<LittleEndian>(WAVE_FORMAT_PCM)?;
    out.write_u16::<LittleEndian>(format.channels)?;
    out.write_u32::<LittleEndian>(format.sample_rate)?;
    out.write_u32::<LittleEndian>(format.byte_rate() as u32)?;
    out.write_u16::<LittleEndian>(format.block_align())?;
    out.write_u16::<LittleEndian>(format.bits_per_sample)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_size as u32)?;

    let max = format.full_scale();
    let min = -max - 1;
    for &sample in &pcm.samples {
        let sample = sample.clamp(min, max);
        match format.bits_per_sample {
            8 => out.write_u8((sample + 128) as u8)?,
            16 => out.write_i16::<LittleEndian>(sample as i16)?,
            24 => out.write_i24::<LittleEndian>(sample)?,
            _ => out.write_i32::<LittleEndian>(sample)?,
        }
    }

    log::debug!(
        "Wrote WAV: {} Hz, {} ch, {} bit, {} data bytes",
        format.sample_rate,
        format.channels,
        format.bits_per_sample,
        data_size
    );

    Ok(out)
}

/// Parse a WAV image into PCM samples. Unknown chunks are skipped.
pub fn read_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    if bytes.len() < 12 {
        return Err(invalid(0, "shorter than a RIFF header"));
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(invalid(0, "missing RIFF marker"));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(invalid(8, "missing WAVE marker"));
    }

    let riff_size = LittleEndian::read_u32(&bytes[4..8]) as usize;
    if riff_size + 8 != bytes.len() {
        log::warn!(
            "RIFF size {} disagrees with {} byte buffer",
            riff_size,
            bytes.len()
        );
    }

    let mut format = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = LittleEndian::read_u32(&bytes[offset + 4..offset + 8]) as usize;
        let body = offset + 8;
        let available = bytes.len() - body;

        match id {
            b"fmt " => {
                if size > available {
                    return Err(invalid(offset, "fmt chunk runs past the end of the buffer"));
                }
                format = Some(parse_fmt(&bytes[body..body + size], offset)?);
            }
            b"data" => {
                let format =
                    format.ok_or_else(|| invalid(offset, "data chunk precedes fmt chunk"))?;
                if size > available {
                    return Err(ModemError::TruncatedContainer {
                        declared: size,
                        available,
                    });
                }
                return parse_samples(&bytes[body..body + size], format, offset);
            }
            _ => {
                log::warn!(
                    "Skipping unknown chunk {:?} ({} bytes) at byte {}",
                    String::from_utf8_lossy(id),
                    size,
                    offset
                );
            }
        }

        offset = body.saturating_add(size).saturating_add(size & 1);
    }

    Err(invalid(offset.min(bytes.len()), "no data chunk"))
}

fn invalid(offset: usize, reason: &str) -> ModemError {
    ModemError::InvalidContainer {
        offset,
        reason: reason.to_string(),
    }
}

fn parse_fmt(body: &[u8], offset: usize) -> Result<PcmFormat> {
    if body.len() < FMT_CHUNK_SIZE as usize {
        return Err(invalid(offset, "fmt chunk shorter than 16 bytes"));
    }

    let mut tag = LittleEndian::read_u16(&body[0..2]);
    let channels = LittleEndian::read_u16(&body[2..4]);
    let sample_rate = LittleEndian::read_u32(&body[4..8]);
    let byte_rate = LittleEndian::read_u32(&body[8..12]);
    let block_align = LittleEndian::read_u16(&body[12..14]);
    let bits_per_sample = LittleEndian::read_u16(&body[14..16]);

    // Extensible headers carry the real format tag at the head of the sub-format GUID.
    if tag == WAVE_FORMAT_EXTENSIBLE && body.len() >= 26 {
        tag = LittleEndian::read_u16(&body[24..26]);
    }
    if tag != WAVE_FORMAT_PCM {
        return Err(ModemError::UnsupportedFormat(format!(
            "format tag {:#06x} (only integer PCM is supported)",
            tag
        )));
    }

    let format = PcmFormat {
        sample_rate,
        channels,
        bits_per_sample,
    };
    format.check()?;

    if block_align != format.block_align() || byte_rate as u64 != format.byte_rate() {
        return Err(invalid(
            offset,
            &format!(
                "inconsistent fmt chunk: byte rate {} / block align {}, expected {} / {}",
                byte_rate,
                block_align,
                format.byte_rate(),
                format.block_align()
            ),
        ));
    }

    Ok(format)
}

fn parse_samples(data: &[u8], format: PcmFormat, offset: usize) -> Result<PcmBuffer> {
    if data.len() % format.block_align() as usize != 0 {
        return Err(invalid(
            offset,
            "data size is not a whole number of sample frames",
        ));
    }

    let width = format.bytes_per_sample() as usize;
    let samples = data
        .chunks_exact(width)
        .map(|bytes| match format.bits_per_sample {
            8 => bytes[0] as i32 - 128,
            16 => LittleEndian::read_i16(bytes) as i32,
            24 => LittleEndian::read_i24(bytes),
            _ => LittleEndian::read_i32(bytes),
        })
        .collect::<Vec<_>>();

    log::debug!(
        "Read WAV: {} Hz, {} ch, {} bit, {} samples",
        format.sample_rate,
        format.channels,
        format.bits_per_sample,
        samples.len()
    );

    Ok(PcmBuffer::new(format, samples))
}
