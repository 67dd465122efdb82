use crate::error::{ModemError, Result};
use crate::ModemConfig;
use byteorder::{BigEndian, ByteOrder};

/// 32-bit sync pattern; aperiodic autocorrelation sidelobes never exceed 4.
pub const DEFAULT_PREAMBLE: [u8; 4] = [0xEC, 0xC7, 0x8A, 0x4A];
pub const LENGTH_FIELD_BYTES: usize = 2;
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// CRC-16-CCITT (init 0xFFFF, poly 0x1021).
    Crc16,
    /// CRC-32 (IEEE).
    Crc32,
}

impl Checksum {
    /// Width of the serialized checksum in bytes.
    pub fn width(&self) -> usize {
        match self {
            Checksum::Crc16 => 2,
            Checksum::Crc32 => 4,
        }
    }

    /// Checksum over the serialized length field followed by the payload.
    pub fn compute(&self, length: &[u8], payload: &[u8]) -> u32 {
        match self {
            Checksum::Crc16 => crc16(length.iter().chain(payload)) as u32,
            Checksum::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(length);
                hasher.update(payload);
                hasher.finalize()
            }
        }
    }

    fn write(&self, buf: &mut [u8], value: u32) {
        match self {
            Checksum::Crc16 => BigEndian::write_u16(buf, value as u16),
            Checksum::Crc32 => BigEndian::write_u32(buf, value),
        }
    }

    fn read(&self, buf: &[u8]) -> u32 {
        match self {
            Checksum::Crc16 => BigEndian::read_u16(buf) as u32,
            Checksum::Crc32 => BigEndian::read_u32(buf),
        }
    }
}

fn crc16<'a>(data: impl IntoIterator<Item = &'a u8>) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Bytes before the payload: preamble plus length field.
pub fn header_len(config: &ModemConfig) -> usize {
    config.preamble.len() + LENGTH_FIELD_BYTES
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl Frame {
    pub fn new(payload: Vec<u8>, config: &ModemConfig) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ModemError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let length = (payload.len() as u16).to_be_bytes();
        let checksum = config.checksum.compute(&length, &payload);

        Ok(Self { payload, checksum })
    }

    pub fn serialize(&self, config: &ModemConfig) -> Vec<u8> {
        let header = header_len(config);
        let width = config.checksum.width();
        let mut data = vec![0u8; header + self.payload.len() + width];

        data[..config.preamble.len()].copy_from_slice(&config.preamble);
        BigEndian::write_u16(&mut data[config.preamble.len()..header], self.payload.len() as u16);
        data[header..header + self.payload.len()].copy_from_slice(&self.payload);
        config
            .checksum
            .write(&mut data[header + self.payload.len()..], self.checksum);

        data
    }

    /// Parse a frame that starts at offset 0 of `data`. Bytes after the
    /// checksum are ignored.
    pub fn deserialize(data: &[u8], config: &ModemConfig) -> Result<Self> {
        let needed = frame_len(data, config)?;
        if data.len() < needed {
            return Err(ModemError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let header = header_len(config);
        let checksum_start = needed - config.checksum.width();
        let length = &data[config.preamble.len()..header];
        let payload = &data[header..checksum_start];
        let expected = config.checksum.read(&data[checksum_start..needed]);
        let computed = config.checksum.compute(length, payload);
        if expected != computed {
            return Err(ModemError::ChecksumMismatch { expected, computed });
        }

        Ok(Self {
            payload: payload.to_vec(),
            checksum: computed,
        })
    }
}

/// Total frame size announced by a header. Validates the preamble.
pub fn frame_len(header: &[u8], config: &ModemConfig) -> Result<usize> {
    let needed = header_len(config);
    if header.len() < needed {
        return Err(ModemError::Truncated {
            needed,
            available: header.len(),
        });
    }

    if let Some(offset) = config
        .preamble
        .iter()
        .zip(header)
        .position(|(expected, actual)| expected != actual)
    {
        return Err(ModemError::PreambleMismatch { offset });
    }

    let payload_len = BigEndian::read_u16(&header[config.preamble.len()..needed]) as usize;
    Ok(needed + payload_len + config.checksum.width())
}

/// Wrap a payload into frame bytes. Deterministic.
pub fn frame(payload: &[u8], config: &ModemConfig) -> Result<Vec<u8>> {
    Ok(Frame::new(payload.to_vec(), config)?.serialize(config))
}

/// Validate frame bytes and extract the payload.
pub fn deframe(data: &[u8], config: &ModemConfig) -> Result<Vec<u8>> {
    Frame::deserialize(data, config).map(|frame| frame.payload)
}
