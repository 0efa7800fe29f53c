//! Chunk payload codec
//!
//! A payload is a small fixed header followed by the record batch body:
//!
//! ```text
//! | magic (1) | version (1) | format (1) | crc32c(body) (4, LE) | body |
//! ```
//!
//! The body is the bincode-encoded batch, zstd-compressed when that
//! shrinks it. Anything that does not check out on decode (header, checksum,
//! decompression or deserialization) is an [`Error::Decode`].

use cardvault_common::{CardRecord, Error, Result};
use tracing::warn;

/// First byte of every payload
pub const MAGIC: u8 = 0xCB;

/// Version written by [`FramedCodec`]
pub const CODEC_VERSION: u8 = 1;

const HEADER_LEN: usize = 7;

/// How the body of a payload is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadFormat {
    /// Uncompressed bincode
    Raw = 0,
    /// zstd-compressed bincode
    Zstd = 1,
}

impl TryFrom<u8> for PayloadFormat {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Zstd),
            _ => Err(Error::decode(format!("unknown payload format: {value}"))),
        }
    }
}

/// Output of [`ChunkCodec::encode`]
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub payload: Vec<u8>,
    /// Size of the serialized batch before compression
    pub uncompressed_size: u64,
    pub format: PayloadFormat,
}

/// Versioned, lossless encoding of a record batch
pub trait ChunkCodec: Send + Sync {
    /// Version tag stored alongside each chunk
    fn version(&self) -> u8;

    /// Encode a batch
    fn encode(&self, records: &[CardRecord]) -> Result<EncodedChunk>;

    /// Decode a payload produced by [`encode`](Self::encode)
    fn decode(&self, payload: &[u8]) -> Result<Vec<CardRecord>>;
}

/// bincode + zstd codec with a checksummed frame
#[derive(Debug, Clone, Copy)]
pub struct FramedCodec {
    level: i32,
}

impl FramedCodec {
    #[must_use]
    pub const fn new(level: i32) -> Self {
        Self { level }
    }

    fn frame(format: PayloadFormat, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(HEADER_LEN + body.len());
        payload.push(MAGIC);
        payload.push(CODEC_VERSION);
        payload.push(format as u8);
        payload.extend_from_slice(&crc32c::crc32c(body).to_le_bytes());
        payload.extend_from_slice(body);
        payload
    }
}

impl Default for FramedCodec {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ChunkCodec for FramedCodec {
    fn version(&self) -> u8 {
        CODEC_VERSION
    }

    fn encode(&self, records: &[CardRecord]) -> Result<EncodedChunk> {
        let raw = bincode::serialize(records)?;
        let uncompressed_size = raw.len() as u64;

        let (format, body) = match zstd::encode_all(raw.as_slice(), self.level) {
            Ok(compressed) if compressed.len() < raw.len() => (PayloadFormat::Zstd, compressed),
            Ok(_) => (PayloadFormat::Raw, raw),
            Err(e) => {
                warn!("zstd compression failed, storing raw chunk: {}", e);
                (PayloadFormat::Raw, raw)
            }
        };

        Ok(EncodedChunk {
            payload: Self::frame(format, &body),
            uncompressed_size,
            format,
        })
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<CardRecord>> {
        if payload.len() < HEADER_LEN {
            return Err(Error::decode(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        if payload[0] != MAGIC {
            return Err(Error::decode(format!("bad magic: {:#04x}", payload[0])));
        }
        if payload[1] != CODEC_VERSION {
            return Err(Error::decode(format!(
                "unsupported codec version: {}",
                payload[1]
            )));
        }
        let format = PayloadFormat::try_from(payload[2])?;
        let expected = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]);
        let body = &payload[HEADER_LEN..];
        let actual = crc32c::crc32c(body);
        if actual != expected {
            return Err(Error::decode(format!(
                "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
            )));
        }

        let records = match format {
            PayloadFormat::Raw => bincode::deserialize(body),
            PayloadFormat::Zstd => {
                let raw = zstd::decode_all(body)
                    .map_err(|e| Error::decode(format!("zstd decompression failed: {e}")))?;
                bincode::deserialize(&raw)
            }
        };
        records.map_err(|e| Error::decode(format!("record batch: {e}")))
    }
}
