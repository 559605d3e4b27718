use std::io::{Read, Write};

use crate::error::{ArchiveKind, PersistError, Result};

/// Frame magic zstd puts at the start of every compressed stream.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Whole-buffer compression applied after the ledger tail is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    Zstd { level: i32 },
    /// For backends that forbid compressed blobs.
    Passthrough,
}

impl CompressionCodec {
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match *self {
            CompressionCodec::Passthrough => Ok(data.to_vec()),
            CompressionCodec::Zstd { level } => {
                zstd_compress(data, level).map_err(|e| PersistError::Compressor(e.to_string()))
            }
        }
    }

    /// Failure is reported, never masked by retrying as raw input.
    pub fn decompress(&self, data: &[u8], kind: ArchiveKind) -> Result<Vec<u8>> {
        match *self {
            CompressionCodec::Passthrough => Ok(data.to_vec()),
            CompressionCodec::Zstd { .. } => zstd_decompress(data).map_err(|e| {
                let likely_uncompressed = !data.starts_with(&ZSTD_MAGIC);
                tracing::error!(
                    %kind,
                    likely_uncompressed,
                    error = %e,
                    "failed to decompress archive"
                );
                PersistError::Decompressor {
                    kind,
                    likely_uncompressed,
                    reason: e.to_string(),
                }
            }),
        }
    }
}

fn zstd_compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

fn zstd_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_restores_input() {
        let codec = CompressionCodec::Zstd { level: 3 };
        let data = b"keepsake keepsake keepsake keepsake".repeat(20);
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decompress(&packed, ArchiveKind::Level).unwrap(), data);
    }

    #[test]
    fn passthrough_is_identity() {
        let codec = CompressionCodec::Passthrough;
        assert_eq!(codec.compress(b"abc").unwrap(), b"abc");
        assert_eq!(codec.decompress(b"abc", ArchiveKind::Slot).unwrap(), b"abc");
    }

    #[test]
    fn raw_input_is_flagged_likely_uncompressed() {
        let codec = CompressionCodec::Zstd { level: 3 };
        let err = codec
            .decompress(b"KSAV not compressed", ArchiveKind::Player)
            .unwrap_err();
        assert!(matches!(
            err,
            PersistError::Decompressor {
                kind: ArchiveKind::Player,
                likely_uncompressed: true,
                ..
            }
        ));
    }
}
