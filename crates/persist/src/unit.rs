//! The stored form of one archive: envelope, ledger tail, then compression
//! over the whole buffer.

use crate::compress::CompressionCodec;
use crate::envelope::{EnvelopeHeader, unwrap, wrap};
use crate::error::{ArchiveKind, PersistError, Result};
use crate::ledger::{VersionTag, read_tail, stamp};
use crate::settings::Settings;

/// Compression in effect for `settings`. Flat-namespace backends store raw.
pub fn compression(settings: &Settings) -> CompressionCodec {
    if settings.is_flat_namespace() {
        CompressionCodec::Passthrough
    } else {
        CompressionCodec::Zstd {
            level: settings.compression_level,
        }
    }
}

pub fn version_tag(settings: &Settings) -> VersionTag {
    VersionTag::new(settings.plugin_version(), settings.expected_game_version())
}

/// Build a storable unit around `body`.
pub fn encode_unit(settings: &Settings, body: &[u8]) -> Result<Vec<u8>> {
    let mut unit = wrap(body).map_err(|e| PersistError::Encode(e.to_string()))?;
    stamp(&mut unit, &version_tag(settings)).map_err(|e| PersistError::Encode(e.to_string()))?;
    compression(settings).compress(&unit)
}

/// A unit read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedUnit {
    pub header: EnvelopeHeader,
    pub body: Vec<u8>,
    /// Absent on legacy units and units written without a tail.
    pub tag: Option<VersionTag>,
}

/// Undo [`encode_unit`]. Legacy units have no length prefix and no tail; the
/// whole buffer is their body.
pub fn decode_unit(settings: &Settings, bytes: &[u8], kind: ArchiveKind) -> Result<DecodedUnit> {
    let raw = compression(settings).decompress(bytes, kind)?;
    let (header, mut reader) =
        unwrap(&raw, settings.legacy_format).map_err(|e| PersistError::malformed(kind, e))?;
    if header.is_legacy {
        return Ok(DecodedUnit {
            header,
            body: reader.remaining().to_vec(),
            tag: None,
        });
    }
    let body = reader
        .bytes()
        .map_err(|e| PersistError::malformed(kind, e))?
        .to_vec();
    let tag = read_tail(&mut reader).map_err(|e| PersistError::malformed(kind, e))?;
    if !reader.is_empty() {
        return Err(PersistError::malformed(
            kind,
            format!("{} unexpected trailing bytes", reader.remaining().len()),
        ));
    }
    Ok(DecodedUnit { header, body, tag })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::FormatVersion;
    use crate::settings::{FileSaveMethod, LegacyFormat};

    #[test]
    fn unit_carries_body_and_tag() {
        let settings = Settings::default();
        let unit = encode_unit(&settings, b"payload").unwrap();
        let decoded = decode_unit(&settings, &unit, ArchiveKind::Level).unwrap();
        assert_eq!(decoded.body, b"payload");
        assert_eq!(decoded.header.format, FormatVersion::CURRENT);
        let tag = decoded.tag.unwrap();
        assert_eq!(tag.game, "SAVEGAME_1");
        assert_eq!(tag.plugin, "KSV_158");
    }

    #[test]
    fn oversized_game_version_fails_to_encode() {
        let settings = Settings {
            game_version: "9".repeat(70_000),
            ..Settings::default()
        };
        assert!(matches!(encode_unit(&settings, b"payload"), Err(PersistError::Encode(_))));
    }

    #[test]
    fn flat_backends_store_uncompressed() {
        let settings = Settings {
            file_save_method: FileSaveMethod::Console,
            ..Settings::default()
        };
        let unit = encode_unit(&settings, b"payload").unwrap();
        assert!(unit.starts_with(b"KSAV"));
        assert_eq!(decode_unit(&settings, &unit, ArchiveKind::Slot).unwrap().body, b"payload");
    }

    #[test]
    fn legacy_units_are_all_body() {
        let settings = Settings {
            file_save_method: FileSaveMethod::Console,
            legacy_format: LegacyFormat::Gen3,
            ..Settings::default()
        };
        let decoded = decode_unit(&settings, b"old bytes", ArchiveKind::Player).unwrap();
        assert!(decoded.header.is_legacy);
        assert_eq!(decoded.header.format, FormatVersion::LEGACY_GEN3);
        assert_eq!(decoded.body, b"old bytes");
        assert!(decoded.tag.is_none());
    }

    #[test]
    fn uncompressed_input_is_reported_not_masked() {
        let settings = Settings::default();
        let raw = crate::envelope::wrap(b"payload").unwrap();
        let err = decode_unit(&settings, &raw, ArchiveKind::Level).unwrap_err();
        assert!(matches!(
            err,
            PersistError::Decompressor {
                likely_uncompressed: true,
                ..
            }
        ));
    }
}
