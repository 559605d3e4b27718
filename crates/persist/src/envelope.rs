//! Outer framing of every stored unit.
//!
//! ```text
//! [magic: 4] [format: u32] [env: major u16, minor u16, patch u16, changelist u32, branch str]
//! [body: u32 len + bytes] [ledger tail]
//! ```
//!
//! Archives written before the magic existed start directly with the body.
//! Those are read from offset 0 under a configured legacy format version.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::settings::LegacyFormat;
use crate::wire::{ByteReader, ByteWriter, WireError};

pub const MAGIC: [u8; 4] = *b"KSAV";

/// Structural format of an archive's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormatVersion(pub u32);

impl FormatVersion {
    pub const LEGACY_GEN1: Self = Self(1);
    pub const LEGACY_GEN2: Self = Self(2);
    pub const LEGACY_GEN3: Self = Self(3);
    pub const CURRENT: Self = Self(4);

    /// Oldest structural format still readable.
    pub const OLDEST: Self = Self::LEGACY_GEN1;

    /// First format that stores field bags as maps rather than pair lists.
    pub const FIELD_MAPS: Self = Self::LEGACY_GEN2;
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl LegacyFormat {
    /// The structural version untagged archives are assumed to carry.
    pub fn format_version(self) -> FormatVersion {
        match self {
            LegacyFormat::Gen1 => FormatVersion::LEGACY_GEN1,
            LegacyFormat::Gen2 => FormatVersion::LEGACY_GEN2,
            LegacyFormat::Gen3 => FormatVersion::LEGACY_GEN3,
        }
    }
}

/// Build descriptor of the engine that wrote an archive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnvVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub changelist: u32,
    pub branch: String,
}

impl EnvVersion {
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            changelist: 0,
            branch: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

impl fmt::Display for EnvVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}-{}+{}",
            self.major, self.minor, self.patch, self.changelist, self.branch
        )
    }
}

/// Versions detected at the front of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub format: FormatVersion,
    pub env: EnvVersion,
    pub is_legacy: bool,
}

impl EnvelopeHeader {
    pub fn current() -> Self {
        Self {
            format: FormatVersion::CURRENT,
            env: EnvVersion::current(),
            is_legacy: false,
        }
    }

    pub fn legacy(legacy: LegacyFormat) -> Self {
        Self {
            format: legacy.format_version(),
            env: EnvVersion::default(),
            is_legacy: true,
        }
    }
}

/// Prepend magic and current versions to `payload`. The payload is
/// length-prefixed so a ledger tail can follow it.
pub fn wrap(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = EnvelopeHeader::current();
    let mut w = ByteWriter::with_capacity(payload.len() + 32);
    w.put_raw(&MAGIC);
    w.put_u32(header.format.0);
    w.put_u16(header.env.major);
    w.put_u16(header.env.minor);
    w.put_u16(header.env.patch);
    w.put_u32(header.env.changelist);
    w.put_str(&header.env.branch)?;
    w.put_bytes(payload)?;
    Ok(w.into_inner())
}

/// Read the header. Returns the detected versions and a reader positioned at
/// the length-prefixed payload.
///
/// A buffer without the magic is never an error: it is legacy, and the reader
/// starts at offset 0.
pub fn unwrap(bytes: &[u8], legacy: LegacyFormat) -> Result<(EnvelopeHeader, ByteReader<'_>), WireError> {
    if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
        tracing::debug!(
            format = %legacy.format_version(),
            "no archive magic, reading as legacy"
        );
        return Ok((EnvelopeHeader::legacy(legacy), ByteReader::new(bytes)));
    }
    let mut r = ByteReader::new(bytes);
    r.take(MAGIC.len())?;
    let format = FormatVersion(r.u32()?);
    let env = EnvVersion {
        major: r.u16()?,
        minor: r.u16()?,
        patch: r.u16()?,
        changelist: r.u32()?,
        branch: r.string()?,
    };
    Ok((
        EnvelopeHeader {
            format,
            env,
            is_legacy: false,
        },
        r,
    ))
}

/// Versions detected by the most recent top-level unwrap in a session. Nested
/// payloads do not repeat the header, so decoding them reuses these.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadedVersions {
    header: Option<EnvelopeHeader>,
}

impl LoadedVersions {
    pub fn record(&mut self, header: &EnvelopeHeader) {
        self.header = Some(header.clone());
    }

    /// Structural format for nested decoding; current when nothing was loaded.
    pub fn format(&self) -> FormatVersion {
        self.header
            .as_ref()
            .map(|h| h.format)
            .unwrap_or(FormatVersion::CURRENT)
    }

    pub fn header(&self) -> Option<&EnvelopeHeader> {
        self.header.as_ref()
    }

    pub fn clear(&mut self) {
        self.header = None;
    }
}
