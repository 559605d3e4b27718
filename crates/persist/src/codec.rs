//! Encoding of a single entity's or component's persisted fields.
//!
//! Fields are stored as a CBOR map. Formats older than
//! [`FormatVersion::FIELD_MAPS`] stored a list of `(name, value)` pairs; both
//! shapes are accepted when decoding under such a format.
//!
//! In multi-region modes each level entity and component payload ends with
//! [`OBJECT_TAG`]. A payload that should carry the tag but does not predates
//! it, and is decoded under [`FormatVersion::OLDEST`].

use serde::Deserialize;
use keepsake_common::{FieldBag, Value};

use crate::archive::EntityKind;
use crate::envelope::FormatVersion;
use crate::error::{ArchiveKind, PersistError, Result};
use crate::schema::SchemaRegistry;
use crate::settings::Settings;

/// Tail marker on individually tagged payloads. Only its presence matters.
pub const OBJECT_TAG: [u8; 8] = [0x4b, 0x53, 0x4f, 0x42, 0x9e, 0x27, 0xc1, 0x04];

/// What a payload belongs to, for tag policy purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSubject {
    Entity(EntityKind),
    Component,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyFields {
    Map(FieldBag),
    Pairs(Vec<(String, Value)>),
}

/// Field encoder/decoder bound to a tag policy and the session's loaded
/// structural format. Cheap to copy into worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectCodec {
    tag_payloads: bool,
    format: FormatVersion,
}

impl ObjectCodec {
    pub fn new(settings: &Settings, format: FormatVersion) -> Self {
        Self {
            tag_payloads: settings.object_version_tag && settings.multi_region_active(),
            format,
        }
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    pub fn requires_tag(&self, subject: TagSubject) -> bool {
        self.tag_payloads
            && match subject {
                TagSubject::Entity(kind) => kind.is_level_kind(true),
                TagSubject::Component => true,
            }
    }

    /// Encode the persisted subset of `bag` according to `type_name`'s schema.
    pub fn encode(
        &self,
        schemas: &SchemaRegistry,
        subject: TagSubject,
        type_name: &str,
        bag: &FieldBag,
    ) -> Result<Vec<u8>> {
        let selected = schemas.select_persisted(type_name, bag);
        self.encode_fields(subject, &selected)
    }

    /// Encode `fields` as-is.
    pub fn encode_fields(&self, subject: TagSubject, fields: &FieldBag) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(fields, &mut buf).map_err(|e| PersistError::Encode(e.to_string()))?;
        if self.requires_tag(subject) {
            buf.extend_from_slice(&OBJECT_TAG);
        }
        Ok(buf)
    }

    /// Decode a payload produced by [`ObjectCodec::encode`]. An empty payload
    /// decodes to an empty bag.
    pub fn decode(&self, subject: TagSubject, bytes: &[u8]) -> Result<FieldBag> {
        if bytes.is_empty() {
            return Ok(FieldBag::new());
        }
        let (body, format) = match bytes.strip_suffix(&OBJECT_TAG) {
            Some(body) => (body, self.format),
            None if self.requires_tag(subject) => {
                tracing::debug!(?subject, "payload lacks object tag, decoding as oldest format");
                (bytes, FormatVersion::OLDEST)
            }
            None => (bytes, self.format),
        };
        decode_fields(body, format)
    }
}

fn decode_fields(body: &[u8], format: FormatVersion) -> Result<FieldBag> {
    let mut rest = body;
    let fields = if format >= FormatVersion::FIELD_MAPS {
        ciborium::from_reader::<FieldBag, _>(&mut rest)
            .map_err(|e| PersistError::malformed(ArchiveKind::Object, e))?
    } else {
        match ciborium::from_reader::<LegacyFields, _>(&mut rest)
            .map_err(|e| PersistError::malformed(ArchiveKind::Object, e))?
        {
            LegacyFields::Map(map) => map,
            LegacyFields::Pairs(pairs) => pairs.into_iter().collect(),
        }
    };
    if !rest.is_empty() {
        return Err(PersistError::malformed(
            ArchiveKind::Object,
            format!("{} unexpected trailing bytes", rest.len()),
        ));
    }
    Ok(fields)
}
