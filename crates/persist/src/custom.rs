//! Typed save objects stored outside the level/player archives.
//!
//! A custom object is any `serde` type with a stable save name. It is stored
//! as its own unit and cached per session under `{name}{slot}`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;

use crate::error::{ArchiveKind, PersistError, Result};

/// A type that can be saved as a custom object.
pub trait CustomSave: Serialize + DeserializeOwned + Default + Send + 'static {
    /// File name the object is stored under.
    const SAVE_NAME: &'static str;
    /// Store one copy per slot instead of one global copy.
    const USE_SLOT: bool = false;
}

/// Cache key for a custom object. Global objects have no slot part.
pub fn cache_key(name: &str, slot: Option<&str>) -> String {
    format!("{name}{}", slot.unwrap_or_default())
}

pub(crate) trait ErasedCustom: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn save_name(&self) -> &'static str;
    fn slot(&self) -> Option<&str>;
    fn encode_body(&self) -> Result<Vec<u8>>;
}

pub(crate) struct CustomEntry<T> {
    pub value: T,
    pub slot: Option<String>,
}

impl<T: CustomSave> ErasedCustom for CustomEntry<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn save_name(&self) -> &'static str {
        T::SAVE_NAME
    }

    fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.value, &mut buf)
            .map_err(|e| PersistError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

pub(crate) fn decode_body<T: CustomSave>(body: &[u8]) -> Result<T> {
    ciborium::from_reader(body).map_err(|e| PersistError::malformed(ArchiveKind::Object, e))
}

/// Borrow the cached value as `T`. Fails if the key holds another type.
pub(crate) fn downcast<T: CustomSave>(entry: &mut dyn ErasedCustom) -> Result<&mut T> {
    let name = entry.save_name();
    entry
        .as_any_mut()
        .downcast_mut::<CustomEntry<T>>()
        .map(|e| &mut e.value)
        .ok_or_else(|| PersistError::Encode(format!("custom object {name} is cached as another type")))
}
