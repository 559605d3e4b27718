use std::fmt;

use crate::admission::OperationMode;

/// Which logical archive an operation was working on. Carried in errors and
/// log lines so failures can be diagnosed without a debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Player,
    Level,
    Slot,
    Object,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArchiveKind::Player => "player",
            ArchiveKind::Level => "level",
            ArchiveKind::Slot => "slot",
            ArchiveKind::Object => "object",
        };
        f.write_str(s)
    }
}

/// Errors from the save engine.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Nothing is stored under the key. A normal "nothing to load" signal.
    #[error("nothing stored under {key}")]
    StorageMissing { key: String },
    #[error("storage failure on {key}: {source}")]
    StorageIo {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("compression failed: {0}")]
    Compressor(String),
    #[error("decompression of {kind} archive failed (likely uncompressed: {likely_uncompressed}): {reason}")]
    Decompressor {
        kind: ArchiveKind,
        likely_uncompressed: bool,
        reason: String,
    },
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
    #[error("malformed {kind} archive: {reason}")]
    MalformedArchive { kind: ArchiveKind, reason: String },
    #[error("cannot resolve class {class}")]
    ResolveClass { class: String },
    #[error("a {0} operation is already in flight")]
    ConcurrentOperationRejected(OperationMode),
    #[error("world is paused")]
    PausedRejected,
    #[error("CBOR serialization error: {0}")]
    Encode(String),
    #[error("settings error: {0}")]
    Settings(String),
}

impl PersistError {
    /// Errors that short-circuit an operation to a logged `false` instead of
    /// escalating.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            PersistError::StorageMissing { .. }
                | PersistError::ConcurrentOperationRejected(_)
                | PersistError::PausedRejected
        )
    }

    pub(crate) fn malformed(kind: ArchiveKind, reason: impl fmt::Display) -> Self {
        PersistError::MalformedArchive {
            kind,
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Settings(e.to_string())
    }
}

impl From<serde_yaml::Error> for PersistError {
    fn from(e: serde_yaml::Error) -> Self {
        PersistError::Settings(e.to_string())
    }
}

pub type Result<T, E = PersistError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_errors_do_not_escalate() {
        assert!(PersistError::StorageMissing { key: "a".into() }.is_benign());
        assert!(PersistError::PausedRejected.is_benign());
        assert!(PersistError::ConcurrentOperationRejected(OperationMode::Level).is_benign());
        assert!(!PersistError::Compressor("x".into()).is_benign());
    }

    #[test]
    fn messages_carry_context() {
        let e = PersistError::malformed(ArchiveKind::Level, "trailing bytes");
        assert_eq!(e.to_string(), "malformed level archive: trailing bytes");
    }
}
