//! Library error types.

use thiserror::Error;

use crate::hash::TypeId;

/// Errors surfaced while loading or dereferencing descriptor shared storage.
///
/// A checksum mismatch is fatal at load time; everything else degrades to a
/// logged warning at the call site.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("shared storage checksum mismatch for type #{0:?}", .type_id.0)]
    ChecksumMismatch { type_id: TypeId },

    #[error("no shared storage arena registered for type #{0:?}", .type_id.0)]
    UnknownArena { type_id: TypeId },

    #[error("shared storage index {index} out of range for type #{0:?}", .type_id.0)]
    IndexOutOfRange { type_id: TypeId, index: u32 },
}

/// Errors produced by the entity registry surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("entity is not alive")]
    DeadEntity,

    #[error("component not present")]
    MissingComponent,
}
