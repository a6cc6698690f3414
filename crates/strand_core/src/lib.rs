//! Strand Core
//!
//! Data model and value substrate for the Strand entity behavior runtime:
//! - Opaque typed values and the process-wide type registry
//! - Indirect references (entity targets, data members, variable targets)
//! - Shared descriptor storage (typed arenas)
//! - Variable scopes and evaluation contexts
//! - Compound trigger conditions
//! - The compiled instruction set and entity descriptors
//! - A minimal single-threaded entity registry surface

pub mod binary_format;
pub mod condition;
pub mod descriptor;
pub mod error;
pub mod expr;
pub mod hash;
pub mod indirect;
pub mod instruction;
pub mod ops;
pub mod registry;
pub mod storage;
pub mod target;
pub mod value;
pub mod variables;

pub use error::StorageError;
pub use hash::{hash_str, Symbol, TypeId};
pub use registry::{Entity, Registry};
pub use value::Value;

/// Compact index of an entity state within its descriptor.
pub type StateIndex = u16;

/// Index of a thread description within descriptor shared storage.
pub type ThreadIndex = u32;

/// Program counter within one thread description.
pub type InstructionIndex = u16;

/// Instruction span length (control-block sizes, skip/rewind strides).
pub type InstructionCount = u16;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
