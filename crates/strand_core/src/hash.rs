//! Name hashing.
//!
//! All authored names (types, members, variables, states, threads) are
//! reduced to 32-bit FNV-1a hashes at build time. Collisions are assumed
//! absent at authoring time; the toolchain is responsible for detecting them.

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash an authored name. The single hashing entry point for the runtime.
pub fn hash_str(name: &str) -> u32 {
    hash_bytes(name.as_bytes())
}

/// Hashed symbol for member, variable, state, and thread names.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Symbol(pub u32);

impl Symbol {
    pub fn of(name: &str) -> Self {
        Symbol(hash_str(name))
    }

    /// Combine a scope prefix with a name, producing the resolved identifier
    /// used for cross-thread variable lookups.
    pub fn scoped(prefix: Symbol, name: Symbol) -> Self {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&prefix.0.to_le_bytes());
        bytes[4..].copy_from_slice(&name.0.to_le_bytes());
        Symbol(hash_bytes(&bytes))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Hashed identifier for a registered value type.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn of(name: &str) -> Self {
        TypeId(hash_str(name))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_str("Impact"), hash_str("Impact"));
        assert_ne!(hash_str("Impact"), hash_str("impact"));
    }

    #[test]
    fn test_scoped_symbols_differ_by_prefix() {
        let name = Symbol::of("counter");
        let a = Symbol::scoped(Symbol::of("thread_a"), name);
        let b = Symbol::scoped(Symbol::of("thread_b"), name);
        assert_ne!(a, b);
        assert_ne!(a, name);
    }

    #[test]
    fn test_empty_symbol() {
        assert!(Symbol::default().is_empty());
        assert!(!Symbol::of("x").is_empty());
    }
}
