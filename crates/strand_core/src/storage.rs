//! Descriptor shared storage.
//!
//! Compiled programs form graphs (conditions referencing sub-conditions,
//! instructions referencing conditions and expressions). Those graphs are
//! flattened into typed arenas owned by the descriptor; cross-references are
//! `IndirectRef` handles carrying the arena type, slot index, and the
//! registration checksum of the type. Deallocation is all-or-nothing per
//! descriptor. Storage is read-only after load.

use std::any::Any;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::hash::TypeId;
use crate::value;

/// Index of a slot inside one typed arena.
pub type StorageIndex = u32;

/// Handle into descriptor shared storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndirectRef {
    pub type_id: TypeId,
    pub index: StorageIndex,
    /// Registration checksum of `type_id` at compile time. Validated against
    /// the live type registry when the reference is dereferenced at load.
    pub checksum: u32,
}

impl IndirectRef {
    /// Check this reference against the live type registry.
    pub fn validate(&self) -> Result<(), StorageError> {
        match value::checksum_of(self.type_id) {
            Some(checksum) if checksum == self.checksum => Ok(()),
            _ => Err(StorageError::ChecksumMismatch {
                type_id: self.type_id,
            }),
        }
    }
}

/// Marker for resource types storable in a shared-storage arena.
///
/// The name registers the type with the value registry (for its id and
/// checksum); the arena itself stays statically typed.
pub trait StorageResource: 'static {
    fn resource_name() -> &'static str;

    fn resource_type_id() -> TypeId
    where
        Self: Sized,
    {
        value::ensure_registered::<Self>(Self::resource_name())
    }
}

impl StorageResource for String {
    fn resource_name() -> &'static str {
        "String"
    }

    fn resource_type_id() -> TypeId {
        // Pre-registered primitive.
        TypeId::of("String")
    }
}

trait AnyArena: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn live_len(&self) -> usize;
    fn vacate(&mut self, index: StorageIndex) -> bool;
}

struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T: 'static> AnyArena for Arena<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn live_len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn vacate(&mut self, index: StorageIndex) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// A set of typed arenas keyed by registered type id.
#[derive(Default)]
pub struct SharedStorage {
    arenas: HashMap<TypeId, Box<dyn AnyArena>>,
}

impl SharedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn arena<T: StorageResource>(&self) -> Option<&Arena<T>> {
        self.arenas
            .get(&T::resource_type_id())?
            .as_any()
            .downcast_ref::<Arena<T>>()
    }

    fn arena_mut<T: StorageResource>(&mut self) -> &mut Arena<T> {
        self.arenas
            .entry(T::resource_type_id())
            .or_insert_with(|| Box::new(Arena::<T>::default()))
            .as_any_mut()
            .downcast_mut::<Arena<T>>()
            .expect("arena type mismatch")
    }

    /// Store a resource, returning its handle.
    pub fn allocate<T: StorageResource>(&mut self, resource: T) -> IndirectRef {
        let type_id = T::resource_type_id();
        let checksum = value::checksum_of(type_id).unwrap_or_default();
        let arena = self.arena_mut::<T>();
        let index = arena.slots.len() as StorageIndex;
        arena.slots.push(Some(resource));
        IndirectRef {
            type_id,
            index,
            checksum,
        }
    }

    /// Allocate a default-constructed resource.
    pub fn allocate_default<T: StorageResource + Default>(&mut self) -> IndirectRef {
        self.allocate(T::default())
    }

    /// Dereference a handle, validating its checksum and type.
    pub fn get<T: StorageResource>(&self, reference: IndirectRef) -> Result<&T, StorageError> {
        reference.validate()?;
        let type_id = T::resource_type_id();
        if reference.type_id != type_id {
            return Err(StorageError::UnknownArena {
                type_id: reference.type_id,
            });
        }
        let arena = self
            .arena::<T>()
            .ok_or(StorageError::UnknownArena { type_id })?;
        arena
            .slots
            .get(reference.index as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(StorageError::IndexOutOfRange {
                type_id,
                index: reference.index,
            })
    }

    /// Index-based access without a handle (internal views).
    pub fn get_by_index<T: StorageResource>(&self, index: StorageIndex) -> Option<&T> {
        self.arena::<T>()?
            .slots
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
    }

    pub fn get_by_index_mut<T: StorageResource>(&mut self, index: StorageIndex) -> Option<&mut T> {
        self.arena_mut::<T>()
            .slots
            .get_mut(index as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Release one slot. Vacated slots are never reused, so indices in
    /// compiled programs stay stable. Returns false if already vacant.
    pub fn deallocate(&mut self, type_id: TypeId, index: StorageIndex) -> bool {
        match self.arenas.get_mut(&type_id) {
            Some(arena) => arena.vacate(index),
            None => false,
        }
    }

    /// Typed deallocation convenience.
    pub fn deallocate_typed<T: StorageResource>(&mut self, index: StorageIndex) -> bool {
        self.deallocate(T::resource_type_id(), index)
    }

    /// Find an existing equal resource (interned dedup).
    pub fn find<T: StorageResource + PartialEq>(&self, resource: &T) -> Option<IndirectRef> {
        let type_id = T::resource_type_id();
        let checksum = value::checksum_of(type_id).unwrap_or_default();
        let arena = self.arena::<T>()?;
        arena
            .slots
            .iter()
            .position(|slot| slot.as_ref() == Some(resource))
            .map(|index| IndirectRef {
                type_id,
                index: index as StorageIndex,
                checksum,
            })
    }

    /// Intern: reuse an equal resource or allocate a new slot.
    pub fn intern<T: StorageResource + PartialEq>(&mut self, resource: T) -> IndirectRef {
        match self.find(&resource) {
            Some(existing) => existing,
            None => self.allocate(resource),
        }
    }

    /// Number of live slots for a resource type.
    pub fn len<T: StorageResource>(&self) -> usize {
        self.arena::<T>().map(|a| a.live_len()).unwrap_or(0)
    }

    /// Next index that `allocate` would hand out for a resource type.
    pub fn next_index<T: StorageResource>(&self) -> StorageIndex {
        self.arena::<T>()
            .map(|a| a.slots.len() as StorageIndex)
            .unwrap_or(0)
    }

    /// All live entries of a resource type, in allocation order.
    pub fn entries<T: StorageResource>(&self) -> Vec<(StorageIndex, &T)> {
        match self.arena::<T>() {
            Some(arena) => arena
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as StorageIndex, v)))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Default)]
    struct Note(String);

    impl StorageResource for Note {
        fn resource_name() -> &'static str {
            "StorageTestNote"
        }
    }

    #[test]
    fn test_allocate_and_get() {
        let mut storage = SharedStorage::new();
        let handle = storage.allocate(Note("hello".into()));
        assert_eq!(storage.get::<Note>(handle).unwrap().0, "hello");
        assert_eq!(storage.len::<Note>(), 1);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let mut storage = SharedStorage::new();
        let mut handle = storage.allocate(Note("x".into()));
        handle.checksum ^= 0xdead_beef;
        assert_eq!(
            storage.get::<Note>(handle),
            Err(StorageError::ChecksumMismatch {
                type_id: handle.type_id
            })
        );
    }

    #[test]
    fn test_deallocate_leaves_indices_stable() {
        let mut storage = SharedStorage::new();
        let a = storage.allocate(Note("a".into()));
        let b = storage.allocate(Note("b".into()));
        assert!(storage.deallocate_typed::<Note>(a.index));
        assert!(!storage.deallocate_typed::<Note>(a.index));
        assert_eq!(storage.get::<Note>(b).unwrap().0, "b");
        assert!(storage.get::<Note>(a).is_err());
    }

    #[test]
    fn test_intern_dedup() {
        let mut storage = SharedStorage::new();
        let a = storage.intern(Note("same".into()));
        let b = storage.intern(Note("same".into()));
        let c = storage.intern(Note("other".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(storage.len::<Note>(), 2);
    }
}
