//! Minimal single-threaded entity registry.
//!
//! The full ECS container is an external collaborator; this surface carries
//! exactly what the behavior runtime needs to act on entities: typed engine
//! components, opaque data-driven components (values keyed by registered
//! type id), entity names, parent/child relationships, and player lookup.

use std::any::Any;
use std::collections::HashMap;

use once_cell::sync::OnceCell;
use tracing::warn;

use crate::hash::{Symbol, TypeId};
use crate::value::{self, Value};

/// Entity handle. Plain monotonically-increasing id; never reused.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Entity(pub u64);

/// Index identifying a local player.
pub type PlayerIndex = u16;

/// Matches any player when used in event payload filtering.
pub const ANY_PLAYER: PlayerIndex = PlayerIndex::MAX;

/// Marks an entity as owned by a local player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerComponent {
    pub player_index: PlayerIndex,
}

/// Marks an entity as targeting a local player (camera rigs, UI proxies).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerTargetComponent {
    pub player_index: PlayerIndex,
}

/// Registers `Entity` as a value type so targets and event payloads can
/// carry entity handles opaquely.
pub fn entity_value_type() -> TypeId {
    static ID: OnceCell<TypeId> = OnceCell::new();
    *ID.get_or_init(|| {
        value::TypeBuilder::<Entity>::new("Entity")
            .cloneable()
            .comparable()
            .ordered()
            .register()
    })
}

trait ComponentMap: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn remove_entity(&mut self, entity: Entity);
}

struct TypedMap<T: 'static> {
    entries: HashMap<Entity, T>,
}

impl<T: 'static> ComponentMap for TypedMap<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn remove_entity(&mut self, entity: Entity) {
        self.entries.remove(&entity);
    }
}

/// The registry. Single-threaded by construction; the runtime owns all
/// mutation within a tick.
#[derive(Default)]
pub struct Registry {
    next_id: u64,
    live: Vec<Entity>,
    typed: HashMap<std::any::TypeId, Box<dyn ComponentMap>>,
    meta: HashMap<TypeId, HashMap<Entity, Value>>,
    names: HashMap<Symbol, Entity>,
    names_reverse: HashMap<Entity, Symbol>,
    parents: HashMap<Entity, Entity>,
    children: HashMap<Entity, Vec<Entity>>,
}

impl Registry {
    pub fn new() -> Self {
        entity_value_type();
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn create(&mut self) -> Entity {
        let entity = Entity(self.next_id);
        self.next_id += 1;
        self.live.push(entity);
        entity
    }

    pub fn destroy(&mut self, entity: Entity) -> bool {
        let Some(position) = self.live.iter().position(|&e| e == entity) else {
            return false;
        };
        self.live.remove(position);

        for map in self.typed.values_mut() {
            map.remove_entity(entity);
        }
        for per_type in self.meta.values_mut() {
            per_type.remove(&entity);
        }
        if let Some(name) = self.names_reverse.remove(&entity) {
            self.names.remove(&name);
        }
        self.detach_from_parent(entity);
        if let Some(children) = self.children.remove(&entity) {
            for child in children {
                self.parents.remove(&child);
            }
        }
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.live.contains(&entity)
    }

    /// Live entities in creation order.
    pub fn entities(&self) -> Vec<Entity> {
        self.live.clone()
    }

    /// Live entities carrying a typed component, in creation order.
    pub fn entities_with<T: 'static>(&self) -> Vec<Entity> {
        self.live
            .iter()
            .copied()
            .filter(|&e| self.get::<T>(e).is_some())
            .collect()
    }

    // Typed engine components.

    fn map<T: 'static>(&self) -> Option<&TypedMap<T>> {
        self.typed
            .get(&std::any::TypeId::of::<T>())?
            .as_any()
            .downcast_ref::<TypedMap<T>>()
    }

    fn map_mut<T: 'static>(&mut self) -> &mut TypedMap<T> {
        self.typed
            .entry(std::any::TypeId::of::<T>())
            .or_insert_with(|| {
                Box::new(TypedMap::<T> {
                    entries: HashMap::new(),
                })
            })
            .as_any_mut()
            .downcast_mut::<TypedMap<T>>()
            .expect("component map type mismatch")
    }

    pub fn insert<T: 'static>(&mut self, entity: Entity, component: T) -> Option<T> {
        if !self.is_alive(entity) {
            warn!(entity = entity.0, "insert on dead entity");
            return None;
        }
        self.map_mut::<T>().entries.insert(entity, component)
    }

    pub fn get<T: 'static>(&self, entity: Entity) -> Option<&T> {
        self.map::<T>()?.entries.get(&entity)
    }

    pub fn get_mut<T: 'static>(&mut self, entity: Entity) -> Option<&mut T> {
        self.typed
            .get_mut(&std::any::TypeId::of::<T>())?
            .as_any_mut()
            .downcast_mut::<TypedMap<T>>()?
            .entries
            .get_mut(&entity)
    }

    pub fn has<T: 'static>(&self, entity: Entity) -> bool {
        self.get::<T>(entity).is_some()
    }

    pub fn remove<T: 'static>(&mut self, entity: Entity) -> Option<T> {
        self.typed
            .get_mut(&std::any::TypeId::of::<T>())?
            .as_any_mut()
            .downcast_mut::<TypedMap<T>>()?
            .entries
            .remove(&entity)
    }

    /// Move a component out of the registry for exclusive use during a tick.
    pub fn take<T: 'static>(&mut self, entity: Entity) -> Option<T> {
        self.remove::<T>(entity)
    }

    pub fn get_or_insert_with<T: 'static>(
        &mut self,
        entity: Entity,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        self.map_mut::<T>().entries.entry(entity).or_insert_with(init)
    }

    pub fn iter_components<T: 'static>(&self) -> Vec<(Entity, &T)> {
        let mut out = Vec::new();
        if let Some(map) = self.map::<T>() {
            for &entity in &self.live {
                if let Some(component) = map.entries.get(&entity) {
                    out.push((entity, component));
                }
            }
        }
        out
    }

    // Opaque data-driven components.

    /// Attach (or replace) an opaque component; its type tag is the value's
    /// registered type id. Empty values are rejected.
    pub fn emplace_meta(&mut self, entity: Entity, component: Value) -> bool {
        let Some(type_id) = component.type_id() else {
            warn!(entity = entity.0, "refusing to attach empty component value");
            return false;
        };
        if !self.is_alive(entity) {
            return false;
        }
        self.meta
            .entry(type_id)
            .or_default()
            .insert(entity, component);
        true
    }

    pub fn get_meta(&self, entity: Entity, type_id: TypeId) -> Option<&Value> {
        self.meta.get(&type_id)?.get(&entity)
    }

    pub fn get_meta_mut(&mut self, entity: Entity, type_id: TypeId) -> Option<&mut Value> {
        self.meta.get_mut(&type_id)?.get_mut(&entity)
    }

    pub fn has_meta(&self, entity: Entity, type_id: TypeId) -> bool {
        self.get_meta(entity, type_id).is_some()
    }

    pub fn remove_meta(&mut self, entity: Entity, type_id: TypeId) -> Option<Value> {
        self.meta.get_mut(&type_id)?.remove(&entity)
    }

    // Names.

    pub fn set_name(&mut self, entity: Entity, name: Symbol) {
        if let Some(previous) = self.names_reverse.insert(entity, name) {
            self.names.remove(&previous);
        }
        self.names.insert(name, entity);
    }

    pub fn name_of(&self, entity: Entity) -> Option<Symbol> {
        self.names_reverse.get(&entity).copied()
    }

    pub fn find_named(&self, name: Symbol) -> Option<Entity> {
        self.names.get(&name).copied().filter(|&e| self.is_alive(e))
    }

    // Relationships.

    /// Re-home an entity under a new parent. Returns the previous parent.
    pub fn set_parent(&mut self, entity: Entity, parent: Option<Entity>) -> Option<Entity> {
        let previous = self.detach_from_parent(entity);
        if let Some(parent) = parent {
            self.parents.insert(entity, parent);
            self.children.entry(parent).or_default().push(entity);
        }
        previous
    }

    fn detach_from_parent(&mut self, entity: Entity) -> Option<Entity> {
        let previous = self.parents.remove(&entity);
        if let Some(parent) = previous {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&c| c != entity);
            }
        }
        previous
    }

    pub fn parent_of(&self, entity: Entity) -> Option<Entity> {
        self.parents.get(&entity).copied()
    }

    pub fn children_of(&self, entity: Entity) -> &[Entity] {
        self.children
            .get(&entity)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Walk ancestors, nearest first, until the callback returns false.
    pub fn enumerate_parents(&self, entity: Entity, mut callback: impl FnMut(Entity) -> bool) {
        let mut current = self.parent_of(entity);
        while let Some(parent) = current {
            if !callback(parent) {
                break;
            }
            current = self.parent_of(parent);
        }
    }

    pub fn find_child_by_name(
        &self,
        entity: Entity,
        name: Symbol,
        recursive: bool,
    ) -> Option<Entity> {
        for &child in self.children_of(entity) {
            if self.name_of(child) == Some(name) {
                return Some(child);
            }
        }
        if recursive {
            for &child in self.children_of(entity) {
                if let Some(found) = self.find_child_by_name(child, name, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// First live entity owned by the given player index.
    pub fn player(&self, player_index: PlayerIndex) -> Option<Entity> {
        self.iter_components::<PlayerComponent>()
            .into_iter()
            .find(|(_, c)| c.player_index == player_index)
            .map(|(e, _)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::register_basic;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Tag(u32);

    #[test]
    fn test_typed_component_lifecycle() {
        let mut registry = Registry::new();
        let e = registry.create();
        assert!(registry.insert(e, Tag(1)).is_none());
        assert_eq!(registry.get::<Tag>(e), Some(&Tag(1)));
        registry.get_mut::<Tag>(e).unwrap().0 = 2;
        assert_eq!(registry.remove::<Tag>(e), Some(Tag(2)));
        assert!(registry.get::<Tag>(e).is_none());
    }

    #[test]
    fn test_meta_component_lifecycle() {
        #[derive(Clone, PartialEq, Debug)]
        struct Fuel(f32);
        let type_id = register_basic::<Fuel>("Fuel");

        let mut registry = Registry::new();
        let e = registry.create();
        assert!(registry.emplace_meta(e, Value::new(Fuel(3.0))));
        assert!(registry.has_meta(e, type_id));
        let removed = registry.remove_meta(e, type_id).unwrap();
        assert_eq!(removed.get_ref::<Fuel>(), Some(&Fuel(3.0)));
    }

    #[test]
    fn test_relationships() {
        let mut registry = Registry::new();
        let root = registry.create();
        let mid = registry.create();
        let leaf = registry.create();
        registry.set_parent(mid, Some(root));
        registry.set_parent(leaf, Some(mid));

        let mut walked = Vec::new();
        registry.enumerate_parents(leaf, |p| {
            walked.push(p);
            true
        });
        assert_eq!(walked, vec![mid, root]);

        registry.set_name(leaf, Symbol::of("leaf"));
        assert_eq!(
            registry.find_child_by_name(root, Symbol::of("leaf"), true),
            Some(leaf)
        );
        assert_eq!(
            registry.find_child_by_name(root, Symbol::of("leaf"), false),
            None
        );
    }

    #[test]
    fn test_destroy_cleans_up() {
        let mut registry = Registry::new();
        let parent = registry.create();
        let child = registry.create();
        registry.set_parent(child, Some(parent));
        registry.set_name(child, Symbol::of("child"));
        registry.insert(child, Tag(9));

        assert!(registry.destroy(child));
        assert!(!registry.is_alive(child));
        assert!(registry.find_named(Symbol::of("child")).is_none());
        assert!(registry.children_of(parent).is_empty());
    }

    #[test]
    fn test_player_lookup() {
        let mut registry = Registry::new();
        let a = registry.create();
        let b = registry.create();
        registry.insert(a, PlayerComponent { player_index: 0 });
        registry.insert(b, PlayerComponent { player_index: 1 });
        assert_eq!(registry.player(1), Some(b));
        assert_eq!(registry.player(5), None);
    }
}
