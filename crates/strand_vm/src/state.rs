//! State machine: activation, decay, and per-state component staging.
//!
//! Activation ordering is copy → freeze → retrieve → remove → add → persist,
//! then the state component update and immediate threads. Decay runs thread
//! teardown → store → conditional removal of added components → unfreeze →
//! persist re-assertion (without value assignment).

use std::collections::HashMap;

use tracing::warn;

use strand_core::descriptor::{EntityDescriptor, EntityState, TypeDescriptor};
use strand_core::registry::Registry;
use strand_core::{Entity, StateIndex, TypeId};

use crate::context::entity_variable_context;
use crate::thread_component::ThreadComponent;

/// Indicates which state an entity is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateComponent {
    pub state_index: StateIndex,
    pub prev_state_index: StateIndex,
}

/// Component instances staged for one state.
#[derive(Default)]
pub struct ComponentStore {
    components: Vec<strand_core::Value>,
}

impl ComponentStore {
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.components
            .iter()
            .any(|c| c.type_id() == Some(type_id))
    }

    pub fn get(&self, type_id: TypeId) -> Option<&strand_core::Value> {
        self.components
            .iter()
            .find(|c| c.type_id() == Some(type_id))
    }

    fn put(&mut self, value: strand_core::Value) {
        let Some(type_id) = value.type_id() else {
            return;
        };
        match self
            .components
            .iter_mut()
            .find(|c| c.type_id() == Some(type_id))
        {
            Some(slot) => *slot = value,
            None => self.components.push(value),
        }
    }

    /// Stage components from the live entity.
    ///
    /// * `copy` — clone and leave the live instance in place; otherwise the
    ///   instance is moved out of the registry.
    /// * `only_if_missing` — skip types already staged (one-time copies).
    pub fn store(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        types: &[TypeId],
        copy: bool,
        only_if_missing: bool,
    ) -> usize {
        let mut stored = 0;
        for &type_id in types {
            if only_if_missing && self.contains(type_id) {
                continue;
            }
            let staged = if copy {
                registry.get_meta(entity, type_id).cloned()
            } else {
                registry.remove_meta(entity, type_id)
            };
            match staged {
                Some(value) => {
                    self.put(value);
                    stored += 1;
                }
                None => {}
            }
        }
        stored
    }

    /// Move every staged component back onto the entity, overwriting live
    /// instances.
    pub fn retrieve(&mut self, registry: &mut Registry, entity: Entity) -> usize {
        let intended = self.components.len();
        let mut retrieved = 0;
        for value in self.components.drain(..) {
            if registry.emplace_meta(entity, value) {
                retrieved += 1;
            }
        }
        if retrieved != intended {
            warn!(
                entity = entity.0,
                intended, retrieved, "state storage retrieval incomplete"
            );
        }
        retrieved
    }
}

/// Per-state staging areas, keyed by state index.
#[derive(Default)]
pub struct StateStorageManager {
    stores: HashMap<StateIndex, ComponentStore>,
}

impl StateStorageManager {
    pub fn storage(&mut self, state_index: StateIndex) -> &mut ComponentStore {
        self.stores.entry(state_index).or_default()
    }

    pub fn peek(&self, state_index: StateIndex) -> Option<&ComponentStore> {
        self.stores.get(&state_index)
    }
}

/// Components stored while a state is inactive (`store` / `init_copy`).
#[derive(Default)]
pub struct StateStorageComponent(pub StateStorageManager);

/// Components temporarily excluded while a state is active (`freeze`).
#[derive(Default)]
pub struct FrozenStateComponent(pub StateStorageManager);

/// Write the state component directly, bypassing activation.
pub fn force_update_component(
    registry: &mut Registry,
    entity: Entity,
    self_index: StateIndex,
    prev_index: Option<StateIndex>,
) {
    registry.insert(
        entity,
        StateComponent {
            state_index: self_index,
            prev_state_index: prev_index.unwrap_or(self_index),
        },
    );
}

/// Establish `new_index` as the entity's current state: decay the previous
/// state (when requested) and activate the new one.
pub fn update(
    descriptor: &EntityDescriptor,
    registry: &mut Registry,
    entity: Entity,
    new_index: StateIndex,
    prev_index: Option<StateIndex>,
    decay_prev_state: bool,
    update_state_component: bool,
) {
    if decay_prev_state {
        if let Some(prev_index) = prev_index {
            let next_persist = descriptor
                .state(new_index)
                .map(|s| s.components.persist.as_slice());
            decay(descriptor, registry, entity, prev_index, next_persist);
        }
    }
    activate(
        descriptor,
        registry,
        entity,
        new_index,
        prev_index,
        update_state_component,
    );
}

/// Decay a state from `entity` without activating a successor.
pub fn decay(
    descriptor: &EntityDescriptor,
    registry: &mut Registry,
    entity: Entity,
    self_index: StateIndex,
    next_state_persist: Option<&[TypeDescriptor]>,
) {
    let Some(state) = descriptor.state(self_index) else {
        warn!(state_index = self_index, "decay of unknown state");
        return;
    };

    // Threads spawned by this state stop first.
    if let Some(threads) = registry.get_mut::<ThreadComponent>(entity) {
        threads.stop_state_threads_by_index(self_index);
    }

    // Store state-local component instances.
    with_storage::<StateStorageComponent>(registry, entity, |storage, registry| {
        storage
            .0
            .storage(self_index)
            .store(registry, entity, &state.components.store, false, false);
    });

    // Remove the components this state added, unless a persist list (ours or
    // the next state's) still wants them.
    if state.decay_policy.remove_add_components {
        for component in &state.components.add {
            let type_id = component.type_id;
            if next_state_persist
                .map(|persist| persist.iter().any(|d| d.type_id == type_id))
                .unwrap_or(false)
            {
                continue;
            }
            if state.components.persist_contains(type_id) {
                continue;
            }
            if state.decay_policy.keep_modified_add_components && component.force_field_assignment {
                continue;
            }
            registry.remove_meta(entity, type_id);
        }
    }

    // Unfreeze components excluded during this state, discarding live values.
    with_storage::<FrozenStateComponent>(registry, entity, |storage, registry| {
        storage.0.storage(self_index).retrieve(registry, entity);
    });

    // Re-assert persistent components without altering existing state; the
    // next state may depend on a component removed above.
    persist(state, registry, entity, false);
}

/// Activate a state for `entity` without decaying the previous one.
pub fn activate(
    descriptor: &EntityDescriptor,
    registry: &mut Registry,
    entity: Entity,
    self_index: StateIndex,
    prev_index: Option<StateIndex>,
    update_state_component: bool,
) {
    let Some(state) = descriptor.state(self_index) else {
        warn!(state_index = self_index, "activation of unknown state");
        return;
    };

    // Copies stage into storage so the freeze/retrieve pair below swaps the
    // live instance for the copy.
    with_storage::<StateStorageComponent>(registry, entity, |storage, registry| {
        let store = storage.0.storage(self_index);
        store.store(registry, entity, &state.components.local_copy, true, false);
        store.store(registry, entity, &state.components.init_copy, true, true);
    });

    with_storage::<FrozenStateComponent>(registry, entity, |storage, registry| {
        storage
            .0
            .storage(self_index)
            .store(registry, entity, &state.components.freeze, false, false);
    });

    with_storage::<StateStorageComponent>(registry, entity, |storage, registry| {
        storage.0.storage(self_index).retrieve(registry, entity);
    });

    for &type_id in &state.components.remove {
        if registry.remove_meta(entity, type_id).is_none() {
            warn!(type_id = type_id.0, "removal of absent component");
        }
    }

    add(state, registry, entity);
    persist(state, registry, entity, true);

    if update_state_component {
        force_update_component(registry, entity, self_index, prev_index);
    }

    if !state.immediate_threads.is_empty() {
        let mut threads = registry.take::<ThreadComponent>(entity).unwrap_or_default();
        threads.start_state_threads(descriptor, state, self_index, false);
        registry.insert(entity, threads);
    }
}

fn add(state: &EntityState, registry: &mut Registry, entity: Entity) {
    let variables = entity_variable_context(registry, entity);
    for component in &state.components.add {
        let type_id = component.type_id;
        let reuse_existing =
            component.force_field_assignment || state.components.persist_contains(type_id);
        let existing = registry.get_meta(entity, type_id).cloned();
        let value = match (reuse_existing, existing) {
            (true, Some(mut existing)) => {
                component.apply_assignments(&mut existing, registry, Some(entity), &variables);
                existing
            }
            _ => component.instantiate(registry, Some(entity), &variables),
        };
        if !value.is_empty() {
            registry.emplace_meta(entity, value);
        }
    }
}

fn persist(state: &EntityState, registry: &mut Registry, entity: Entity, value_assignment: bool) {
    let variables = entity_variable_context(registry, entity);
    for component in &state.components.persist {
        let type_id = component.type_id;
        match registry.get_meta(entity, type_id).cloned() {
            Some(mut existing) => {
                if value_assignment {
                    component.apply_assignments(&mut existing, registry, Some(entity), &variables);
                    registry.emplace_meta(entity, existing);
                }
            }
            None => {
                let fresh = component.instantiate(registry, Some(entity), &variables);
                if !fresh.is_empty() {
                    registry.emplace_meta(entity, fresh);
                }
            }
        }
    }
}

/// Take a staging component out of the registry, run `f` with it and the
/// registry, and put it back. Keeps the borrow checker out of the staging
/// logic, which needs the registry mutable while the store mutates.
fn with_storage<T: 'static + Default>(
    registry: &mut Registry,
    entity: Entity,
    f: impl FnOnce(&mut T, &mut Registry),
) {
    let mut storage = registry.take::<T>(entity).unwrap_or_default();
    f(&mut storage, registry);
    registry.insert(entity, storage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::value::TypeBuilder;
    use strand_core::Value;

    #[derive(Clone, PartialEq, Debug, Default)]
    struct Heat {
        degrees: i64,
    }

    fn heat_type() -> TypeId {
        TypeBuilder::<Heat>::new("StateTestHeat")
            .cloneable()
            .comparable()
            .defaulted()
            .member(
                "degrees",
                |h| Value::new(h.degrees),
                |h, v| match v.as_i64() {
                    Some(value) => {
                        h.degrees = value;
                        true
                    }
                    None => false,
                },
            )
            .register()
    }

    #[test]
    fn test_store_moves_and_retrieve_restores() {
        let heat = heat_type();
        let mut registry = Registry::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Heat { degrees: 60 }));

        let mut store = ComponentStore::default();
        assert_eq!(store.store(&mut registry, e, &[heat], false, false), 1);
        assert!(!registry.has_meta(e, heat));

        assert_eq!(store.retrieve(&mut registry, e), 1);
        assert_eq!(
            registry
                .get_meta(e, heat)
                .unwrap()
                .member(strand_core::Symbol::of("degrees"))
                .as_i64(),
            Some(60)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_copy_only_if_missing_runs_once() {
        let heat = heat_type();
        let mut registry = Registry::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Heat { degrees: 10 }));

        let mut store = ComponentStore::default();
        assert_eq!(store.store(&mut registry, e, &[heat], true, true), 1);
        // Live instance changes; a second one-time copy must not refresh.
        registry.emplace_meta(e, Value::new(Heat { degrees: 99 }));
        assert_eq!(store.store(&mut registry, e, &[heat], true, true), 0);
        assert_eq!(
            store
                .get(heat)
                .unwrap()
                .member(strand_core::Symbol::of("degrees"))
                .as_i64(),
            Some(10)
        );
    }

    #[test]
    fn test_freeze_unfreeze_identity() {
        let heat = heat_type();
        let mut registry = Registry::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Heat { degrees: 42 }));

        let mut descriptor = EntityDescriptor::new();
        let mut frozen_state = strand_core::descriptor::EntityState::named("frozen");
        frozen_state.components.build_frozen(heat);
        let frozen_index = descriptor.add_state(frozen_state);
        let plain_index = descriptor.add_state(strand_core::descriptor::EntityState::named("plain"));

        activate(&descriptor, &mut registry, e, frozen_index, None, true);
        assert!(!registry.has_meta(e, heat));

        update(
            &descriptor,
            &mut registry,
            e,
            plain_index,
            Some(frozen_index),
            true,
            true,
        );
        let restored = registry.get_meta(e, heat).unwrap();
        assert_eq!(
            restored.member(strand_core::Symbol::of("degrees")).as_i64(),
            Some(42)
        );
    }

    #[test]
    fn test_decay_removes_added_components() {
        let heat = heat_type();
        let mut registry = Registry::new();
        let e = registry.create();

        let mut descriptor = EntityDescriptor::new();
        let mut hot = strand_core::descriptor::EntityState::named("hot");
        hot.components
            .add
            .push(TypeDescriptor::of(heat).with_field("degrees", Value::new(80i64)));
        let hot_index = descriptor.add_state(hot);
        let cold_index = descriptor.add_state(strand_core::descriptor::EntityState::named("cold"));

        activate(&descriptor, &mut registry, e, hot_index, None, true);
        assert!(registry.has_meta(e, heat));

        update(
            &descriptor,
            &mut registry,
            e,
            cold_index,
            Some(hot_index),
            true,
            true,
        );
        assert!(!registry.has_meta(e, heat));
        let state = registry.get::<StateComponent>(e).unwrap();
        assert_eq!(state.state_index, cold_index);
        assert_eq!(state.prev_state_index, hot_index);
    }

    #[test]
    fn test_persist_survives_transition() {
        let heat = heat_type();
        let mut registry = Registry::new();
        let e = registry.create();

        let mut descriptor = EntityDescriptor::new();
        let mut a = strand_core::descriptor::EntityState::named("a");
        a.components
            .add
            .push(TypeDescriptor::of(heat).with_field("degrees", Value::new(5i64)));
        a.components.persist.push(TypeDescriptor::of(heat));
        let a_index = descriptor.add_state(a);

        let mut b = strand_core::descriptor::EntityState::named("b");
        b.components.persist.push(TypeDescriptor::of(heat));
        let b_index = descriptor.add_state(b);

        activate(&descriptor, &mut registry, e, a_index, None, true);
        registry
            .get_meta_mut(e, heat)
            .unwrap()
            .set_member(strand_core::Symbol::of("degrees"), Value::new(33i64));

        update(&descriptor, &mut registry, e, b_index, Some(a_index), true, true);
        // Persisted by both states: the modified instance survives.
        assert_eq!(
            registry
                .get_meta(e, heat)
                .unwrap()
                .member(strand_core::Symbol::of("degrees"))
                .as_i64(),
            Some(33)
        );
    }
}
