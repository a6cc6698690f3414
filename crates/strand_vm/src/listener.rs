//! Per-event-type listeners.
//!
//! For each event type observed by any state rule or yield condition, the
//! system holds one listener. A listener tracks subscribed entities with
//! reference counts: each active subscription increments; removal
//! decrements, erasing the entry at zero. Forced removal ignores the count.

use smallvec::SmallVec;

use strand_core::{Entity, TypeId, Value};

pub type ReferenceCount = u16;

#[derive(Clone, Copy, Debug)]
struct Reference {
    entity: Entity,
    reference_count: ReferenceCount,
}

pub struct EntityListener {
    type_id: TypeId,
    listening_entities: SmallVec<[Reference; 8]>,
}

impl EntityListener {
    pub fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            listening_entities: SmallVec::new(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Subscribe an entity, or bump its reference count. Returns true only
    /// when the entity was newly added.
    pub fn add_entity(&mut self, entity: Entity) -> bool {
        for entry in &mut self.listening_entities {
            if entry.entity == entity {
                entry.reference_count += 1;
                return false;
            }
        }
        self.listening_entities.push(Reference {
            entity,
            reference_count: 1,
        });
        true
    }

    /// Drop `references_to_remove` references; the entry is erased when the
    /// count reaches zero, or unconditionally when `force` is set. Returns
    /// true when the entity was removed entirely.
    pub fn remove_entity(
        &mut self,
        entity: Entity,
        references_to_remove: ReferenceCount,
        force: bool,
    ) -> bool {
        let Some(position) = self
            .listening_entities
            .iter()
            .position(|entry| entry.entity == entity)
        else {
            return false;
        };

        if force || self.listening_entities[position].reference_count <= references_to_remove {
            self.listening_entities.remove(position);
            return true;
        }

        self.listening_entities[position].reference_count -= references_to_remove;
        false
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.listening_entities
            .iter()
            .any(|entry| entry.entity == entity)
    }

    pub fn reference_count(&self, entity: Entity) -> ReferenceCount {
        self.listening_entities
            .iter()
            .find(|entry| entry.entity == entity)
            .map(|entry| entry.reference_count)
            .unwrap_or(0)
    }

    pub fn has_listening_entity(&self) -> bool {
        !self.listening_entities.is_empty()
    }

    /// Snapshot of subscribed entities in subscription order. Delivery
    /// iterates the snapshot, so subscriptions added by handlers are not
    /// visited within the same delivery.
    pub fn entities(&self) -> Vec<Entity> {
        self.listening_entities.iter().map(|e| e.entity).collect()
    }

    /// Whether an incoming payload matches this listener.
    pub fn accepts(&self, event: &Value) -> bool {
        event.type_id() == Some(self.type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_counting() {
        let mut listener = EntityListener::new(TypeId::of("Evt"));
        let e = Entity(1);
        assert!(listener.add_entity(e));
        assert!(!listener.add_entity(e));
        assert_eq!(listener.reference_count(e), 2);

        assert!(!listener.remove_entity(e, 1, false));
        assert!(listener.contains(e));
        assert!(listener.remove_entity(e, 1, false));
        assert!(!listener.contains(e));
    }

    #[test]
    fn test_forced_removal_ignores_count() {
        let mut listener = EntityListener::new(TypeId::of("Evt"));
        let e = Entity(2);
        listener.add_entity(e);
        listener.add_entity(e);
        listener.add_entity(e);
        assert!(listener.remove_entity(e, 1, true));
        assert!(!listener.contains(e));
    }

    #[test]
    fn test_bulk_reference_removal() {
        let mut listener = EntityListener::new(TypeId::of("Evt"));
        let e = Entity(3);
        listener.add_entity(e);
        listener.add_entity(e);
        listener.add_entity(e);
        assert!(!listener.remove_entity(e, 2, false));
        assert_eq!(listener.reference_count(e), 1);
        assert!(listener.remove_entity(e, 2, false));
    }

    #[test]
    fn test_subscription_order_snapshot() {
        let mut listener = EntityListener::new(TypeId::of("Evt"));
        listener.add_entity(Entity(5));
        listener.add_entity(Entity(2));
        listener.add_entity(Entity(9));
        assert_eq!(listener.entities(), vec![Entity(5), Entity(2), Entity(9)]);
    }
}
