//! Runtime events.
//!
//! The runtime reports state and thread lifecycle changes through these
//! payloads. They are delivered to the host via the system outbox and,
//! because each is a registered value type, they can also satisfy yield
//! conditions and state rules like any authored event.

use once_cell::sync::OnceCell;

use strand_core::descriptor::StateInfo;
use strand_core::registry::entity_value_type;
use strand_core::value::TypeBuilder;
use strand_core::variables::VariableScope;
use strand_core::{Entity, InstructionIndex, Symbol, ThreadIndex, TypeId, Value};

/// Triggers when a state change takes place.
#[derive(Clone, Debug)]
pub struct OnStateChange {
    pub entity: Entity,
    pub from: StateInfo,
    pub to: StateInfo,
    /// Whether `to` has already been activated. False while a state with an
    /// activation delay is pending.
    pub state_activated: bool,
}

/// Triggers after a state has finished activating.
#[derive(Clone, Debug)]
pub struct OnStateActivate {
    pub entity: Entity,
    pub state: StateInfo,
}

/// Common identification for thread lifecycle events.
#[derive(Clone, Copy, Debug)]
pub struct ThreadEventInfo {
    pub entity: Entity,
    pub thread_index: Option<ThreadIndex>,
    pub thread_id: Option<Symbol>,
    /// Local instance index at emission time; not guaranteed to stay valid.
    pub local_instance: usize,
    pub last_instruction_index: InstructionIndex,
}

#[derive(Clone, Debug)]
pub struct OnThreadSpawn(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadComplete(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadTerminated(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadPaused(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadResumed(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadAttach(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadDetach(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadUnlink(pub ThreadEventInfo);

#[derive(Clone, Debug)]
pub struct OnThreadVariableUpdate {
    pub info: ThreadEventInfo,
    pub resolved_variable_name: Symbol,
    pub variable_scope: VariableScope,
    pub variable_update_result: Value,
}

#[derive(Clone, Debug)]
pub struct OnThreadEventCaptured {
    pub info: ThreadEventInfo,
    pub event_type_id: TypeId,
}

/// One or more of an entity's threads changed this tick.
#[derive(Clone, Debug)]
pub struct OnEntityThreadsUpdated {
    pub entity: Entity,
}

/// Host-facing envelope for every runtime event.
#[derive(Clone, Debug)]
pub enum RuntimeEvent {
    StateChange(OnStateChange),
    StateActivate(OnStateActivate),
    ThreadSpawn(OnThreadSpawn),
    ThreadComplete(OnThreadComplete),
    ThreadTerminated(OnThreadTerminated),
    ThreadPaused(OnThreadPaused),
    ThreadResumed(OnThreadResumed),
    ThreadAttach(OnThreadAttach),
    ThreadDetach(OnThreadDetach),
    ThreadUnlink(OnThreadUnlink),
    ThreadVariableUpdate(OnThreadVariableUpdate),
    ThreadEventCaptured(OnThreadEventCaptured),
    EntityThreadsUpdated(OnEntityThreadsUpdated),
}

impl RuntimeEvent {
    /// Convert into an opaque event payload for listener delivery.
    pub fn to_value(&self) -> Value {
        install_event_types();
        match self {
            RuntimeEvent::StateChange(e) => Value::new(e.clone()),
            RuntimeEvent::StateActivate(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadSpawn(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadComplete(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadTerminated(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadPaused(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadResumed(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadAttach(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadDetach(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadUnlink(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadVariableUpdate(e) => Value::new(e.clone()),
            RuntimeEvent::ThreadEventCaptured(e) => Value::new(e.clone()),
            RuntimeEvent::EntityThreadsUpdated(e) => Value::new(e.clone()),
        }
    }
}

fn thread_event_members<T: Clone + 'static>(
    builder: TypeBuilder<T>,
    info: fn(&T) -> &ThreadEventInfo,
) -> TypeBuilder<T> {
    builder
        .member_get("entity", move |e| Value::new(info(e).entity))
        .member_get("thread_id", move |e| match info(e).thread_id {
            Some(id) => Value::new(id.0),
            None => Value::empty(),
        })
        .member_get("thread_index", move |e| match info(e).thread_index {
            Some(index) => Value::new(index),
            None => Value::empty(),
        })
}

/// Register every runtime event as a value type (idempotent).
pub fn install_event_types() {
    static DONE: OnceCell<()> = OnceCell::new();
    DONE.get_or_init(|| {
        entity_value_type();

        TypeBuilder::<OnStateChange>::new("OnStateChange")
            .cloneable()
            .member_get("entity", |e| Value::new(e.entity))
            .member_get("state_activated", |e| Value::new(e.state_activated))
            .member_get("to", |e| match e.to.id {
                Some(id) => Value::new(id.0),
                None => Value::empty(),
            })
            .member_get("from", |e| match e.from.id {
                Some(id) => Value::new(id.0),
                None => Value::empty(),
            })
            .register();

        TypeBuilder::<OnStateActivate>::new("OnStateActivate")
            .cloneable()
            .member_get("entity", |e| Value::new(e.entity))
            .member_get("state", |e| match e.state.id {
                Some(id) => Value::new(id.0),
                None => Value::empty(),
            })
            .register();

        thread_event_members(TypeBuilder::<OnThreadSpawn>::new("OnThreadSpawn"), |e| &e.0)
            .cloneable()
            .register();
        thread_event_members(
            TypeBuilder::<OnThreadComplete>::new("OnThreadComplete"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadTerminated>::new("OnThreadTerminated"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadPaused>::new("OnThreadPaused"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadResumed>::new("OnThreadResumed"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadAttach>::new("OnThreadAttach"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadDetach>::new("OnThreadDetach"),
            |e| &e.0,
        )
        .cloneable()
        .register();
        thread_event_members(
            TypeBuilder::<OnThreadUnlink>::new("OnThreadUnlink"),
            |e| &e.0,
        )
        .cloneable()
        .register();

        thread_event_members(
            TypeBuilder::<OnThreadVariableUpdate>::new("OnThreadVariableUpdate"),
            |e| &e.info,
        )
        .cloneable()
        .member_get("resolved_variable_name", |e| {
            Value::new(e.resolved_variable_name.0)
        })
        .register();

        thread_event_members(
            TypeBuilder::<OnThreadEventCaptured>::new("OnThreadEventCaptured"),
            |e| &e.info,
        )
        .cloneable()
        .member_get("event_type_id", |e| Value::new(e.event_type_id.0))
        .register();

        TypeBuilder::<OnEntityThreadsUpdated>::new("OnEntityThreadsUpdated")
            .cloneable()
            .member_get("entity", |e| Value::new(e.entity))
            .register();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_events_convert_to_values() {
        let event = RuntimeEvent::ThreadSpawn(OnThreadSpawn(ThreadEventInfo {
            entity: Entity(4),
            thread_index: Some(1),
            thread_id: Some(Symbol::of("patrol")),
            local_instance: 0,
            last_instruction_index: 0,
        }));
        let value = event.to_value();
        assert!(!value.is_empty());
        assert_eq!(
            value.member(Symbol::of("entity")).get_ref::<Entity>(),
            Some(&Entity(4))
        );
        assert_eq!(
            value.member(Symbol::of("thread_id")).as_i64(),
            Some(Symbol::of("patrol").0 as i64)
        );
    }
}
