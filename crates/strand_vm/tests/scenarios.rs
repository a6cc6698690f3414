//! End-to-end runtime scenarios: rules firing state transitions, yields
//! waking on events, multi-blocks with rewinds, compiled if/else shapes,
//! detached threads surviving state changes, and context inheritance.

use std::sync::Arc;
use std::time::Duration;

use strand_core::condition::{Condition, SingleCondition};
use strand_core::descriptor::{
    EntityDescriptor, EntityState, RuleAction, StateRule, ThreadDescription, TypeDescriptor,
};
use strand_core::indirect::VariableTarget;
use strand_core::instruction::{Cadence, Instruction, ThreadRange, ThreadRef, ThreadTarget};
use strand_core::ops::CompareMethod;
use strand_core::target::EntityTarget;
use strand_core::value::TypeBuilder;
use strand_core::variables::VariableScope;
use strand_core::{Registry, Symbol, TypeId, Value};
use strand_vm::command::Command;
use strand_vm::context::ContextComponent;
use strand_vm::events::RuntimeEvent;
use strand_vm::state::StateComponent;
use strand_vm::{BehaviorSystem, ThreadComponent};

const TICK: Duration = Duration::from_millis(16);

#[derive(Clone, PartialEq, Debug)]
struct Impact {
    strength: i64,
}

fn impact_type() -> TypeId {
    TypeBuilder::<Impact>::new("ScenarioImpact")
        .cloneable()
        .comparable()
        .member_get("strength", |i| Value::new(i.strength))
        .register()
}

#[derive(Clone, PartialEq, Debug)]
struct OnSignal {
    kind: i64,
}

fn signal_type() -> TypeId {
    TypeBuilder::<OnSignal>::new("ScenarioSignal")
        .cloneable()
        .comparable()
        .member_get("kind", |s| Value::new(s.kind))
        .register()
}

#[derive(Clone, PartialEq, Debug, Default)]
struct Ward {
    charge: i64,
}

fn ward_type() -> TypeId {
    TypeBuilder::<Ward>::new("ScenarioWard")
        .cloneable()
        .comparable()
        .defaulted()
        .member(
            "charge",
            |w| Value::new(w.charge),
            |w, v| match v.as_i64() {
                Some(value) => {
                    w.charge = value;
                    true
                }
                None => false,
            },
        )
        .register()
}

fn assign_local(name: &str, value: i64) -> Instruction {
    Instruction::VariableAssignment {
        target_entity: EntityTarget::SelfTarget,
        thread_id: None,
        variable: Some(VariableTarget::new(VariableScope::Local, Symbol::of(name))),
        expr: strand_core::expr::ValueExpr::literal(Value::new(value)),
        ignore_if_already_assigned: false,
        ignore_if_not_declared: false,
    }
}

fn assign_global(name: &str, value: i64) -> Instruction {
    Instruction::VariableAssignment {
        target_entity: EntityTarget::SelfTarget,
        thread_id: None,
        variable: Some(VariableTarget::new(VariableScope::Global, Symbol::of(name))),
        expr: strand_core::expr::ValueExpr::literal(Value::new(value)),
        ignore_if_already_assigned: false,
        ignore_if_not_declared: false,
    }
}

fn global_var(registry: &Registry, entity: strand_core::Entity, name: &str) -> Option<i64> {
    registry
        .get::<ThreadComponent>(entity)?
        .global_variables
        .as_ref()?
        .borrow()
        .get(Symbol::of(name))?
        .as_i64()
}

#[test]
fn test_immediate_state_transition() {
    let impact = impact_type();

    let mut descriptor = EntityDescriptor::new();
    let condition = descriptor.add_condition(Condition::Single(SingleCondition::new(
        Some(impact),
        Some(Symbol::of("strength")),
        Value::new(0i64),
        CompareMethod::GreaterThan,
    )));
    let mut idle = EntityState::named("idle");
    idle.add_rule(
        impact,
        StateRule {
            condition: Some(condition),
            delay: None,
            target: EntityTarget::SelfTarget,
            action: RuleAction::Transition {
                state_name: Symbol::of("stunned"),
            },
        },
    );
    let idle_index = descriptor.add_state(idle);
    let stunned_index = descriptor.add_state(EntityState::named("stunned"));
    descriptor.default_state_index = Some(idle_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));
    assert_eq!(system.state_index(&registry, entity), Some(idle_index));
    system.drain_events();

    // A zero-strength impact does not satisfy the rule condition.
    system.dispatch_event(&mut registry, Value::new(Impact { strength: 0 }));
    assert_eq!(system.state_index(&registry, entity), Some(idle_index));

    system.dispatch_event(&mut registry, Value::new(Impact { strength: 3 }));
    let state = registry.get::<StateComponent>(entity).unwrap();
    assert_eq!(state.state_index, stunned_index);
    assert_eq!(state.prev_state_index, idle_index);

    let events = system.drain_events();
    let changes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::StateChange(change) => Some(change),
            _ => None,
        })
        .collect();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].state_activated);
    assert_eq!(changes[0].to.index, stunned_index);
    assert_eq!(changes[0].from.index, idle_index);
    let activations = events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::StateActivate(_)))
        .count();
    assert_eq!(activations, 1);
}

#[test]
fn test_yield_and_resume() {
    let signal = signal_type();

    let mut descriptor = EntityDescriptor::new();
    let condition = descriptor.add_condition(Condition::Single(SingleCondition::new(
        Some(signal),
        Some(Symbol::of("kind")),
        Value::new(7i64),
        CompareMethod::Equal,
    )));
    descriptor.add_thread(ThreadDescription::named("watcher").with_instructions(vec![
        Instruction::Yield { condition },
        assign_local("k", 42),
        Instruction::Stop {
            thread: ThreadRef::current(),
            check_linked: true,
        },
    ]));
    let mut main = EntityState::named("main");
    main.immediate_threads.push(ThreadRange::single(0));
    let main_index = descriptor.add_state(main);
    descriptor.default_state_index = Some(main_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));

    // First tick: the thread parks on the yield.
    system.update(&mut registry, TICK);
    {
        let threads = registry.get::<ThreadComponent>(entity).unwrap();
        assert!(threads.threads[0].flags.yielding);
    }
    assert_eq!(
        system.listener(signal).map(|l| l.reference_count(entity)),
        Some(1)
    );

    // A non-matching signal leaves the thread parked.
    system.dispatch_event(&mut registry, Value::new(OnSignal { kind: 3 }));
    assert!(registry.get::<ThreadComponent>(entity).unwrap().threads[0]
        .flags
        .yielding);

    system.drain_events();
    system.dispatch_event(&mut registry, Value::new(OnSignal { kind: 7 }));
    {
        let threads = registry.get::<ThreadComponent>(entity).unwrap();
        assert!(!threads.threads[0].flags.yielding);
        assert_eq!(threads.threads[0].next_instruction, 1);
    }
    // The wake consumed the listener reference.
    assert_eq!(
        system
            .listener(signal)
            .map(|l| l.reference_count(entity))
            .unwrap_or(0),
        0
    );

    // Assignment step.
    system.update(&mut registry, TICK);
    let variable_updates = system
        .drain_events()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                RuntimeEvent::ThreadVariableUpdate(update)
                    if update.resolved_variable_name == Symbol::of("k")
                        && update.variable_scope == VariableScope::Local
                        && update.variable_update_result.as_i64() == Some(42)
            )
        })
        .count();
    assert_eq!(variable_updates, 1);

    // Stop step: the thread terminates and leaves the container.
    system.update(&mut registry, TICK);
    assert!(registry
        .get::<ThreadComponent>(entity)
        .map(|t| t.threads.is_empty())
        .unwrap_or(true));
}

#[test]
fn test_multi_block_with_rewind_does_not_spin() {
    let mut descriptor = EntityDescriptor::new();
    descriptor.add_thread(
        ThreadDescription::named("looper")
            .with_cadence(Cadence::Realtime)
            .with_instructions(vec![
                Instruction::MultiBlock { size: 3 },
                assign_global("a", 1),
                assign_global("b", 2),
                Instruction::Rewind {
                    thread: ThreadRef::current(),
                    count: 3,
                    check_linked: true,
                },
            ]),
    );
    let mut main = EntityState::named("main");
    main.immediate_threads.push(ThreadRange::single(0));
    let main_index = descriptor.add_state(main);
    descriptor.default_state_index = Some(main_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));

    // One frame: the block runs both assignments, the rewind returns the
    // program counter to the block, and the realtime loop exits instead of
    // spinning within the tick.
    system.update(&mut registry, TICK);
    {
        let threads = registry.get::<ThreadComponent>(entity).unwrap();
        assert_eq!(threads.threads[0].next_instruction, 0);
        assert!(!threads.threads[0].flags.complete);
    }
    assert_eq!(global_var(&registry, entity, "a"), Some(1));
    assert_eq!(global_var(&registry, entity, "b"), Some(2));

    // Next tick re-enters the block.
    system.update(&mut registry, TICK);
    assert_eq!(
        registry.get::<ThreadComponent>(entity).unwrap().threads[0].next_instruction,
        0
    );
}

#[test]
fn test_if_else_bytecode_shape() {
    for (condition_holds, expected) in [(true, 1i64), (false, 2i64)] {
        let mut descriptor = EntityDescriptor::new();
        let condition = descriptor.add_condition(if condition_holds {
            Condition::True
        } else {
            Condition::False
        });
        // if C: x = 1 else: x = 2, compiled to block + skip.
        descriptor.add_thread(ThreadDescription::named("branch").with_instructions(vec![
            Instruction::IfBlock { condition, size: 2 },
            assign_global("x", 1),
            Instruction::Skip {
                thread: ThreadRef::current(),
                count: 1,
                check_linked: true,
            },
            assign_global("x", 2),
        ]));
        let mut main = EntityState::named("main");
        main.immediate_threads.push(ThreadRange::single(0));
        let main_index = descriptor.add_state(main);
        descriptor.default_state_index = Some(main_index);

        let mut registry = Registry::new();
        let mut system = BehaviorSystem::new();
        let entity = system.instantiate(&mut registry, Arc::new(descriptor));

        for _ in 0..4 {
            system.update(&mut registry, TICK);
        }
        assert_eq!(
            global_var(&registry, entity, "x"),
            Some(expected),
            "condition_holds = {condition_holds}"
        );
    }
}

#[test]
fn test_detached_thread_survives_state_change() {
    let mut descriptor = EntityDescriptor::new();
    let never = descriptor.add_condition(Condition::False);
    let watcher = descriptor.add_thread(ThreadDescription::named("sentinel").with_instructions(
        vec![
            Instruction::Detach {
                thread: ThreadRef::current(),
                check_linked: true,
            },
            Instruction::Yield { condition: never },
        ],
    ));

    let mut armed = EntityState::named("armed");
    armed.immediate_threads.push(ThreadRange::single(watcher));
    let armed_index = descriptor.add_state(armed);
    let calm_index = descriptor.add_state(EntityState::named("calm"));
    descriptor.default_state_index = Some(armed_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));

    // Step the detach instruction and let the command land.
    system.update(&mut registry, TICK);
    assert!(registry.get::<ThreadComponent>(entity).unwrap().threads[0]
        .flags
        .detached);

    assert!(system.set_state_named(&mut registry, entity, "calm"));
    system.pump(&mut registry);
    assert_eq!(system.state_index(&registry, entity), Some(calm_index));
    {
        let threads = registry.get::<ThreadComponent>(entity).unwrap();
        assert_eq!(threads.threads.len(), 1);
        assert!(threads.threads[0].flags.detached);
        assert!(!threads.threads[0].flags.linked);
    }

    // The name is free again: a second instance may spawn.
    system.queue_command(Command::ThreadSpawn {
        source: entity,
        target: entity,
        threads: ThreadTarget::Id(Symbol::of("sentinel")),
        restart_existing: false,
        state_index: Some(calm_index),
        parent_thread_name: None,
    });
    system.pump(&mut registry);
    let threads = registry.get::<ThreadComponent>(entity).unwrap();
    assert_eq!(threads.threads.len(), 2);
    assert!(threads.threads[1].flags.linked);
}

#[test]
fn test_context_inheritance_on_reparent() {
    let descriptor = Arc::new(EntityDescriptor::new());

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let parent = system.instantiate(&mut registry, descriptor.clone());
    let child = system.instantiate(&mut registry, descriptor);

    let set = |registry: &Registry, entity, name: &str, value: i64| {
        registry
            .get::<ContextComponent>(entity)
            .unwrap()
            .shared
            .as_ref()
            .unwrap()
            .borrow_mut()
            .variables
            .set(Symbol::of(name), Value::new(value));
    };
    let get = |registry: &Registry, entity, name: &str| -> Option<i64> {
        registry
            .get::<ContextComponent>(entity)?
            .shared
            .as_ref()?
            .borrow()
            .variables
            .get(Symbol::of(name))?
            .as_i64()
    };

    set(&registry, parent, "a", 1);
    set(&registry, child, "a", 2);
    set(&registry, child, "b", 3);

    system.reparent(&mut registry, child, Some(parent));

    let parent_component = registry.get::<ContextComponent>(parent).unwrap().clone();
    let child_component = registry.get::<ContextComponent>(child).unwrap().clone();
    assert!(parent_component.shares_with(&child_component));
    assert_eq!(get(&registry, child, "a"), Some(1));
    assert_eq!(get(&registry, child, "b"), Some(3));
}

#[test]
fn test_state_round_trip_restores_components() {
    let ward = ward_type();

    let mut descriptor = EntityDescriptor::new();
    descriptor
        .components
        .push(TypeDescriptor::of(ward).with_field("charge", Value::new(10i64)));

    let mut shielded = EntityState::named("shielded");
    shielded.components.build_frozen(ward);
    let shielded_index = descriptor.add_state(shielded);
    let mut open = EntityState::named("open");
    open.components
        .add
        .push(TypeDescriptor::of(ward).with_field("charge", Value::new(99i64)));
    let open_index = descriptor.add_state(open);
    descriptor.default_state_index = Some(shielded_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));

    // Frozen while shielded.
    assert!(!registry.has_meta(entity, ward));

    // A: shielded -> B: open. The frozen original comes back, then the add
    // overwrites it for the duration of the state.
    assert!(system.set_state_named(&mut registry, entity, "open"));
    assert_eq!(
        registry
            .get_meta(entity, ward)
            .unwrap()
            .member(Symbol::of("charge"))
            .as_i64(),
        Some(99)
    );

    // B -> A again: the add decays away and the original value is frozen in
    // state storage once more.
    assert!(system.set_state_named(&mut registry, entity, "shielded"));
    assert!(!registry.has_meta(entity, ward));

    // A second round trip behaves identically: the frozen payload survived
    // both transitions.
    assert!(system.set_state_named(&mut registry, entity, "open"));
    assert_eq!(
        registry
            .get_meta(entity, ward)
            .unwrap()
            .member(Symbol::of("charge"))
            .as_i64(),
        Some(99)
    );
    assert!(system.set_state_named(&mut registry, entity, "shielded"));
    assert!(!registry.has_meta(entity, ward));
    let _ = (shielded_index, open_index);
}

#[test]
fn test_declaration_then_assignment_emits_single_update() {
    let mut descriptor = EntityDescriptor::new();
    descriptor.add_thread(ThreadDescription::named("init").with_instructions(vec![
        Instruction::VariableDeclaration(VariableTarget::new(
            VariableScope::Local,
            Symbol::of("v"),
        )),
        assign_local("v", 42),
    ]));
    let mut main = EntityState::named("main");
    main.immediate_threads.push(ThreadRange::single(0));
    let main_index = descriptor.add_state(main);
    descriptor.default_state_index = Some(main_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let _entity = system.instantiate(&mut registry, Arc::new(descriptor));
    system.drain_events();

    system.update(&mut registry, TICK);
    system.update(&mut registry, TICK);

    let updates: Vec<_> = system
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::ThreadVariableUpdate(update) => Some(update),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].resolved_variable_name, Symbol::of("v"));
    assert_eq!(updates[0].variable_scope, VariableScope::Local);
    assert_eq!(updates[0].variable_update_result.as_i64(), Some(42));
}

#[test]
fn test_delayed_activation_state() {
    let ward = ward_type();

    let mut descriptor = EntityDescriptor::new();
    let calm_index = descriptor.add_state(EntityState::named("calm"));
    let mut charging = EntityState::named("charging");
    charging.activation_delay = Some(Duration::from_millis(50));
    charging
        .components
        .add
        .push(TypeDescriptor::of(ward).with_field("charge", Value::new(5i64)));
    let charging_index = descriptor.add_state(charging);
    descriptor.default_state_index = Some(calm_index);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();
    let entity = system.instantiate(&mut registry, Arc::new(descriptor));
    system.drain_events();

    assert!(system.set_state_named(&mut registry, entity, "charging"));
    system.pump(&mut registry);

    // State component reflects the pending state, but activation (and the
    // component add) has not happened yet.
    assert_eq!(system.state_index(&registry, entity), Some(charging_index));
    assert!(!registry.has_meta(entity, ward));
    let pending: Vec<_> = system
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::StateChange(change) => Some(change.state_activated),
            _ => None,
        })
        .collect();
    assert_eq!(pending, vec![false]);

    // Before the delay elapses nothing changes.
    system.update(&mut registry, Duration::from_millis(20));
    assert!(!registry.has_meta(entity, ward));

    // Once the timer fires, activation applies the component delta.
    system.update(&mut registry, Duration::from_millis(40));
    assert_eq!(
        registry
            .get_meta(entity, ward)
            .unwrap()
            .member(Symbol::of("charge"))
            .as_i64(),
        Some(5)
    );
    let activated = system
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::StateActivate(_)))
        .count();
    assert_eq!(activated, 1);
}
