//! Strand runtime host.
//!
//! Builds a small demo archetype programmatically (the authoring pipeline is
//! a separate tool), instantiates a few entities, and drives the behavior
//! system through a frame + fixed-step loop, printing the runtime events it
//! emits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use strand_core::condition::{Condition, SingleCondition};
use strand_core::descriptor::{
    EntityDescriptor, EntityState, RuleAction, StateRule, ThreadDescription, TypeDescriptor,
};
use strand_core::instruction::{Instruction, ThreadRange, ThreadRef};
use strand_core::ops::CompareMethod;
use strand_core::target::EntityTarget;
use strand_core::value::TypeBuilder;
use strand_core::{Registry, Symbol, TypeId, Value};
use strand_vm::BehaviorSystem;

#[derive(Debug, Deserialize)]
struct RuntimeConfig {
    /// Frame ticks to simulate.
    frames: u32,
    /// Frame delta in milliseconds.
    frame_ms: u64,
    /// Fixed steps per frame.
    fixed_steps: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            frames: 12,
            frame_ms: 16,
            fixed_steps: 1,
        }
    }
}

fn load_config() -> RuntimeConfig {
    match std::fs::read_to_string("strand.json") {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => RuntimeConfig::default(),
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
struct Health {
    current: i64,
}

fn health_type() -> TypeId {
    TypeBuilder::<Health>::new("Health")
        .cloneable()
        .comparable()
        .defaulted()
        .member(
            "current",
            |h| Value::new(h.current),
            |h, v| match v.as_i64() {
                Some(value) => {
                    h.current = value;
                    true
                }
                None => false,
            },
        )
        .register()
}

#[derive(Clone, PartialEq, Debug)]
struct Impact {
    strength: i64,
}

fn impact_type() -> TypeId {
    TypeBuilder::<Impact>::new("Impact")
        .cloneable()
        .comparable()
        .member_get("strength", |i| Value::new(i.strength))
        .register()
}

/// A creature that idles until hit hard enough, then spends a moment
/// stunned before recovering on a timer.
fn build_creature(health: TypeId, impact: TypeId) -> Arc<EntityDescriptor> {
    let mut descriptor = EntityDescriptor::new();
    descriptor
        .components
        .push(TypeDescriptor::of(health).with_field("current", Value::new(100i64)));

    let hard_hit = descriptor.add_condition(Condition::Single(SingleCondition::new(
        Some(impact),
        Some(Symbol::of("strength")),
        Value::new(2i64),
        CompareMethod::GreaterThanOrEqual,
    )));

    let heartbeat = descriptor.add_thread(
        ThreadDescription::named("heartbeat").with_instructions(vec![
            Instruction::Sleep {
                thread: ThreadRef::current(),
                duration: Duration::from_millis(48),
                check_linked: true,
            },
            Instruction::Rewind {
                thread: ThreadRef::current(),
                count: 2,
                check_linked: true,
            },
        ]),
    );

    let mut idle = EntityState::named("idle");
    idle.add_rule(
        impact,
        StateRule {
            condition: Some(hard_hit),
            delay: None,
            target: EntityTarget::SelfTarget,
            action: RuleAction::Transition {
                state_name: Symbol::of("stunned"),
            },
        },
    );
    idle.immediate_threads.push(ThreadRange::single(heartbeat));
    let idle_index = descriptor.add_state(idle);

    let mut stunned = EntityState::named("stunned");
    stunned
        .components
        .add
        .push(TypeDescriptor::of(health).with_field("current", Value::new(50i64)));
    descriptor.add_state(stunned);

    descriptor.default_state_index = Some(idle_index);
    descriptor
        .validate()
        .expect("descriptor references must match the live type registry");
    Arc::new(descriptor)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config();
    info!(?config, "strand runtime starting");

    let health = health_type();
    let impact = impact_type();
    let creature = build_creature(health, impact);

    let mut registry = Registry::new();
    let mut system = BehaviorSystem::new();

    let a = system.instantiate(&mut registry, creature.clone());
    let b = system.instantiate(&mut registry, creature);
    registry.set_name(b, Symbol::of("sparring_partner"));

    let frame = Duration::from_millis(config.frame_ms);
    for tick in 0..config.frames {
        system.update(&mut registry, frame);
        for _ in 0..config.fixed_steps {
            system.fixed_update(&mut registry);
        }

        // Halfway through, entity `a` takes a hard hit.
        if tick == config.frames / 2 {
            system.dispatch_event(&mut registry, Value::new(Impact { strength: 3 }));
        }

        for event in system.drain_events() {
            info!(?event, tick, "runtime event");
        }
    }

    let final_health = registry
        .get_meta(a, health)
        .and_then(|h| h.member(Symbol::of("current")).as_i64());
    info!(entity = a.0, health = ?final_health, "simulation finished");
    Ok(())
}
