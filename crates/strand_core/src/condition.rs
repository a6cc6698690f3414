//! Trigger conditions.
//!
//! A condition is a compound boolean tree over events and component state.
//! Child conditions are arena references into the owning descriptor's shared
//! storage; evaluation short-circuits and never errors — a comparison that
//! cannot produce a boolean is false.

use smallvec::SmallVec;
use tracing::warn;

use crate::expr::EvaluationContext;
use crate::hash::{Symbol, TypeId};
use crate::indirect::resolve_indirect;
use crate::ops::{compare_values, CompareMethod};
use crate::registry::{Entity, Registry};
use crate::storage::{IndirectRef, SharedStorage, StorageResource};
use crate::value::Value;

/// Test an event member (or, failing that, a component of the entity).
#[derive(Clone, Debug)]
pub struct SingleCondition {
    /// Explicit event type. Leave `None` to accept any event carrying the
    /// named member.
    pub event_type: Option<TypeId>,
    /// Member to read from the event. `None` compares the whole payload.
    pub member: Option<Symbol>,
    pub comparison_value: Value,
    pub method: CompareMethod,
    /// Permit falling back to a component attached to the entity when the
    /// event path does not produce a result.
    pub fallback_to_component: bool,
    /// Permit treating a lone comparison value as a boolean when no event is
    /// available at all.
    pub fallback_to_boolean: bool,
}

impl SingleCondition {
    pub fn new(
        event_type: Option<TypeId>,
        member: Option<Symbol>,
        comparison_value: Value,
        method: CompareMethod,
    ) -> Self {
        Self {
            event_type,
            member,
            comparison_value,
            method,
            fallback_to_component: true,
            fallback_to_boolean: true,
        }
    }

    fn member_value(&self, payload: &Value) -> Value {
        match self.member {
            Some(member) => payload.member(member),
            None => payload.clone(),
        }
    }

    /// Whether an event of `type_id` can satisfy this condition.
    pub fn accepts_type(&self, type_id: TypeId) -> bool {
        match self.event_type {
            Some(expected) => expected == type_id,
            None => true,
        }
    }
}

/// Always evaluates via a component read on a targeted entity.
#[derive(Clone, Debug)]
pub struct MemberCondition {
    pub member: crate::indirect::IndirectDataMember,
    pub comparison_value: Value,
    pub method: CompareMethod,
}

#[derive(Clone, Debug)]
pub enum Condition {
    Single(SingleCondition),
    Member(MemberCondition),
    And(SmallVec<[IndirectRef; 4]>),
    Or(SmallVec<[IndirectRef; 4]>),
    True,
    False,
    Inverse(IndirectRef),
}

impl StorageResource for Condition {
    fn resource_name() -> &'static str {
        "Condition"
    }
}

impl Condition {
    /// Evaluate the condition.
    ///
    /// * `event` — incoming event payload, if any.
    /// * `comparison_override` — replaces the stored comparison value.
    ///
    /// Indirect comparison values are resolved once before comparing.
    pub fn condition_met(
        &self,
        storage: &SharedStorage,
        event: Option<&Value>,
        comparison_override: Option<&Value>,
        registry: &Registry,
        entity: Option<Entity>,
        ctx: &EvaluationContext,
    ) -> bool {
        match self {
            Condition::True => true,
            Condition::False => false,
            Condition::Single(single) => {
                self.single_met(single, event, comparison_override, registry, entity, ctx)
            }
            Condition::Member(member) => {
                let current = member.member.read(registry, entity);
                if current.is_empty() {
                    return false;
                }
                let comparison = self.resolve_comparison(
                    comparison_override.unwrap_or(&member.comparison_value),
                    registry,
                    entity,
                    ctx,
                );
                compare_values(&current, &comparison, member.method)
            }
            Condition::And(children) => children.iter().all(|child| {
                self.child(storage, *child)
                    .map(|c| c.condition_met(storage, event, None, registry, entity, ctx))
                    .unwrap_or(false)
            }),
            Condition::Or(children) => children.iter().any(|child| {
                self.child(storage, *child)
                    .map(|c| c.condition_met(storage, event, None, registry, entity, ctx))
                    .unwrap_or(false)
            }),
            Condition::Inverse(child) => !self
                .child(storage, *child)
                .map(|c| c.condition_met(storage, event, None, registry, entity, ctx))
                .unwrap_or(true),
        }
    }

    fn child<'a>(&self, storage: &'a SharedStorage, reference: IndirectRef) -> Option<&'a Condition> {
        match storage.get::<Condition>(reference) {
            Ok(condition) => Some(condition),
            Err(error) => {
                warn!(%error, "child condition did not resolve");
                None
            }
        }
    }

    fn resolve_comparison(
        &self,
        comparison: &Value,
        registry: &Registry,
        entity: Option<Entity>,
        ctx: &EvaluationContext,
    ) -> Value {
        resolve_indirect(comparison, registry, entity, &ctx.variables)
    }

    fn single_met(
        &self,
        single: &SingleCondition,
        event: Option<&Value>,
        comparison_override: Option<&Value>,
        registry: &Registry,
        entity: Option<Entity>,
        ctx: &EvaluationContext,
    ) -> bool {
        let comparison = self.resolve_comparison(
            comparison_override.unwrap_or(&single.comparison_value),
            registry,
            entity,
            ctx,
        );

        // Event path. A type mismatch falls through to the component path.
        if let Some(event) = event.filter(|e| !e.is_empty()) {
            let type_matches = event
                .type_id()
                .map(|t| single.accepts_type(t))
                .unwrap_or(false);
            if type_matches {
                let current = single.member_value(event);
                if !current.is_empty() && compare_values(&current, &comparison, single.method) {
                    return true;
                }
            }
        } else if single.fallback_to_boolean
            && single.event_type.is_none()
            && !comparison.is_empty()
        {
            // No event at all: a lone comparison value may stand as a boolean.
            if comparison.as_bool().unwrap_or(false) {
                return true;
            }
        }

        // Component fallback: the event type (explicit or observed) doubles
        // as a component type on the entity.
        if single.fallback_to_component {
            let component_type = single
                .event_type
                .or_else(|| event.and_then(|e| e.type_id()));
            if let (Some(component_type), Some(entity)) = (component_type, entity) {
                if let Some(component) = registry.get_meta(entity, component_type) {
                    let current = single.member_value(component);
                    if !current.is_empty() && compare_values(&current, &comparison, single.method) {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Visit every event type this condition can trigger on, so listeners
    /// can be registered for each.
    pub fn enumerate_types(&self, storage: &SharedStorage, f: &mut dyn FnMut(TypeId)) {
        match self {
            Condition::Single(single) => {
                if let Some(type_id) = single.event_type {
                    f(type_id);
                }
            }
            Condition::Member(member) => f(member.member.type_id),
            Condition::And(children) | Condition::Or(children) => {
                for &child in children {
                    if let Some(condition) = self.child(storage, child) {
                        condition.enumerate_types(storage, f);
                    }
                }
            }
            Condition::Inverse(child) => {
                if let Some(condition) = self.child(storage, *child) {
                    condition.enumerate_types(storage, f);
                }
            }
            Condition::True | Condition::False => {}
        }
    }

    /// Whether an event of `type_id` is relevant to this condition.
    pub fn has_type_compatible(&self, storage: &SharedStorage, type_id: TypeId) -> bool {
        match self {
            Condition::Single(single) => single.accepts_type(type_id),
            Condition::Member(member) => member.member.type_id == type_id,
            Condition::And(children) | Condition::Or(children) => children.iter().any(|&child| {
                self.child(storage, child)
                    .map(|c| c.has_type_compatible(storage, type_id))
                    .unwrap_or(false)
            }),
            Condition::Inverse(child) => self
                .child(storage, *child)
                .map(|c| c.has_type_compatible(storage, type_id))
                .unwrap_or(false),
            Condition::True | Condition::False => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TypeBuilder;

    #[derive(Clone, PartialEq, Debug)]
    struct Impact {
        strength: i64,
    }

    fn impact_type() -> TypeId {
        TypeBuilder::<Impact>::new("CondTestImpact")
            .cloneable()
            .comparable()
            .member_get("strength", |i| Value::new(i.strength))
            .register()
    }

    fn eval(
        condition: &Condition,
        storage: &SharedStorage,
        event: Option<&Value>,
        registry: &Registry,
        entity: Option<Entity>,
    ) -> bool {
        condition.condition_met(
            storage,
            event,
            None,
            registry,
            entity,
            &EvaluationContext::default(),
        )
    }

    #[test]
    fn test_single_event_member_comparison() {
        let impact = impact_type();
        let registry = Registry::new();
        let storage = SharedStorage::new();

        let condition = Condition::Single(SingleCondition::new(
            Some(impact),
            Some(Symbol::of("strength")),
            Value::new(0i64),
            CompareMethod::GreaterThan,
        ));

        let event = Value::new(Impact { strength: 3 });
        assert!(eval(&condition, &storage, Some(&event), &registry, None));

        let weak = Value::new(Impact { strength: 0 });
        assert!(!eval(&condition, &storage, Some(&weak), &registry, None));
    }

    #[test]
    fn test_type_mismatch_falls_through_to_component() {
        let impact = impact_type();
        let mut registry = Registry::new();
        let storage = SharedStorage::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Impact { strength: 9 }));

        let condition = Condition::Single(SingleCondition::new(
            Some(impact),
            Some(Symbol::of("strength")),
            Value::new(5i64),
            CompareMethod::GreaterThan,
        ));

        // Mismatched event type; the attached component satisfies instead.
        let other_event = Value::new(77i64);
        assert!(eval(&condition, &storage, Some(&other_event), &registry, Some(e)));
    }

    #[test]
    fn test_compound_short_circuit() {
        let mut storage = SharedStorage::new();
        let t = storage.allocate(Condition::True);
        let f = storage.allocate(Condition::False);
        let registry = Registry::new();

        let and = Condition::And(SmallVec::from_slice(&[t, f]));
        let or = Condition::Or(SmallVec::from_slice(&[f, t]));
        assert!(!eval(&and, &storage, None, &registry, None));
        assert!(eval(&or, &storage, None, &registry, None));
    }

    #[test]
    fn test_inverse() {
        let mut storage = SharedStorage::new();
        let f = storage.allocate(Condition::False);
        let registry = Registry::new();
        let inverse = Condition::Inverse(f);
        assert!(eval(&inverse, &storage, None, &registry, None));
    }

    #[test]
    fn test_enumerate_types_recurses() {
        let impact = impact_type();
        let mut storage = SharedStorage::new();
        let single = storage.allocate(Condition::Single(SingleCondition::new(
            Some(impact),
            None,
            Value::new(1i64),
            CompareMethod::Equal,
        )));
        let inverse = storage.allocate(Condition::Inverse(single));
        let root = Condition::And(SmallVec::from_slice(&[inverse]));

        let mut seen = Vec::new();
        root.enumerate_types(&storage, &mut |t| seen.push(t));
        assert_eq!(seen, vec![impact]);
        assert!(root.has_type_compatible(&storage, impact));
    }

    #[test]
    fn test_member_condition_reads_component() {
        let impact = impact_type();
        let mut registry = Registry::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Impact { strength: 4 }));

        let storage = SharedStorage::new();
        let condition = Condition::Member(MemberCondition {
            member: crate::indirect::IndirectDataMember {
                target: crate::target::EntityTarget::SelfTarget,
                type_id: impact,
                member: Symbol::of("strength"),
            },
            comparison_value: Value::new(4i64),
            method: CompareMethod::Equal,
        });
        assert!(eval(&condition, &storage, None, &registry, Some(e)));

        // The member read ignores any event payload entirely.
        let unrelated = Value::new(1i64);
        assert!(eval(&condition, &storage, Some(&unrelated), &registry, Some(e)));
    }

    #[test]
    fn test_standalone_boolean_fallback() {
        let registry = Registry::new();
        let storage = SharedStorage::new();
        let condition = Condition::Single(SingleCondition::new(
            None,
            None,
            Value::new(true),
            CompareMethod::Equal,
        ));
        assert!(eval(&condition, &storage, None, &registry, None));
    }
}
