//! Entity descriptors — the immutable runtime form of an archetype.
//!
//! A descriptor is shared by every instance of an entity class: its
//! statically attached components, its ordered state list, and the shared
//! storage holding compiled threads, conditions, and literal strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::warn;

use crate::condition::Condition;
use crate::error::StorageError;
use crate::hash::{Symbol, TypeId};
use crate::indirect::resolve_indirect;
use crate::instruction::{Cadence, Instruction, ThreadActionKind, ThreadRange};
use crate::registry::{Entity, Registry};
use crate::storage::{IndirectRef, SharedStorage, StorageResource};
use crate::target::EntityTarget;
use crate::value::{self, Value};
use crate::variables::VariableContext;
use crate::{StateIndex, ThreadIndex};

/// One field assignment inside a type descriptor. The value may be indirect
/// (variable target, data member, shared ref) and is resolved at apply time.
#[derive(Clone, Debug)]
pub struct FieldAssignment {
    pub member: Symbol,
    pub value: Value,
}

/// Describes how to construct (or patch) one component instance.
#[derive(Clone, Debug, Default)]
pub struct TypeDescriptor {
    pub type_id: TypeId,
    pub assignments: Vec<FieldAssignment>,
    /// Authored with explicit field assignment; such components survive
    /// decay when the state's policy keeps modified additions.
    pub force_field_assignment: bool,
}

impl StorageResource for TypeDescriptor {
    fn resource_name() -> &'static str {
        "TypeDescriptor"
    }
}

impl TypeDescriptor {
    pub fn of(type_id: TypeId) -> Self {
        Self {
            type_id,
            ..Default::default()
        }
    }

    pub fn with_field(mut self, member: &str, value: Value) -> Self {
        self.assignments.push(FieldAssignment {
            member: Symbol::of(member),
            value,
        });
        self
    }

    /// Construct a fresh component instance and apply all assignments.
    pub fn instantiate(
        &self,
        registry: &Registry,
        entity: Option<Entity>,
        variables: &VariableContext,
    ) -> Value {
        let mut instance = value::default_construct(self.type_id);
        if instance.is_empty() {
            warn!(type_id = self.type_id.0, "unresolved component type");
            return instance;
        }
        self.apply_assignments(&mut instance, registry, entity, variables);
        instance
    }

    /// Apply field assignments to an existing instance. Returns how many
    /// fields were written.
    pub fn apply_assignments(
        &self,
        target: &mut Value,
        registry: &Registry,
        entity: Option<Entity>,
        variables: &VariableContext,
    ) -> usize {
        let mut written = 0;
        for assignment in &self.assignments {
            let resolved = resolve_indirect(&assignment.value, registry, entity, variables);
            if resolved.is_empty() {
                warn!(
                    member = assignment.member.0,
                    "field assignment value did not resolve"
                );
                continue;
            }
            if target.set_member(assignment.member, resolved) {
                written += 1;
            } else {
                warn!(
                    type_id = self.type_id.0,
                    member = assignment.member.0,
                    "field assignment rejected"
                );
            }
        }
        written
    }
}

/// The component delta a state applies while entities occupy it.
#[derive(Clone, Debug, Default)]
pub struct StateComponentSets {
    /// Kept across transitions into other states that also persist them.
    pub persist: Vec<TypeDescriptor>,
    /// Added on activation; removed on decay unless persisted by this state
    /// or the next.
    pub add: Vec<TypeDescriptor>,
    /// Removed on activation.
    pub remove: Vec<TypeId>,
    /// Live instances moved into per-state storage while active.
    pub freeze: Vec<TypeId>,
    /// Saved on decay, restored on activation.
    pub store: Vec<TypeId>,
    /// Copied once on first activation, then stored/restored.
    pub init_copy: Vec<TypeId>,
    /// Copied on every activation; the original stays frozen while active.
    pub local_copy: Vec<TypeId>,
}

impl StateComponentSets {
    pub fn persist_contains(&self, type_id: TypeId) -> bool {
        self.persist.iter().any(|d| d.type_id == type_id)
    }

    pub fn persist_definition(&self, type_id: TypeId) -> Option<&TypeDescriptor> {
        self.persist.iter().find(|d| d.type_id == type_id)
    }

    /// Append to `remove`, skipping types the persist list also names.
    pub fn build_removal(&mut self, type_id: TypeId) -> bool {
        self.push_checked(type_id, |sets| &mut sets.remove, false)
    }

    /// Append to `freeze`, cross-referencing the persist list.
    pub fn build_frozen(&mut self, type_id: TypeId) -> bool {
        self.push_checked(type_id, |sets| &mut sets.freeze, true)
    }

    /// Append to `store`, cross-referencing the persist list.
    pub fn build_storage(&mut self, type_id: TypeId) -> bool {
        self.push_checked(type_id, |sets| &mut sets.store, true)
    }

    /// Local copies are also frozen while the state is active.
    pub fn build_local_copy(&mut self, type_id: TypeId) -> bool {
        if !self.push_checked(type_id, |sets| &mut sets.local_copy, false) {
            return false;
        }
        self.freeze.push(type_id);
        true
    }

    /// Init copies are frozen while active and stored across deactivations.
    pub fn build_init_copy(&mut self, type_id: TypeId) -> bool {
        if !self.push_checked(type_id, |sets| &mut sets.init_copy, false) {
            return false;
        }
        self.freeze.push(type_id);
        self.store.push(type_id);
        true
    }

    fn push_checked(
        &mut self,
        type_id: TypeId,
        list: impl FnOnce(&mut Self) -> &mut Vec<TypeId>,
        cross_reference_persist: bool,
    ) -> bool {
        if cross_reference_persist && self.persist_contains(type_id) {
            warn!(
                type_id = type_id.0,
                "component entry ignored due to overlapping persistent entry"
            );
            return false;
        }
        list(self).push(type_id);
        true
    }
}

/// Decay behavior flags.
#[derive(Clone, Copy, Debug)]
pub struct DecayPolicy {
    /// Remove components this state added when it decays.
    pub remove_add_components: bool,
    /// Keep added components that were authored with forced field
    /// assignment in place.
    pub keep_modified_add_components: bool,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            remove_add_components: true,
            keep_modified_add_components: true,
        }
    }
}

/// What a matched rule does.
#[derive(Clone, Debug)]
pub enum RuleAction {
    Transition { state_name: Symbol },
    Command { command: TypeDescriptor },
    Update { components: Vec<TypeDescriptor> },
    Thread(ThreadActionKind),
}

/// `(event_type, condition?, delay?, target, action)` attached to a state.
#[derive(Clone, Debug)]
pub struct StateRule {
    pub condition: Option<IndirectRef>,
    pub delay: Option<Duration>,
    pub target: EntityTarget,
    pub action: RuleAction,
}

/// A named configuration of component presence/absence with attached rules.
#[derive(Clone, Debug, Default)]
pub struct EntityState {
    pub name: Option<Symbol>,
    pub components: StateComponentSets,
    pub rules: HashMap<TypeId, Vec<StateRule>>,
    pub immediate_threads: SmallVec<[ThreadRange; 1]>,
    /// When set, decay happens immediately and activation is scheduled.
    pub activation_delay: Option<Duration>,
    pub decay_policy: DecayPolicy,
}

impl EntityState {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(Symbol::of(name)),
            ..Default::default()
        }
    }

    pub fn rules_for(&self, event_type: TypeId) -> Option<&[StateRule]> {
        self.rules.get(&event_type).map(|r| r.as_slice())
    }

    pub fn add_rule(&mut self, event_type: TypeId, rule: StateRule) {
        self.rules.entry(event_type).or_default().push(rule);
    }

    pub fn has_activation_delay(&self) -> bool {
        self.activation_delay.is_some()
    }
}

/// Identity of a state as carried in events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateInfo {
    pub index: StateIndex,
    pub id: Option<Symbol>,
}

/// A compiled program: ordered instructions plus a default cadence.
#[derive(Clone, Debug, Default)]
pub struct ThreadDescription {
    pub cadence: Cadence,
    pub thread_id: Option<Symbol>,
    pub instructions: Vec<Instruction>,
}

impl StorageResource for ThreadDescription {
    fn resource_name() -> &'static str {
        "ThreadDescription"
    }
}

impl ThreadDescription {
    pub fn named(name: &str) -> Self {
        Self {
            thread_id: Some(Symbol::of(name)),
            ..Default::default()
        }
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn instruction(&self, index: crate::InstructionIndex) -> Option<&Instruction> {
        self.instructions.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Handle from a live entity back to the descriptor it was instantiated
/// from.
#[derive(Clone)]
pub struct InstanceComponent {
    pub descriptor: Arc<EntityDescriptor>,
}

impl InstanceComponent {
    pub fn get_descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }
}

/// Immutable per-archetype program. Shared by many entity instances.
#[derive(Default)]
pub struct EntityDescriptor {
    /// Statically attached component set with default values.
    pub components: Vec<TypeDescriptor>,
    /// Dynamic component permutations, applied as state changes.
    pub states: Vec<EntityState>,
    /// Threads started on instantiation regardless of state.
    pub immediate_threads: SmallVec<[ThreadRange; 1]>,
    pub default_state_index: Option<StateIndex>,
    pub shared_storage: SharedStorage,
}

impl EntityDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    // States.

    pub fn add_state(&mut self, state: EntityState) -> StateIndex {
        let index = self.states.len() as StateIndex;
        self.states.push(state);
        index
    }

    pub fn state(&self, index: StateIndex) -> Option<&EntityState> {
        self.states.get(index as usize)
    }

    pub fn state_index(&self, name: Symbol) -> Option<StateIndex> {
        // Linear; descriptors hold a small number of states.
        self.states
            .iter()
            .position(|s| s.name == Some(name))
            .map(|i| i as StateIndex)
    }

    pub fn get_state(&self, name: Symbol) -> Option<&EntityState> {
        self.state_index(name).and_then(|i| self.state(i))
    }

    // Threads.

    pub fn add_thread(&mut self, description: ThreadDescription) -> ThreadIndex {
        self.shared_storage.allocate(description).index
    }

    pub fn thread(&self, index: ThreadIndex) -> Option<&ThreadDescription> {
        self.shared_storage.get_by_index::<ThreadDescription>(index)
    }

    pub fn threads(&self) -> Vec<(ThreadIndex, &ThreadDescription)> {
        self.shared_storage.entries::<ThreadDescription>()
    }

    pub fn next_thread_index(&self) -> ThreadIndex {
        self.shared_storage.next_index::<ThreadDescription>()
    }

    pub fn thread_index(&self, thread_id: Symbol) -> Option<ThreadIndex> {
        self.threads()
            .into_iter()
            .find(|(_, t)| t.thread_id == Some(thread_id))
            .map(|(i, _)| i)
    }

    pub fn thread_id(&self, index: ThreadIndex) -> Option<Symbol> {
        self.thread(index).and_then(|t| t.thread_id)
    }

    // Shared resources.

    pub fn add_condition(&mut self, condition: Condition) -> IndirectRef {
        self.shared_storage.allocate(condition)
    }

    pub fn condition(&self, reference: IndirectRef) -> Option<&Condition> {
        match self.shared_storage.get::<Condition>(reference) {
            Ok(condition) => Some(condition),
            Err(error) => {
                warn!(%error, "condition reference did not resolve");
                None
            }
        }
    }

    pub fn add_string(&mut self, text: &str) -> IndirectRef {
        self.shared_storage.intern(text.to_string())
    }

    pub fn string(&self, reference: IndirectRef) -> Option<&str> {
        self.shared_storage
            .get::<String>(reference)
            .ok()
            .map(|s| s.as_str())
    }

    /// Build a command-shaped type descriptor pre-populated with source and
    /// target fields.
    pub fn generate_empty_command(
        &self,
        command_type: TypeId,
        source: Entity,
        target: Entity,
    ) -> TypeDescriptor {
        crate::registry::entity_value_type();
        TypeDescriptor {
            type_id: command_type,
            assignments: vec![
                FieldAssignment {
                    member: Symbol::of("source"),
                    value: Value::new(source),
                },
                FieldAssignment {
                    member: Symbol::of("target"),
                    value: Value::new(target),
                },
            ],
            force_field_assignment: false,
        }
    }

    /// Validate every shared-storage reference embedded in this descriptor
    /// against the live type registry. A mismatch fails loudly at load.
    pub fn validate(&self) -> Result<(), StorageError> {
        for state in &self.states {
            for rules in state.rules.values() {
                for rule in rules {
                    if let Some(condition) = rule.condition {
                        condition.validate()?;
                        self.validate_condition(condition)?;
                    }
                }
            }
        }
        for (_, thread) in self.threads() {
            for instruction in &thread.instructions {
                match instruction {
                    Instruction::Yield { condition }
                    | Instruction::IfBlock { condition, .. } => {
                        condition.validate()?;
                        self.validate_condition(*condition)?;
                    }
                    Instruction::Assert {
                        condition,
                        message,
                        representation,
                    } => {
                        condition.validate()?;
                        self.validate_condition(*condition)?;
                        for text in [message, representation].into_iter().flatten() {
                            text.validate()?;
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn validate_condition(&self, reference: IndirectRef) -> Result<(), StorageError> {
        let condition = self
            .shared_storage
            .get::<Condition>(reference)
            .map_err(|_| StorageError::UnknownArena {
                type_id: reference.type_id,
            })?;
        match condition {
            Condition::And(children) | Condition::Or(children) => {
                for &child in children {
                    child.validate()?;
                    self.validate_condition(child)?;
                }
            }
            Condition::Inverse(child) => {
                child.validate()?;
                self.validate_condition(*child)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::CompareMethod;
    use crate::value::TypeBuilder;

    #[derive(Clone, PartialEq, Debug, Default)]
    struct Shield {
        charge: i64,
    }

    fn shield_type() -> TypeId {
        TypeBuilder::<Shield>::new("DescTestShield")
            .cloneable()
            .comparable()
            .defaulted()
            .member(
                "charge",
                |s| Value::new(s.charge),
                |s, v| match v.as_i64() {
                    Some(value) => {
                        s.charge = value;
                        true
                    }
                    None => false,
                },
            )
            .register()
    }

    #[test]
    fn test_type_descriptor_instantiate() {
        let type_id = shield_type();
        let registry = Registry::new();
        let descriptor = TypeDescriptor::of(type_id).with_field("charge", Value::new(40i64));
        let instance = descriptor.instantiate(&registry, None, &VariableContext::default());
        assert_eq!(instance.member(Symbol::of("charge")).as_i64(), Some(40));
    }

    #[test]
    fn test_state_and_thread_lookup() {
        let mut descriptor = EntityDescriptor::new();
        let idle = descriptor.add_state(EntityState::named("idle"));
        let stunned = descriptor.add_state(EntityState::named("stunned"));
        assert_eq!(descriptor.state_index(Symbol::of("idle")), Some(idle));
        assert_eq!(descriptor.state_index(Symbol::of("stunned")), Some(stunned));
        assert_eq!(descriptor.state_index(Symbol::of("missing")), None);

        let patrol = descriptor.add_thread(ThreadDescription::named("patrol"));
        assert_eq!(descriptor.thread_index(Symbol::of("patrol")), Some(patrol));
        assert_eq!(descriptor.thread_id(patrol), Some(Symbol::of("patrol")));
    }

    #[test]
    fn test_copy_builders_append_to_freeze_and_store() {
        let type_id = shield_type();
        let mut sets = StateComponentSets::default();
        assert!(sets.build_local_copy(type_id));
        assert!(sets.freeze.contains(&type_id));
        assert!(!sets.store.contains(&type_id));

        let mut sets = StateComponentSets::default();
        assert!(sets.build_init_copy(type_id));
        assert!(sets.freeze.contains(&type_id));
        assert!(sets.store.contains(&type_id));
    }

    #[test]
    fn test_persist_cross_reference_rejects() {
        let type_id = shield_type();
        let mut sets = StateComponentSets::default();
        sets.persist.push(TypeDescriptor::of(type_id));
        assert!(!sets.build_frozen(type_id));
        assert!(sets.freeze.is_empty());
        // Removals do not cross-reference by default.
        assert!(sets.build_removal(type_id));
    }

    #[test]
    fn test_validate_rejects_stale_checksums() {
        let shield = shield_type();
        let mut descriptor = EntityDescriptor::new();
        let mut condition_ref = descriptor.add_condition(Condition::Single(
            crate::condition::SingleCondition::new(
                Some(shield),
                None,
                Value::new(1i64),
                CompareMethod::Equal,
            ),
        ));
        let mut state = EntityState::named("idle");
        condition_ref.checksum ^= 1;
        state.add_rule(
            shield,
            StateRule {
                condition: Some(condition_ref),
                delay: None,
                target: EntityTarget::SelfTarget,
                action: RuleAction::Transition {
                    state_name: Symbol::of("next"),
                },
            },
        );
        descriptor.add_state(state);
        assert!(descriptor.validate().is_err());
    }
}
