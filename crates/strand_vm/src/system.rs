//! The behavior system.
//!
//! Owns the per-event-type listeners, the command queue, and the runtime
//! event outbox; drives thread stepping at frame and fixed cadence; applies
//! commanded state changes, thread operations, and component patches.
//!
//! Scheduling is single-threaded cooperative: within one entity, threads
//! execute in insertion order, and a `Realtime` thread loops internally
//! until it suspends, rewinds, or changes cadence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use strand_core::descriptor::{
    EntityDescriptor, InstanceComponent, RuleAction, StateInfo, StateRule, TypeDescriptor,
};
use strand_core::expr::{self, EvaluationContext, ValueExpr};
use strand_core::indirect::resolve_indirect;
use strand_core::instruction::{
    Cadence, Instruction, ThreadActionKind, ThreadRange, ThreadRef, ThreadTarget,
};
use strand_core::registry::{PlayerComponent, PlayerIndex, PlayerTargetComponent, ANY_PLAYER};
use strand_core::value;
use strand_core::variables::{shared_store, SharedStore, VariableContext, VariableScope};
use strand_core::{
    Entity, InstructionCount, InstructionIndex, Registry, StateIndex, Symbol, TypeId, Value,
};

use crate::command::{Command, CommandQueue};
use crate::context::{self, entity_variable_context, ContextComponent};
use crate::events::{
    install_event_types, OnEntityThreadsUpdated, OnStateActivate, OnStateChange,
    OnThreadAttach, OnThreadComplete, OnThreadDetach, OnThreadEventCaptured, OnThreadPaused,
    OnThreadResumed, OnThreadSpawn, OnThreadTerminated, OnThreadUnlink, OnThreadVariableUpdate,
    RuntimeEvent, ThreadEventInfo,
};
use crate::fiber::{self, ControlFlowToken, FiberHandle, FiberResponse};
use crate::listener::EntityListener;
use crate::state::{self, StateComponent};
use crate::thread_component::{StopOutcome, ThreadComponent};

/// A thread operation applied against a concrete thread container.
enum ThreadOp {
    Stop {
        threads: ThreadTarget,
        check_linked: bool,
    },
    Pause {
        threads: ThreadTarget,
        check_linked: bool,
    },
    Resume {
        threads: ThreadTarget,
        check_linked: bool,
    },
    Attach {
        threads: ThreadTarget,
        check_linked: bool,
        state_id: Option<Symbol>,
    },
    Detach {
        threads: ThreadTarget,
        check_linked: bool,
    },
    Unlink {
        threads: ThreadTarget,
    },
    Skip {
        threads: ThreadTarget,
        check_linked: bool,
        count: InstructionCount,
    },
    Rewind {
        threads: ThreadTarget,
        check_linked: bool,
        count: InstructionCount,
    },
}

/// The entity behavior runtime.
pub struct BehaviorSystem {
    listeners: HashMap<TypeId, EntityListener>,
    commands: CommandQueue,
    /// Opaque event payloads awaiting delivery.
    events: VecDeque<Value>,
    /// Runtime events awaiting internal handling + listener delivery.
    runtime_events: VecDeque<RuntimeEvent>,
    /// Host-facing record of every runtime event emitted.
    outbox: Vec<RuntimeEvent>,
    universal_variables: SharedStore,
}

impl Default for BehaviorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorSystem {
    pub fn new() -> Self {
        install_event_types();
        strand_core::instruction::instruction_value_type();
        strand_core::indirect::install();
        fiber::fiber_value_type();
        Self {
            listeners: HashMap::new(),
            commands: CommandQueue::new(),
            events: VecDeque::new(),
            runtime_events: VecDeque::new(),
            outbox: Vec::new(),
            universal_variables: shared_store(),
        }
    }

    pub fn universal_variables(&self) -> SharedStore {
        self.universal_variables.clone()
    }

    // ------------------------------------------------------------------
    // Entity lifecycle.

    /// Instantiate an entity from a descriptor: static components, shared
    /// context, descriptor-level immediate threads, and the default state.
    pub fn instantiate(
        &mut self,
        registry: &mut Registry,
        descriptor: Arc<EntityDescriptor>,
    ) -> Entity {
        let entity = registry.create();

        let variables = VariableContext::default();
        for component in &descriptor.components {
            let instance = component.instantiate(registry, Some(entity), &variables);
            if !instance.is_empty() {
                registry.emplace_meta(entity, instance);
            }
        }

        registry.insert(
            entity,
            InstanceComponent {
                descriptor: descriptor.clone(),
            },
        );
        registry.insert(entity, ContextComponent::default());
        context::initialize_context(registry, entity);

        if !descriptor.immediate_threads.is_empty() {
            let mut threads = registry.take::<ThreadComponent>(entity).unwrap_or_default();
            for &range in &descriptor.immediate_threads {
                threads.start_threads(&descriptor, range, None, false);
            }
            registry.insert(entity, threads);
        }

        if let Some(default_state) = descriptor.default_state_index {
            self.set_state_by_index(registry, entity, default_state);
        }

        self.pump(registry);
        entity
    }

    /// Re-home an entity and propagate the shared context accordingly.
    pub fn reparent(&mut self, registry: &mut Registry, entity: Entity, parent: Option<Entity>) {
        let old_parent = registry.set_parent(entity, parent);
        context::handle_parent_changed(registry, entity, old_parent);
    }

    // ------------------------------------------------------------------
    // Ticks.

    /// Frame tick: advance timers, then step `Update` and `Realtime`
    /// threads.
    pub fn update(&mut self, registry: &mut Registry, dt: Duration) {
        self.commands.advance(dt);
        self.pump(registry);
        self.progress_threads(registry, &[Cadence::Update, Cadence::Realtime]);
        self.pump(registry);
    }

    /// Fixed-step tick: step `Fixed` threads.
    pub fn fixed_update(&mut self, registry: &mut Registry) {
        self.progress_threads(registry, &[Cadence::Fixed]);
        self.pump(registry);
    }

    /// Deliver an opaque event payload to listeners and rules.
    pub fn dispatch_event(&mut self, registry: &mut Registry, event: Value) {
        self.events.push_back(event);
        self.pump(registry);
    }

    /// Take every runtime event emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<RuntimeEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn queue_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn queue_command_delayed(&mut self, delay: Duration, command: Command) {
        self.commands.push_timed(delay, command);
    }

    // ------------------------------------------------------------------
    // State access.

    fn descriptor_of(
        &self,
        registry: &Registry,
        entity: Entity,
    ) -> Option<Arc<EntityDescriptor>> {
        registry
            .get::<InstanceComponent>(entity)
            .map(|c| c.descriptor.clone())
    }

    pub fn state_index(&self, registry: &Registry, entity: Entity) -> Option<StateIndex> {
        registry
            .get::<StateComponent>(entity)
            .map(|s| s.state_index)
    }

    pub fn prev_state_index(&self, registry: &Registry, entity: Entity) -> Option<StateIndex> {
        registry
            .get::<StateComponent>(entity)
            .map(|s| s.prev_state_index)
    }

    /// Transition an entity to the named state.
    pub fn set_state(&mut self, registry: &mut Registry, entity: Entity, state_id: Symbol) -> bool {
        let Some(descriptor) = self.descriptor_of(registry, entity) else {
            return false;
        };
        let Some(to_index) = descriptor.state_index(state_id) else {
            warn!(state = state_id.0, "unresolved state name");
            return false;
        };
        self.set_state_by_index(registry, entity, to_index)
    }

    pub fn set_state_named(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        state_name: &str,
    ) -> bool {
        self.set_state(registry, entity, Symbol::of(state_name))
    }

    pub fn set_state_by_index(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        to_index: StateIndex,
    ) -> bool {
        let Some(descriptor) = self.descriptor_of(registry, entity) else {
            return false;
        };
        let Some(to_state) = descriptor.state(to_index) else {
            return false;
        };

        let from_index = self.state_index(registry, entity);
        let to_info = StateInfo {
            index: to_index,
            id: to_state.name,
        };
        let from_info = from_index
            .map(|index| StateInfo {
                index,
                id: descriptor.state(index).and_then(|s| s.name),
            })
            .unwrap_or(to_info);

        if to_state.has_activation_delay() {
            // Decay now, activate when the timer fires.
            if let Some(from_index) = from_index {
                state::decay(
                    &descriptor,
                    registry,
                    entity,
                    from_index,
                    Some(to_state.components.persist.as_slice()),
                );
            }
            state::force_update_component(registry, entity, to_index, from_index);
            self.refresh_state_listeners(registry, entity, from_index.is_some());

            self.queue_runtime_event(RuntimeEvent::StateChange(OnStateChange {
                entity,
                from: from_info,
                to: to_info,
                state_activated: false,
            }));

            let delay = to_state.activation_delay.unwrap_or_default();
            self.commands.push_timed(
                delay,
                Command::StateActivation {
                    source: entity,
                    target: entity,
                    state_name: to_state.name.unwrap_or_default(),
                },
            );
            return true;
        }

        state::update(
            &descriptor,
            registry,
            entity,
            to_index,
            from_index,
            true,
            true,
        );
        self.refresh_state_listeners(registry, entity, from_index.is_some());

        self.queue_runtime_event(RuntimeEvent::StateChange(OnStateChange {
            entity,
            from: from_info,
            to: to_info,
            state_activated: true,
        }));
        self.queue_runtime_event(RuntimeEvent::StateActivate(OnStateActivate {
            entity,
            state: to_info,
        }));
        true
    }

    /// Run the activation phase for the entity's current (pending) state.
    fn activate_current_state(&mut self, registry: &mut Registry, entity: Entity) -> bool {
        let Some(descriptor) = self.descriptor_of(registry, entity) else {
            return false;
        };
        let Some(index) = self.state_index(registry, entity) else {
            return false;
        };
        state::activate(&descriptor, registry, entity, index, None, false);
        let info = StateInfo {
            index,
            id: descriptor.state(index).and_then(|s| s.name),
        };
        self.queue_runtime_event(RuntimeEvent::StateActivate(OnStateActivate {
            entity,
            state: info,
        }));
        true
    }

    // ------------------------------------------------------------------
    // Listeners.

    pub fn listen(&mut self, type_id: TypeId) -> &mut EntityListener {
        self.listeners
            .entry(type_id)
            .or_insert_with(|| EntityListener::new(type_id))
    }

    pub fn listener(&self, type_id: TypeId) -> Option<&EntityListener> {
        self.listeners.get(&type_id)
    }

    /// Synchronize listener registrations with the entity's current state.
    fn refresh_state_listeners(
        &mut self,
        registry: &Registry,
        entity: Entity,
        handle_existing: bool,
    ) {
        let Some(descriptor) = self.descriptor_of(registry, entity) else {
            return;
        };
        let Some(state_component) = registry.get::<StateComponent>(entity).copied() else {
            return;
        };

        if handle_existing {
            if state_component.state_index == state_component.prev_state_index {
                return;
            }
            // Sweep: one reference dropped per listener, covering the rule
            // registrations the previous state added.
            for listener in self.listeners.values_mut() {
                listener.remove_entity(entity, 1, false);
            }
        }

        let Some(state) = descriptor.state(state_component.state_index) else {
            return;
        };
        for &event_type in state.rules.keys() {
            self.listen(event_type).add_entity(entity);
        }
    }

    // ------------------------------------------------------------------
    // Queue pumping.

    fn queue_runtime_event(&mut self, event: RuntimeEvent) {
        self.outbox.push(event.clone());
        self.runtime_events.push_back(event);
    }

    /// Drain commands and deliver pending events until the system is idle.
    pub fn pump(&mut self, registry: &mut Registry) {
        loop {
            if let Some(command) = self.commands.pop() {
                self.apply_command(registry, command);
                continue;
            }
            if let Some(event) = self.runtime_events.pop_front() {
                self.handle_runtime_event(registry, event);
                continue;
            }
            if let Some(event) = self.events.pop_front() {
                self.deliver_event(registry, &event);
                continue;
            }
            break;
        }
    }

    fn handle_runtime_event(&mut self, registry: &mut Registry, event: RuntimeEvent) {
        if let RuntimeEvent::EntityThreadsUpdated(update) = &event {
            // Deferred sweep: completed threads are erased only after the
            // commands emitted this tick have had a chance to run.
            if let Some(threads) = registry.get_mut::<ThreadComponent>(update.entity) {
                threads.erase_completed_threads();
            }
        }

        let payload = event.to_value();
        let wanted = payload
            .type_id()
            .and_then(|t| self.listeners.get(&t))
            .map(|l| l.has_listening_entity())
            .unwrap_or(false);
        if wanted {
            self.deliver_event(registry, &payload);
        }
    }

    // ------------------------------------------------------------------
    // Event delivery.

    fn deliver_event(&mut self, registry: &mut Registry, event: &Value) {
        let Some(event_type) = event.type_id() else {
            return;
        };
        let targets = match self.listeners.get(&event_type) {
            Some(listener) => listener.entities(),
            None => return,
        };

        let event_player = resolve_player_index(event);
        let mut removals: Vec<(Entity, u16)> = Vec::new();

        for entity in targets {
            let Some(descriptor) = self.descriptor_of(registry, entity) else {
                continue;
            };

            // Player-specific events skip entities bound to another player.
            if let Some(player) = event_player {
                if player != ANY_PLAYER && !entity_matches_player(registry, entity, player) {
                    continue;
                }
            }

            // State rules for this event type.
            if let Some(state_component) = registry.get::<StateComponent>(entity).copied() {
                if let Some(rules) = descriptor
                    .state(state_component.state_index)
                    .and_then(|s| s.rules_for(event_type))
                {
                    let rules: Vec<StateRule> = rules.to_vec();
                    for rule in &rules {
                        let met = match rule.condition {
                            Some(reference) => descriptor
                                .condition(reference)
                                .map(|condition| {
                                    let ctx = EvaluationContext::new(entity_variable_context(
                                        registry, entity,
                                    ));
                                    condition.condition_met(
                                        &descriptor.shared_storage,
                                        Some(event),
                                        None,
                                        registry,
                                        Some(entity),
                                        &ctx,
                                    )
                                })
                                .unwrap_or(false),
                            None => true,
                        };
                        if met {
                            self.execute_rule_action(registry, &descriptor, entity, rule, event);
                        }
                    }
                }
            }

            // Yielding threads.
            if let Some(mut threads) = registry.take::<ThreadComponent>(entity) {
                let mut local = 0;
                while local < threads.threads.len() {
                    if threads.threads[local].flags.yielding {
                        if threads.threads[local].thread_index.is_none() {
                            self.wake_fiber_thread(
                                entity,
                                &mut threads,
                                local,
                                event,
                                &mut removals,
                            );
                        } else {
                            self.wake_conditional_thread(
                                registry,
                                entity,
                                &descriptor,
                                &mut threads,
                                local,
                                event,
                                &mut removals,
                            );
                        }
                    }
                    local += 1;
                }
                registry.insert(entity, threads);
            }
        }

        let mut disconnect = false;
        if let Some(listener) = self.listeners.get_mut(&event_type) {
            for (entity, references) in removals {
                listener.remove_entity(entity, references, false);
            }
            disconnect = !listener.has_listening_entity();
        }
        // With no remaining subscribers the listener disconnects.
        if disconnect {
            self.listeners.remove(&event_type);
        }
    }

    /// Wake a thread parked on a `Yield` instruction whose condition the
    /// incoming event satisfies, executing any subsequent event captures.
    #[allow(clippy::too_many_arguments)]
    fn wake_conditional_thread(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        descriptor: &EntityDescriptor,
        threads: &mut ThreadComponent,
        local: usize,
        event: &Value,
        removals: &mut Vec<(Entity, u16)>,
    ) {
        let Some(thread_index) = threads.threads[local].thread_index else {
            return;
        };
        let Some(description) = descriptor.thread(thread_index) else {
            return;
        };
        let pc = threads.threads[local].next_instruction;

        let condition_ref = match description.instruction(pc) {
            Some(Instruction::Yield { condition }) => *condition,
            Some(
                Instruction::FunctionCall(_)
                | Instruction::CoroutineCall(_)
                | Instruction::Expression(_),
            ) => {
                self.wake_fiber_thread(entity, threads, local, event, removals);
                return;
            }
            _ => return,
        };

        let Some(condition) = descriptor.condition(condition_ref) else {
            return;
        };
        let Some(event_type) = event.type_id() else {
            return;
        };

        // How many references this yield registered for the event's type.
        let mut reference_count: u16 = 0;
        condition.enumerate_types(&descriptor.shared_storage, &mut |type_id| {
            if type_id == event_type {
                reference_count += 1;
            }
        });
        if reference_count == 0 {
            return;
        }

        let met = {
            let ctx = EvaluationContext::new(self.thread_variable_context(
                registry,
                entity,
                threads,
                local,
                None,
            ));
            condition.condition_met(
                &descriptor.shared_storage,
                Some(event),
                None,
                registry,
                Some(entity),
                &ctx,
            )
        };
        if !met {
            return;
        }

        // Advancement starts at one for the yield instruction itself, then
        // covers the run of compatible event captures that follows.
        let mut advance: InstructionCount = 1;
        let mut captured = false;
        let mut cursor = pc.saturating_add(1);
        while let Some(Instruction::EventCapture {
            variable,
            intended_type,
        }) = description.instruction(cursor)
        {
            let compatible = intended_type
                .map(|t| Some(t) == event.type_id())
                .unwrap_or(true);
            if compatible {
                let ctx = self.thread_variable_context(
                    registry,
                    entity,
                    threads,
                    local,
                    Some(variable.scope),
                );
                if ctx.set(variable.scope, variable.name, event.clone()) {
                    captured = true;
                }
            }
            cursor += 1;
        }
        // Incompatible captures are only bypassed when at least one capture
        // executed; otherwise only the yield itself is stepped over (the
        // fallback capture in the VM handles the rest).
        if captured {
            advance = cursor - pc;
        }

        threads.threads[local].unyield(advance);
        removals.push((entity, reference_count));
    }

    /// Wake a fiber-driven thread waiting on this event type.
    fn wake_fiber_thread(
        &mut self,
        entity: Entity,
        threads: &mut ThreadComponent,
        local: usize,
        event: &Value,
        removals: &mut Vec<(Entity, u16)>,
    ) {
        let thread = &mut threads.threads[local];
        let Some(fiber) = thread.fiber.as_mut() else {
            return;
        };
        let Some(waiting) = fiber.waiting_for_event() else {
            return;
        };
        if Some(waiting) != event.type_id() || !fiber.accepts_event(event) {
            return;
        }

        fiber.capture_event(event.clone());
        // Zero advancement: execution continues inside the fiber.
        thread.unyield(0);

        let info = ThreadEventInfo {
            entity,
            thread_index: thread.thread_index,
            thread_id: thread.thread_id,
            local_instance: local,
            last_instruction_index: thread.next_instruction,
        };
        self.queue_runtime_event(RuntimeEvent::ThreadEventCaptured(OnThreadEventCaptured {
            info,
            event_type_id: waiting,
        }));
        removals.push((entity, 1));
    }

    // ------------------------------------------------------------------
    // Rule actions.

    fn execute_rule_action(
        &mut self,
        registry: &mut Registry,
        descriptor: &EntityDescriptor,
        source: Entity,
        rule: &StateRule,
        _event: &Value,
    ) {
        let Some(target) = rule.target.resolve(registry, Some(source)) else {
            warn!(entity = source.0, "rule target did not resolve");
            return;
        };

        let commands = self.action_commands(registry, descriptor, &rule.action, source, target, None);
        for command in commands {
            match rule.delay {
                Some(delay) => self.commands.push_timed(delay, command),
                None => self.commands.push(command),
            }
        }
    }

    fn action_commands(
        &mut self,
        registry: &mut Registry,
        _descriptor: &EntityDescriptor,
        action: &RuleAction,
        source: Entity,
        target: Entity,
        spawn_state: Option<StateIndex>,
    ) -> Vec<Command> {
        match action {
            RuleAction::Transition { state_name } => vec![Command::StateChange {
                source,
                target,
                state_name: *state_name,
            }],
            RuleAction::Command { command } => {
                let variables = entity_variable_context(registry, source);
                let mut payload = command.instantiate(registry, Some(source), &variables);
                if payload.is_empty() {
                    warn!(type_id = command.type_id.0, "command payload did not build");
                    return Vec::new();
                }
                // Pre-populated source/target fields, where the type has them.
                payload.set_member(Symbol::of("source"), Value::new(source));
                payload.set_member(Symbol::of("target"), Value::new(target));
                vec![Command::Emit {
                    source,
                    target,
                    payload,
                }]
            }
            RuleAction::Update { components } => components
                .iter()
                .map(|component| Command::ComponentUpdate {
                    source,
                    target,
                    component: component.clone(),
                })
                .collect(),
            RuleAction::Thread(kind) => {
                vec![thread_action_command(kind.clone(), source, target, spawn_state)]
            }
        }
    }

    // ------------------------------------------------------------------
    // Command application.

    fn apply_command(&mut self, registry: &mut Registry, command: Command) {
        match command {
            Command::StateChange {
                target, state_name, ..
            } => {
                if registry.is_alive(target) {
                    self.set_state(registry, target, state_name);
                }
            }
            Command::StateActivation {
                target, state_name, ..
            } => {
                if !self.activate_current_state(registry, target) {
                    debug!(
                        state = state_name.0,
                        entity = target.0,
                        "pending state activation dropped"
                    );
                }
            }
            Command::ThreadSpawn {
                target,
                threads,
                restart_existing,
                state_index,
                parent_thread_name,
                ..
            } => {
                self.handle_thread_spawn(
                    registry,
                    target,
                    threads,
                    restart_existing,
                    state_index,
                    parent_thread_name,
                );
            }
            Command::ThreadStop {
                target,
                threads,
                check_linked,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Stop {
                    threads,
                    check_linked,
                },
            ),
            Command::ThreadPause {
                target,
                threads,
                check_linked,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Pause {
                    threads,
                    check_linked,
                },
            ),
            Command::ThreadResume {
                target,
                threads,
                check_linked,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Resume {
                    threads,
                    check_linked,
                },
            ),
            Command::ThreadAttach {
                target,
                threads,
                check_linked,
                state_id,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Attach {
                    threads,
                    check_linked,
                    state_id,
                },
            ),
            Command::ThreadDetach {
                target,
                threads,
                check_linked,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Detach {
                    threads,
                    check_linked,
                },
            ),
            Command::ThreadUnlink {
                target, threads, ..
            } => self.apply_thread_op_via_registry(registry, target, ThreadOp::Unlink { threads }),
            Command::ThreadSkip {
                target,
                threads,
                check_linked,
                instruction_count,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Skip {
                    threads,
                    check_linked,
                    count: instruction_count,
                },
            ),
            Command::ThreadRewind {
                target,
                threads,
                check_linked,
                instruction_count,
                ..
            } => self.apply_thread_op_via_registry(
                registry,
                target,
                ThreadOp::Rewind {
                    threads,
                    check_linked,
                    count: instruction_count,
                },
            ),
            Command::ComponentPatch {
                target,
                component,
                use_member_assignment,
                ..
            } => {
                if !registry.is_alive(target) {
                    return;
                }
                let Some(type_id) = component.type_id() else {
                    return;
                };
                if use_member_assignment && registry.has_meta(target, type_id) {
                    patch_members(registry, target, type_id, &component);
                } else {
                    registry.emplace_meta(target, component);
                }
            }
            Command::ComponentReplace {
                target, component, ..
            } => {
                if registry.is_alive(target) {
                    registry.emplace_meta(target, component);
                }
            }
            Command::ComponentUpdate {
                target, component, ..
            } => {
                if registry.is_alive(target) {
                    apply_component_update(registry, target, &component);
                }
            }
            Command::IndirectComponentPatch {
                target,
                descriptor_ref,
                ..
            } => {
                let Some(descriptor) = self.descriptor_of(registry, target) else {
                    return;
                };
                let component = match descriptor
                    .shared_storage
                    .get::<TypeDescriptor>(descriptor_ref)
                {
                    Ok(component) => component.clone(),
                    Err(error) => {
                        warn!(%error, "indirect patch descriptor did not resolve");
                        return;
                    }
                };
                apply_component_update(registry, target, &component);
            }
            Command::Emit { payload, .. } => {
                self.events.push_back(payload);
            }
        }
    }

    fn handle_thread_spawn(
        &mut self,
        registry: &mut Registry,
        target: Entity,
        threads: ThreadTarget,
        restart_existing: bool,
        state_index: Option<StateIndex>,
        parent_thread_name: Option<Symbol>,
    ) {
        let Some(descriptor) = self.descriptor_of(registry, target) else {
            // Decayed between emission and delivery; drop silently.
            return;
        };
        let mut container = registry.take::<ThreadComponent>(target).unwrap_or_default();

        let mut spawned = Vec::new();
        match threads {
            ThreadTarget::Empty => warn!(entity = target.0, "empty thread spawn command"),
            ThreadTarget::Range(range) => {
                for index in range.iter() {
                    if let Some(local) = container.start_from_description(
                        &descriptor,
                        index,
                        parent_thread_name,
                        state_index,
                        restart_existing,
                    ) {
                        spawned.push(local);
                    }
                }
            }
            ThreadTarget::Id(thread_id) => {
                if let Some(local) = container.start_thread_by_id(
                    &descriptor,
                    thread_id,
                    parent_thread_name,
                    state_index,
                    restart_existing,
                ) {
                    spawned.push(local);
                }
            }
        }

        for local in &spawned {
            let info = thread_info(&container, *local, target);
            self.queue_runtime_event(RuntimeEvent::ThreadSpawn(OnThreadSpawn(info)));
        }
        registry.insert(target, container);
        if !spawned.is_empty() {
            self.queue_runtime_event(RuntimeEvent::EntityThreadsUpdated(OnEntityThreadsUpdated {
                entity: target,
            }));
        }
    }

    fn apply_thread_op_via_registry(
        &mut self,
        registry: &mut Registry,
        target: Entity,
        op: ThreadOp,
    ) {
        let Some(descriptor) = self.descriptor_of(registry, target) else {
            return;
        };
        let Some(mut container) = registry.take::<ThreadComponent>(target) else {
            // Target decayed before delivery; drop silently.
            return;
        };
        let changed = self.run_thread_op(&mut container, &descriptor, target, &op);
        registry.insert(target, container);
        if changed {
            self.queue_runtime_event(RuntimeEvent::EntityThreadsUpdated(OnEntityThreadsUpdated {
                entity: target,
            }));
        }
    }

    /// Apply a thread operation against a held container, emitting the
    /// matching lifecycle events.
    fn run_thread_op(
        &mut self,
        container: &mut ThreadComponent,
        descriptor: &EntityDescriptor,
        entity: Entity,
        op: &ThreadOp,
    ) -> bool {
        let mut changed = false;
        match op {
            ThreadOp::Stop {
                threads,
                check_linked,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    if let Some(local) = container.find_local(index, *check_linked) {
                        let info = thread_info(container, local, entity);
                        match container.stop_local(local) {
                            StopOutcome::Terminated => {
                                self.queue_runtime_event(RuntimeEvent::ThreadTerminated(
                                    OnThreadTerminated(info),
                                ));
                            }
                            StopOutcome::Detached => {
                                self.queue_runtime_event(RuntimeEvent::ThreadUnlink(
                                    OnThreadUnlink(info),
                                ));
                            }
                        }
                        changed = true;
                    }
                });
            }
            ThreadOp::Pause {
                threads,
                check_linked,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    if container.pause_thread(index, *check_linked) {
                        if let Some(local) = container.find_local(index, false) {
                            let info = thread_info(container, local, entity);
                            self.queue_runtime_event(RuntimeEvent::ThreadPaused(OnThreadPaused(
                                info,
                            )));
                        }
                        changed = true;
                    }
                });
            }
            ThreadOp::Resume {
                threads,
                check_linked,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    if container.resume_thread(index, *check_linked) {
                        if let Some(local) = container.find_local(index, false) {
                            let info = thread_info(container, local, entity);
                            self.queue_runtime_event(RuntimeEvent::ThreadResumed(OnThreadResumed(
                                info,
                            )));
                        }
                        changed = true;
                    }
                });
            }
            ThreadOp::Attach {
                threads,
                check_linked,
                state_id,
            } => {
                let state_index = state_id.and_then(|id| descriptor.state_index(id));
                for_target_indices(descriptor, threads, |index| {
                    if container.attach_thread(index, state_index, *check_linked) {
                        if let Some(local) = container.find_local(index, false) {
                            let info = thread_info(container, local, entity);
                            self.queue_runtime_event(RuntimeEvent::ThreadAttach(OnThreadAttach(
                                info,
                            )));
                        }
                        changed = true;
                    }
                });
            }
            ThreadOp::Detach {
                threads,
                check_linked,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    if container.detach_thread(index, *check_linked) {
                        if let Some(local) = container.find_local(index, false) {
                            let info = thread_info(container, local, entity);
                            self.queue_runtime_event(RuntimeEvent::ThreadDetach(OnThreadDetach(
                                info,
                            )));
                        }
                        changed = true;
                    }
                });
            }
            ThreadOp::Unlink { threads } => {
                for_target_indices(descriptor, threads, |index| {
                    if let Some(local) = container.find_local(index, false) {
                        let info = thread_info(container, local, entity);
                        if container.unlink_thread(index) {
                            self.queue_runtime_event(RuntimeEvent::ThreadUnlink(OnThreadUnlink(
                                info,
                            )));
                            changed = true;
                        }
                    }
                });
            }
            ThreadOp::Skip {
                threads,
                check_linked,
                count,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    changed |= container.skip_thread(index, *count, *check_linked);
                });
            }
            ThreadOp::Rewind {
                threads,
                check_linked,
                count,
            } => {
                for_target_indices(descriptor, threads, |index| {
                    changed |= container.rewind_thread(index, *count, *check_linked);
                });
            }
        }
        changed
    }

    /// Route a thread op either to the in-flight container (self) or to
    /// another entity's container through the registry.
    #[allow(clippy::too_many_arguments)]
    fn run_thread_op_for(
        &mut self,
        registry: &mut Registry,
        self_entity: Entity,
        self_container: &mut ThreadComponent,
        descriptor: &EntityDescriptor,
        target_entity: Entity,
        op: ThreadOp,
    ) {
        if target_entity == self_entity {
            self.run_thread_op(self_container, descriptor, self_entity, &op);
        } else {
            self.apply_thread_op_via_registry(registry, target_entity, op);
        }
    }

    // ------------------------------------------------------------------
    // Thread progression.

    /// Step every thread whose cadence matches, one step each (a `Realtime`
    /// thread loops until it suspends, rewinds, or changes cadence).
    pub fn progress_threads(&mut self, registry: &mut Registry, cadences: &[Cadence]) -> usize {
        let entities = registry.entities_with::<ThreadComponent>();
        let mut threads_updated = 0;

        for entity in entities {
            let Some(descriptor) = self.descriptor_of(registry, entity) else {
                continue;
            };
            let Some(mut container) = registry.take::<ThreadComponent>(entity) else {
                continue;
            };

            let mut updated = false;
            for local in 0..container.threads.len() {
                if !cadences.contains(&container.threads[local].flags.cadence) {
                    continue;
                }
                if container.threads[local].is_suspended()
                    && !try_resume_sleeping(&mut container.threads[local])
                {
                    continue;
                }

                let initial_cadence = container.threads[local].flags.cadence;
                match initial_cadence {
                    Cadence::Realtime => loop {
                        let initial = container.threads[local].next_instruction;
                        let updated_index =
                            self.step_thread(registry, entity, &descriptor, &mut container, local);
                        if updated_index == initial {
                            break;
                        }
                        if container.threads[local].is_suspended() {
                            break;
                        }
                        if realtime_implicit_yield(
                            &descriptor,
                            &container.threads[local],
                            initial,
                            initial_cadence,
                        ) {
                            break;
                        }
                    },
                    _ => {
                        self.step_thread(registry, entity, &descriptor, &mut container, local);
                    }
                }

                threads_updated += 1;
                updated = true;

                if container.threads[local].flags.complete {
                    let info = thread_info(&container, local, entity);
                    self.queue_runtime_event(RuntimeEvent::ThreadComplete(OnThreadComplete(info)));
                }
            }

            registry.insert(entity, container);
            if updated {
                self.queue_runtime_event(RuntimeEvent::EntityThreadsUpdated(
                    OnEntityThreadsUpdated { entity },
                ));
            }
        }

        threads_updated
    }

    // ------------------------------------------------------------------
    // Stepping.

    /// Advance one thread by one instruction (or one fiber step). Returns
    /// the updated program counter.
    pub fn step_thread(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        descriptor: &EntityDescriptor,
        container: &mut ThreadComponent,
        local: usize,
    ) -> InstructionIndex {
        let source_index = container.threads[local].thread_index;
        let source = source_index.and_then(|index| descriptor.thread(index));

        if let Some(source) = source {
            let pc = container.threads[local].next_instruction;
            if pc as usize >= source.len() {
                // Stepped beyond the program; clamp to the last valid
                // instruction and mark complete.
                let thread = &mut container.threads[local];
                thread.flags.complete = true;
                if !source.is_empty() {
                    thread.next_instruction = (source.len() - 1) as InstructionIndex;
                }
                return thread.next_instruction;
            }
        }

        let mut stride: InstructionCount = 1;
        let mut coroutine_expr: Option<ValueExpr> = None;

        if let Some(source) = source {
            let pc = container.threads[local].next_instruction;
            if let Some(instruction) = source.instruction(pc) {
                let has_fiber = container.threads[local].fiber.is_some();
                let is_coroutine = matches!(instruction, Instruction::CoroutineCall(_));
                if !has_fiber || is_coroutine {
                    self.exec_instruction(
                        registry,
                        entity,
                        descriptor,
                        container,
                        local,
                        instruction,
                        &mut stride,
                        &mut coroutine_expr,
                    );
                }
            }
        }

        if container.threads[local].fiber.is_some() {
            self.advance_fiber(
                registry,
                entity,
                descriptor,
                container,
                local,
                &mut stride,
                &coroutine_expr,
            );
        }

        let thread = &mut container.threads[local];
        let mut updated_index = thread.next_instruction;
        match source {
            Some(source) => {
                updated_index = updated_index.saturating_add(stride);
                // When suspended, completion is deferred until the next
                // attempt to process an instruction.
                if !thread.is_suspended() && (updated_index as usize) >= source.len() {
                    thread.flags.complete = true;
                } else {
                    thread.next_instruction = updated_index;
                }
            }
            None => {
                if !thread.is_suspended() && thread.fiber.is_none() {
                    // Neither instruction source nor fiber: nothing to run.
                    thread.flags.complete = true;
                }
            }
        }
        updated_index
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_instruction(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        descriptor: &EntityDescriptor,
        container: &mut ThreadComponent,
        local: usize,
        instruction: &Instruction,
        stride: &mut InstructionCount,
        coroutine_expr: &mut Option<ValueExpr>,
    ) {
        match instruction {
            Instruction::NoOp => {}

            Instruction::StateTransition { state_name } => {
                self.commands.push(Command::StateChange {
                    source: entity,
                    target: entity,
                    state_name: *state_name,
                });
            }

            Instruction::StateCommand { command } => {
                let variables =
                    self.thread_variable_context(registry, entity, container, local, None);
                let mut payload = command.instantiate(registry, Some(entity), &variables);
                if payload.is_empty() {
                    warn!(type_id = command.type_id.0, "command payload did not build");
                } else {
                    payload.set_member(Symbol::of("source"), Value::new(entity));
                    payload.set_member(Symbol::of("target"), Value::new(entity));
                    self.commands.push(Command::Emit {
                        source: entity,
                        target: entity,
                        payload,
                    });
                }
            }

            Instruction::StateUpdate { components } => {
                for component in components {
                    self.commands.push(Command::ComponentUpdate {
                        source: entity,
                        target: entity,
                        component: component.clone(),
                    });
                }
            }

            Instruction::ThreadAction(action) => {
                let Some(target) = action.target_entity.resolve(registry, Some(entity)) else {
                    warn!(entity = entity.0, "thread action target did not resolve");
                    return;
                };
                let spawn_state = container.threads[local].state_index;
                let command =
                    thread_action_command(action.kind.clone(), entity, target, spawn_state);
                self.commands.push(command);
            }

            Instruction::Start {
                thread,
                restart_existing,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.commands.push(Command::ThreadSpawn {
                    source: entity,
                    target,
                    threads,
                    restart_existing: *restart_existing,
                    state_index: None,
                    parent_thread_name: container.threads[local].thread_id,
                });
            }

            Instruction::Restart { thread } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.commands.push(Command::ThreadSpawn {
                    source: entity,
                    target,
                    threads,
                    restart_existing: true,
                    state_index: None,
                    parent_thread_name: container.threads[local].thread_id,
                });
            }

            Instruction::Stop {
                thread,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                if target == entity && targets_current_thread(&threads, &container.threads[local]) {
                    // Force-pause while the queued stop travels; the event
                    // produced may not execute immediately after this
                    // instruction.
                    container.threads[local].pause();
                }
                self.commands.push(Command::ThreadStop {
                    source: entity,
                    target,
                    threads,
                    check_linked: *check_linked,
                });
            }

            // Pause and Resume trigger immediately to stay compatible with
            // multi-instruction blocks.
            Instruction::Pause {
                thread,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.run_thread_op_for(
                    registry,
                    entity,
                    container,
                    descriptor,
                    target,
                    ThreadOp::Pause {
                        threads,
                        check_linked: *check_linked,
                    },
                );
            }

            Instruction::Resume {
                thread,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.run_thread_op_for(
                    registry,
                    entity,
                    container,
                    descriptor,
                    target,
                    ThreadOp::Resume {
                        threads,
                        check_linked: *check_linked,
                    },
                );
            }

            Instruction::Link => {
                if !container.link_thread(local) {
                    warn!(entity = entity.0, "link refused; name already taken");
                }
            }

            Instruction::Unlink { thread } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.commands.push(Command::ThreadUnlink {
                    source: entity,
                    target,
                    threads,
                });
            }

            Instruction::Attach {
                thread,
                state_id,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.commands.push(Command::ThreadAttach {
                    source: entity,
                    target,
                    threads,
                    check_linked: *check_linked,
                    state_id: *state_id,
                });
            }

            Instruction::Detach {
                thread,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                self.commands.push(Command::ThreadDetach {
                    source: entity,
                    target,
                    threads,
                    check_linked: *check_linked,
                });
            }

            Instruction::Sleep {
                thread,
                duration,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                // Immediate pause, timed resume.
                self.run_thread_op_for(
                    registry,
                    entity,
                    container,
                    descriptor,
                    target,
                    ThreadOp::Pause {
                        threads,
                        check_linked: *check_linked,
                    },
                );
                self.commands.push_timed(
                    *duration,
                    Command::ThreadResume {
                        source: entity,
                        target,
                        threads,
                        check_linked: *check_linked,
                    },
                );
            }

            Instruction::Yield { condition } => {
                let Some(condition) = descriptor.condition(*condition) else {
                    warn!("unresolved yield condition; pausing thread for safety");
                    container.threads[local].pause();
                    return;
                };
                let ctx = EvaluationContext::new(self.thread_variable_context(
                    registry, entity, container, local, None,
                ));
                if condition.condition_met(
                    &descriptor.shared_storage,
                    None,
                    None,
                    registry,
                    Some(entity),
                    &ctx,
                ) {
                    // Already satisfied: the yield becomes a no-op.
                    return;
                }

                let mut registered = false;
                condition.enumerate_types(&descriptor.shared_storage, &mut |type_id| {
                    self.listen(type_id).add_entity(entity);
                    registered = true;
                });
                if !registered {
                    warn!("yield condition references no event types; pausing thread");
                    container.threads[local].pause();
                    return;
                }

                container.threads[local].yield_now();
                *stride = 0;
            }

            Instruction::Skip {
                thread,
                count,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                // Immediate: deferred skips would race the program counter.
                self.run_thread_op_for(
                    registry,
                    entity,
                    container,
                    descriptor,
                    target,
                    ThreadOp::Skip {
                        threads,
                        check_linked: *check_linked,
                        count: *count,
                    },
                );
            }

            Instruction::Rewind {
                thread,
                count,
                check_linked,
            } => {
                let Some((target, threads)) =
                    resolve_thread_ref(registry, entity, container, local, thread)
                else {
                    return;
                };
                if target == entity && thread.thread_id.is_none() {
                    *stride = 0;
                }
                self.run_thread_op_for(
                    registry,
                    entity,
                    container,
                    descriptor,
                    target,
                    ThreadOp::Rewind {
                        threads,
                        check_linked: *check_linked,
                        count: *count,
                    },
                );
            }

            Instruction::IfBlock { condition, size } => {
                let met = descriptor
                    .condition(*condition)
                    .map(|condition| {
                        let ctx = EvaluationContext::new(self.thread_variable_context(
                            registry, entity, container, local, None,
                        ));
                        condition.condition_met(
                            &descriptor.shared_storage,
                            None,
                            None,
                            registry,
                            Some(entity),
                            &ctx,
                        )
                    })
                    .unwrap_or(false);
                if !met {
                    // Step past the block: one for this instruction plus its
                    // body.
                    *stride = stride.saturating_add(*size);
                }
            }

            Instruction::MultiBlock { size } => {
                if *size > 0 {
                    // Progress manually so the block instruction itself is
                    // not re-entered.
                    container.threads[local].next_instruction += 1;
                    let target_index = container.threads[local].next_instruction + size;
                    while container.threads[local].next_instruction < target_index
                        && !container.threads[local].is_suspended()
                    {
                        let active = container.threads[local].next_instruction;
                        self.step_thread(registry, entity, descriptor, container, local);
                        let updated = container.threads[local].next_instruction;
                        // Backwards movement means a loop; the runtime
                        // decides next tick whether to continue.
                        if updated < active {
                            break;
                        }
                    }
                    *stride = 0;
                }
            }

            Instruction::CadenceBlock { cadence, size } => {
                if *cadence == Cadence::Realtime && *size > 0 {
                    let multi = Instruction::MultiBlock { size: *size };
                    self.exec_instruction(
                        registry,
                        entity,
                        descriptor,
                        container,
                        local,
                        &multi,
                        stride,
                        coroutine_expr,
                    );
                    container.threads[local].flags.cadence = Cadence::Realtime;
                } else {
                    container.threads[local].flags.cadence = *cadence;
                }
            }

            Instruction::FunctionCall(expr) | Instruction::Expression(expr) => {
                let ctx = EvaluationContext::new(self.thread_variable_context(
                    registry, entity, container, local, None,
                ));
                let result = expr::evaluate(expr, registry, Some(entity), &ctx);
                if let Ok(fiber) = result.take::<FiberHandle>() {
                    container.threads[local].fiber = Some(fiber);
                    *coroutine_expr = Some(expr.clone());
                }
            }

            Instruction::CoroutineCall(expr) => {
                if container.threads[local].fiber.is_none() {
                    let ctx = EvaluationContext::new(self.thread_variable_context(
                        registry, entity, container, local, None,
                    ));
                    let result = expr::evaluate(expr, registry, Some(entity), &ctx);
                    match result.take::<FiberHandle>() {
                        Ok(fiber) => {
                            container.threads[local].fiber = Some(fiber);
                            *coroutine_expr = Some(expr.clone());
                        }
                        Err(_) => {
                            warn!("coroutine expression did not produce a fiber");
                        }
                    }
                }
            }

            Instruction::VariableDeclaration(target) => {
                let ctx = self.thread_variable_context(
                    registry,
                    entity,
                    container,
                    local,
                    Some(target.scope),
                );
                if !ctx.declare(target.scope, target.name)
                    && !ctx.exists(target.scope, target.name)
                {
                    warn!(
                        name = target.name.0,
                        scope = ?target.scope,
                        "failed to declare variable"
                    );
                }
            }

            Instruction::VariableAssignment {
                target_entity,
                thread_id,
                variable,
                expr,
                ignore_if_already_assigned,
                ignore_if_not_declared,
            } => {
                self.exec_variable_assignment(
                    registry,
                    entity,
                    container,
                    local,
                    target_entity,
                    *thread_id,
                    variable,
                    expr,
                    *ignore_if_already_assigned,
                    *ignore_if_not_declared,
                );
            }

            // Fallback implementation; the listener executes captures that
            // follow a satisfied yield. Always advances; the captured value
            // may be empty.
            Instruction::EventCapture {
                variable,
                intended_type,
            } => {
                let ctx = self.thread_variable_context(
                    registry,
                    entity,
                    container,
                    local,
                    Some(variable.scope),
                );
                let intended = intended_type.or_else(|| {
                    ctx.get(variable.scope, variable.name)
                        .and_then(|existing| existing.type_id())
                });
                let fallback = intended
                    .map(value::default_construct)
                    .unwrap_or_else(Value::empty);
                ctx.set(variable.scope, variable.name, fallback);
            }

            Instruction::Assert {
                condition,
                message,
                representation,
            } => {
                let met = descriptor
                    .condition(*condition)
                    .map(|condition| {
                        let ctx = EvaluationContext::new(self.thread_variable_context(
                            registry, entity, container, local, None,
                        ));
                        condition.condition_met(
                            &descriptor.shared_storage,
                            None,
                            None,
                            registry,
                            Some(entity),
                            &ctx,
                        )
                    })
                    .unwrap_or(false);
                if !met {
                    let message = message.and_then(|reference| descriptor.string(reference));
                    let representation =
                        representation.and_then(|reference| descriptor.string(reference));
                    match (message, representation) {
                        (Some(message), Some(representation)) => {
                            error!(entity = entity.0, %message, %representation, "assert failed")
                        }
                        (Some(message), None) => {
                            error!(entity = entity.0, %message, "assert failed")
                        }
                        (None, Some(representation)) => {
                            error!(entity = entity.0, %representation, "assert failed")
                        }
                        (None, None) => error!(entity = entity.0, "assert failed"),
                    }
                    warn!("terminating thread after failed assert");
                    let stop = Instruction::Stop {
                        thread: ThreadRef::current(),
                        check_linked: true,
                    };
                    self.exec_instruction(
                        registry,
                        entity,
                        descriptor,
                        container,
                        local,
                        &stop,
                        stride,
                        coroutine_expr,
                    );
                }
            }

            Instruction::Dynamic(expr) => {
                let ctx = EvaluationContext::new(self.thread_variable_context(
                    registry, entity, container, local, None,
                ));
                let result = expr::evaluate(expr, registry, Some(entity), &ctx);
                if result.is_empty() {
                    warn!("failed to resolve instruction; continuing anyway");
                    return;
                }
                match result.take::<Instruction>() {
                    Ok(resolved) => {
                        self.exec_instruction(
                            registry,
                            entity,
                            descriptor,
                            container,
                            local,
                            &resolved,
                            stride,
                            coroutine_expr,
                        );
                    }
                    Err(_) => warn!("dynamic expression did not yield an instruction"),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_variable_assignment(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        container: &mut ThreadComponent,
        local: usize,
        target_entity: &strand_core::target::EntityTarget,
        thread_id: Option<Symbol>,
        variable: &Option<strand_core::indirect::VariableTarget>,
        expr: &ValueExpr,
        ignore_if_already_assigned: bool,
        ignore_if_not_declared: bool,
    ) {
        let own_thread_id = container.threads[local].thread_id;
        let is_local = target_entity.is_self()
            && (thread_id.is_none() || thread_id == own_thread_id);

        if is_local {
            let scope = variable.map(|v| v.scope);
            let ctx = EvaluationContext::new(
                self.thread_variable_context(registry, entity, container, local, scope),
            );
            if let Some(variable) = variable {
                match ctx.variables.get(variable.scope, variable.name) {
                    Some(existing) => {
                        if ignore_if_already_assigned && !existing.is_empty() {
                            return;
                        }
                    }
                    None => {
                        if ignore_if_not_declared {
                            return;
                        }
                    }
                }
            }

            let result = expr::evaluate(expr, registry, Some(entity), &ctx);
            if result.is_empty() || variable.is_none() {
                return;
            }
            let variable = variable.unwrap();
            ctx.variables
                .set(variable.scope, variable.name, result.clone());

            let resolved = resolve_indirect(&result, registry, Some(entity), &ctx.variables);
            let info = thread_info(container, local, entity);
            self.queue_runtime_event(RuntimeEvent::ThreadVariableUpdate(OnThreadVariableUpdate {
                info,
                resolved_variable_name: variable.name,
                variable_scope: variable.scope,
                variable_update_result: resolved,
            }));
            return;
        }

        // Remote variable assignment.
        let Some(target) = target_entity.resolve(registry, Some(entity)) else {
            warn!("failed to assign variable for remote entity: target did not resolve");
            return;
        };

        let target_scope = variable.map(|v| v.scope).unwrap_or(VariableScope::Local);
        let Some((target_ctx, target_info)) = self.remote_variable_context(
            registry,
            entity,
            container,
            target,
            thread_id,
            target_scope,
        ) else {
            return;
        };

        if let Some(variable) = variable {
            match target_ctx.get(variable.scope, variable.name) {
                Some(existing) => {
                    if ignore_if_already_assigned && !existing.is_empty() {
                        return;
                    }
                }
                None => {
                    if ignore_if_not_declared {
                        return;
                    }
                }
            }
        }

        // The expression evaluates in the *source* thread's context.
        let source_ctx = EvaluationContext::new(
            self.thread_variable_context(registry, entity, container, local, None),
        );
        let result = expr::evaluate(expr, registry, Some(entity), &source_ctx);
        if result.is_empty() || variable.is_none() {
            return;
        }
        let variable = variable.unwrap();
        target_ctx.set(variable.scope, variable.name, result.clone());

        if let Some(info) = target_info {
            let resolved = resolve_indirect(&result, registry, Some(target), &target_ctx);
            self.queue_runtime_event(RuntimeEvent::ThreadVariableUpdate(OnThreadVariableUpdate {
                info,
                resolved_variable_name: variable.name,
                variable_scope: variable.scope,
                variable_update_result: resolved,
            }));
        }
    }

    /// Variable context for the in-flight thread. `referenced_scope` forces
    /// allocation of the store backing that scope.
    fn thread_variable_context(
        &self,
        registry: &mut Registry,
        entity: Entity,
        container: &mut ThreadComponent,
        local: usize,
        referenced_scope: Option<VariableScope>,
    ) -> VariableContext {
        let local_store = match referenced_scope {
            Some(VariableScope::Local) => Some(container.threads[local].variables()),
            _ => container.threads[local].variables.clone(),
        };
        let global_store = match referenced_scope {
            Some(VariableScope::Global) => Some(container.global_variables()),
            _ => container.global_variables.clone(),
        };

        if referenced_scope == Some(VariableScope::Context)
            && registry.get::<ContextComponent>(entity).is_none()
        {
            registry.insert(entity, ContextComponent::default());
            context::initialize_context(registry, entity);
        }
        let shared_context = registry
            .get::<ContextComponent>(entity)
            .and_then(|c| c.shared.clone());

        VariableContext {
            local: local_store,
            global: global_store,
            context: shared_context,
            universal: Some(self.universal_variables.clone()),
        }
    }

    /// Variable context for another entity's thread (or this entity's
    /// remote-addressed thread). Returns the context plus the target thread
    /// info for the update event, when a thread was found.
    fn remote_variable_context(
        &self,
        registry: &mut Registry,
        self_entity: Entity,
        self_container: &mut ThreadComponent,
        target: Entity,
        thread_id: Option<Symbol>,
        referenced_scope: VariableScope,
    ) -> Option<(VariableContext, Option<ThreadEventInfo>)> {
        let (local_store, global_store, info) = if target == self_entity {
            let local = thread_id.and_then(|id| self_container.find_local_by_id(id, false));
            let local_store = local.map(|l| self_container.threads[l].variables());
            let info = local.map(|l| thread_info(self_container, l, target));
            (
                local_store,
                Some(self_container.global_variables()),
                info,
            )
        } else {
            let Some(target_container) = registry.get_mut::<ThreadComponent>(target) else {
                warn!(
                    entity = target.0,
                    "failed to assign variable: no thread component on target"
                );
                return None;
            };
            let local = thread_id.and_then(|id| target_container.find_local_by_id(id, false));
            let local_store = local.map(|l| target_container.threads[l].variables());
            let global = target_container.global_variables();
            let info = local.map(|l| thread_info(target_container, l, target));
            (local_store, Some(global), info)
        };

        if referenced_scope == VariableScope::Context
            && registry.get::<ContextComponent>(target).is_none()
        {
            registry.insert(target, ContextComponent::default());
            context::initialize_context(registry, target);
        }
        let shared_context = registry
            .get::<ContextComponent>(target)
            .and_then(|c| c.shared.clone());

        Some((
            VariableContext {
                local: local_store,
                global: global_store,
                context: shared_context,
                universal: Some(self.universal_variables.clone()),
            },
            info,
        ))
    }

    // ------------------------------------------------------------------
    // Fibers.

    #[allow(clippy::too_many_arguments)]
    fn advance_fiber(
        &mut self,
        registry: &mut Registry,
        entity: Entity,
        descriptor: &EntityDescriptor,
        container: &mut ThreadComponent,
        local: usize,
        stride: &mut InstructionCount,
        coroutine_expr: &Option<ValueExpr>,
    ) {
        let Some(mut fiber) = container.threads[local].fiber.take() else {
            return;
        };

        let response = {
            // Marker scoped to the resume; released on unwind too.
            let _guard = fiber::RunningGuard::acquire();
            fiber.resume()
        };

        let mut token = if fiber.is_done() {
            ControlFlowToken::Complete
        } else {
            ControlFlowToken::Default
        };

        match response {
            FiberResponse::None => {}
            FiberResponse::Token(explicit) => token = explicit,
            FiberResponse::Action(action) => {
                let spawn_state = container.threads[local].state_index;
                let commands =
                    self.action_commands(registry, descriptor, &action, entity, entity, spawn_state);
                for command in commands {
                    self.commands.push(command);
                }
            }
            FiberResponse::Instruction(instruction) => {
                self.exec_instruction(
                    registry,
                    entity,
                    descriptor,
                    container,
                    local,
                    &instruction,
                    stride,
                    &mut None,
                );
            }
            FiberResponse::YieldEvent(type_id) => {
                self.listen(type_id).add_entity(entity);
                container.threads[local].yield_now();
                *stride = 0;
            }
            FiberResponse::Sleep(duration) => {
                let sleep = Instruction::Sleep {
                    thread: ThreadRef::current(),
                    duration,
                    check_linked: true,
                };
                self.exec_instruction(
                    registry,
                    entity,
                    descriptor,
                    container,
                    local,
                    &sleep,
                    stride,
                    &mut None,
                );
            }
        }

        match token {
            ControlFlowToken::Default => {
                restore_fiber(container, local, fiber);
            }
            ControlFlowToken::NextUpdate => {
                *stride = 0;
                restore_fiber(container, local, fiber);
            }
            ControlFlowToken::Restart => {
                *stride = 0;
                match coroutine_expr {
                    Some(expr) => {
                        let ctx = EvaluationContext::new(self.thread_variable_context(
                            registry, entity, container, local, None,
                        ));
                        let result = expr::evaluate(expr, registry, Some(entity), &ctx);
                        match result.take::<FiberHandle>() {
                            Ok(new_fiber) => container.threads[local].fiber = Some(new_fiber),
                            Err(_) => restore_fiber(container, local, fiber),
                        }
                    }
                    None => restore_fiber(container, local, fiber),
                }
            }
            ControlFlowToken::UntilWake => {
                let pause = Instruction::Pause {
                    thread: ThreadRef::current(),
                    check_linked: true,
                };
                self.exec_instruction(
                    registry,
                    entity,
                    descriptor,
                    container,
                    local,
                    &pause,
                    stride,
                    &mut None,
                );
                // Fiber-only threads have no addressable thread target; park
                // them directly.
                if !container.threads[local].flags.paused {
                    container.threads[local].pause();
                }
                *stride = 0;
                restore_fiber(container, local, fiber);
            }
            ControlFlowToken::Complete => {
                // Fiber dropped.
            }
        }
    }
}

// ----------------------------------------------------------------------
// Free helpers.

fn restore_fiber(container: &mut ThreadComponent, local: usize, fiber: FiberHandle) {
    if container.threads[local].fiber.is_none() {
        container.threads[local].fiber = Some(fiber);
    }
}

fn try_resume_sleeping(thread: &mut crate::thread::EntityThread) -> bool {
    if !thread.is_sleeping() {
        return false;
    }
    let Some(fiber) = thread.fiber.as_mut() else {
        return false;
    };
    if fiber.poll_wake() {
        thread.resume();
        return true;
    }
    false
}

/// Whether a `Realtime` loop must stop after this instruction: a rewind, or
/// a cadence block that changed the cadence.
fn realtime_implicit_yield(
    descriptor: &EntityDescriptor,
    thread: &crate::thread::EntityThread,
    executed_index: InstructionIndex,
    initial_cadence: Cadence,
) -> bool {
    let Some(thread_index) = thread.thread_index else {
        return false;
    };
    let Some(description) = descriptor.thread(thread_index) else {
        return false;
    };
    match description.instruction(executed_index) {
        Some(Instruction::Rewind { .. }) => true,
        Some(Instruction::CadenceBlock { cadence, .. }) => *cadence != initial_cadence,
        _ => false,
    }
}

fn thread_info(container: &ThreadComponent, local: usize, entity: Entity) -> ThreadEventInfo {
    let thread = &container.threads[local];
    ThreadEventInfo {
        entity,
        thread_index: thread.thread_index,
        thread_id: thread.thread_id,
        local_instance: local,
        last_instruction_index: thread.next_instruction,
    }
}

/// Resolve the entity and thread-target an instruction addresses. With a
/// self entity target and an empty thread target, the current thread is
/// used.
fn resolve_thread_ref(
    registry: &Registry,
    entity: Entity,
    container: &ThreadComponent,
    local: usize,
    thread_ref: &ThreadRef,
) -> Option<(Entity, ThreadTarget)> {
    let Some(target_entity) = thread_ref.target_entity.resolve(registry, Some(entity)) else {
        warn!(entity = entity.0, "thread instruction target did not resolve");
        return None;
    };

    let mut target_thread: ThreadTarget = thread_ref
        .thread_id
        .map(ThreadTarget::Id)
        .unwrap_or_default();

    if target_entity == entity && target_thread.is_empty() {
        let current = &container.threads[local];
        if let Some(thread_id) = current.thread_id {
            target_thread = ThreadTarget::Id(thread_id);
        } else if let Some(thread_index) = current.thread_index {
            target_thread = ThreadTarget::Range(ThreadRange::single(thread_index));
        }
    }

    if target_thread.is_empty() {
        warn!(entity = entity.0, "thread instruction resolved to no threads");
        return None;
    }
    Some((target_entity, target_thread))
}

fn targets_current_thread(target: &ThreadTarget, thread: &crate::thread::EntityThread) -> bool {
    match target {
        ThreadTarget::Id(id) => thread.thread_id == Some(*id),
        ThreadTarget::Range(range) => {
            range.count == 1 && thread.thread_index == Some(range.start)
        }
        ThreadTarget::Empty => false,
    }
}

fn for_target_indices(
    descriptor: &EntityDescriptor,
    threads: &ThreadTarget,
    mut f: impl FnMut(strand_core::ThreadIndex),
) {
    match threads {
        ThreadTarget::Empty => warn!("empty thread command"),
        ThreadTarget::Range(range) => {
            for index in range.iter() {
                f(index);
            }
        }
        ThreadTarget::Id(thread_id) => match descriptor.thread_index(*thread_id) {
            Some(index) => f(index),
            None => warn!(thread = thread_id.0, "unresolved thread id"),
        },
    }
}

fn thread_action_command(
    kind: ThreadActionKind,
    source: Entity,
    target: Entity,
    spawn_state: Option<StateIndex>,
) -> Command {
    match kind {
        ThreadActionKind::Spawn {
            threads,
            restart_existing,
            state_index,
        } => Command::ThreadSpawn {
            source,
            target,
            threads,
            restart_existing,
            state_index: state_index.or(spawn_state),
            parent_thread_name: None,
        },
        ThreadActionKind::Stop {
            threads,
            check_linked,
        } => Command::ThreadStop {
            source,
            target,
            threads,
            check_linked,
        },
        ThreadActionKind::Pause {
            threads,
            check_linked,
        } => Command::ThreadPause {
            source,
            target,
            threads,
            check_linked,
        },
        ThreadActionKind::Resume {
            threads,
            check_linked,
        } => Command::ThreadResume {
            source,
            target,
            threads,
            check_linked,
        },
        ThreadActionKind::Attach {
            threads,
            check_linked,
            state_id,
        } => Command::ThreadAttach {
            source,
            target,
            threads,
            check_linked,
            state_id,
        },
        ThreadActionKind::Detach {
            threads,
            check_linked,
        } => Command::ThreadDetach {
            source,
            target,
            threads,
            check_linked,
        },
        ThreadActionKind::Unlink { threads } => Command::ThreadUnlink {
            source,
            target,
            threads,
        },
        ThreadActionKind::Skip {
            threads,
            check_linked,
            count,
        } => Command::ThreadSkip {
            source,
            target,
            threads,
            check_linked,
            instruction_count: count,
        },
        ThreadActionKind::Rewind {
            threads,
            check_linked,
            count,
        } => Command::ThreadRewind {
            source,
            target,
            threads,
            check_linked,
            instruction_count: count,
        },
    }
}

fn resolve_player_index(event: &Value) -> Option<PlayerIndex> {
    let member = Symbol::of("player_index");
    if !event.has_member(member) {
        return None;
    }
    event.member(member).as_i64().map(|v| v as PlayerIndex)
}

fn entity_matches_player(registry: &Registry, entity: Entity, player: PlayerIndex) -> bool {
    if let Some(component) = registry.get::<PlayerComponent>(entity) {
        return component.player_index == player;
    }
    if let Some(component) = registry.get::<PlayerTargetComponent>(entity) {
        return component.player_index == player;
    }
    // Entities with no player binding receive everything.
    true
}

fn patch_members(registry: &mut Registry, target: Entity, type_id: TypeId, component: &Value) {
    let Some(info) = value::type_info(type_id) else {
        return;
    };
    let members: Vec<Symbol> = info.member_names().to_vec();
    let Some(existing) = registry.get_meta_mut(target, type_id) else {
        return;
    };
    for member in members {
        let value = component.member(member);
        if !value.is_empty() {
            existing.set_member(member, value);
        }
    }
}

fn apply_component_update(registry: &mut Registry, target: Entity, component: &TypeDescriptor) {
    let variables = entity_variable_context(registry, target);
    match registry.get_meta(target, component.type_id).cloned() {
        Some(mut existing) => {
            component.apply_assignments(&mut existing, registry, Some(target), &variables);
            registry.emplace_meta(target, existing);
        }
        None => {
            let fresh = component.instantiate(registry, Some(target), &variables);
            if !fresh.is_empty() {
                registry.emplace_meta(target, fresh);
            }
        }
    }
}
