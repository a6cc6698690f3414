//! Shared entity-context propagation.
//!
//! An entity context is a variable store shared by reference among an entity
//! and every descendant that has no explicit context of its own. Context
//! allocation and realignment is handled here; entities merely attach a
//! [`ContextComponent`].

use std::rc::Rc;

use strand_core::registry::Registry;
use strand_core::variables::{shared_context, SharedContext, VariableContext};
use strand_core::Entity;

/// Carries the shared context handle for one entity.
#[derive(Clone, Default)]
pub struct ContextComponent {
    pub shared: Option<SharedContext>,
}

impl ContextComponent {
    pub fn with_context(shared: SharedContext) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    /// Merge an incoming context's variables into this one without
    /// overwriting. Returns how many variables were adopted.
    pub fn adopt(&self, incoming: &Option<SharedContext>) -> usize {
        let (Some(ours), Some(theirs)) = (&self.shared, incoming) else {
            return 0;
        };
        if Rc::ptr_eq(ours, theirs) {
            return 0;
        }
        let theirs = theirs.borrow();
        ours.borrow_mut().set_missing_variables(&theirs)
    }

    pub fn shares_with(&self, other: &ContextComponent) -> bool {
        match (&self.shared, &other.shared) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Variable context for evaluations with no thread attached: just the
/// entity's shared context scope.
pub fn entity_variable_context(registry: &Registry, entity: Entity) -> VariableContext {
    VariableContext {
        context: registry
            .get::<ContextComponent>(entity)
            .and_then(|c| c.shared.clone()),
        ..Default::default()
    }
}

/// Called when a `ContextComponent` is first attached to `entity`.
pub fn initialize_context(registry: &mut Registry, entity: Entity) {
    let component = registry
        .get::<ContextComponent>(entity)
        .cloned()
        .unwrap_or_default();

    if registry.parent_of(entity).is_none() && registry.children_of(entity).is_empty() {
        if component.shared.is_none() {
            registry.insert(entity, ContextComponent::with_context(shared_context()));
        }
        return;
    }

    if component.shared.is_some() {
        realign_child_contexts(registry, entity);
    } else {
        use_parent_context_or_generate(registry, entity, true, false);
    }
}

/// Iterate immediate children: children without a context inherit this
/// entity's; children with a different one adopt-merge and then switch.
pub fn realign_child_contexts(registry: &mut Registry, entity: Entity) {
    let Some(parent_component) = registry.get::<ContextComponent>(entity).cloned() else {
        return;
    };
    let children: Vec<Entity> = registry.children_of(entity).to_vec();
    for child in children {
        match registry.get::<ContextComponent>(child).cloned() {
            Some(child_component) => {
                if !child_component.shares_with(&parent_component) {
                    parent_component.adopt(&child_component.shared);
                    registry.insert(
                        child,
                        ContextComponent {
                            shared: parent_component.shared.clone(),
                        },
                    );
                }
            }
            None => {
                registry.insert(
                    child,
                    ContextComponent {
                        shared: parent_component.shared.clone(),
                    },
                );
            }
        }
    }
}

/// Walk up parents to the nearest ancestor with a context and share it
/// (merging-without-overwrite). Without one, allocate fresh (unless
/// `keep_existing` preserves a context already present). Returns whether a
/// parent context was found and merged.
pub fn use_parent_context_or_generate(
    registry: &mut Registry,
    entity: Entity,
    realign_children: bool,
    keep_existing: bool,
) -> bool {
    let mut ancestors = Vec::new();
    registry.enumerate_parents(entity, |parent| {
        ancestors.push(parent);
        true
    });

    let mut adopted_from: Option<SharedContext> = None;
    for parent in ancestors {
        if let Some(shared) = registry
            .get::<ContextComponent>(parent)
            .and_then(|c| c.shared.clone())
        {
            adopted_from = Some(shared);
            break;
        }
    }

    match adopted_from {
        Some(parent_context) => {
            let ours = registry
                .get::<ContextComponent>(entity)
                .cloned()
                .unwrap_or_default();
            ContextComponent::with_context(parent_context.clone()).adopt(&ours.shared);
            registry.insert(entity, ContextComponent::with_context(parent_context));
            if realign_children {
                realign_child_contexts(registry, entity);
            }
            true
        }
        None => {
            let existing = registry
                .get::<ContextComponent>(entity)
                .and_then(|c| c.shared.clone());
            if !keep_existing || existing.is_none() {
                registry.insert(entity, ContextComponent::with_context(shared_context()));
                if realign_children {
                    realign_child_contexts(registry, entity);
                }
            }
            false
        }
    }
}

/// Parent-changed handler: re-run the parent-or-generate routine; if no new
/// parent context could be merged, copy the outgoing (pre-reparent) context
/// into the fresh one so the entity's variables survive the reparent.
pub fn handle_parent_changed(registry: &mut Registry, entity: Entity, old_parent: Option<Entity>) {
    if registry.get::<ContextComponent>(entity).is_none() {
        return;
    }

    let outgoing = registry
        .get::<ContextComponent>(entity)
        .and_then(|c| c.shared.clone())
        .or_else(|| {
            old_parent
                .and_then(|p| registry.get::<ContextComponent>(p))
                .and_then(|c| c.shared.clone())
        });

    let merged = use_parent_context_or_generate(registry, entity, true, false);
    if !merged {
        // A fresh empty context was generated; carry the old contents over.
        let Some(outgoing) = outgoing else {
            return;
        };
        if let Some(component) = registry.get::<ContextComponent>(entity) {
            if let Some(shared) = &component.shared {
                if !Rc::ptr_eq(shared, &outgoing) {
                    let old = outgoing.borrow();
                    shared.borrow_mut().set_missing_variables(&old);
                }
            }
        }
    }
}
