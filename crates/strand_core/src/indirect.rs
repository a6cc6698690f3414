//! Indirect value references.
//!
//! Values stored in compiled programs are frequently one level removed from
//! the data they describe: a handle into shared storage, a data member of a
//! targeted entity's component, or a variable in some scope. These wrappers
//! are themselves registered value types so they can travel inside opaque
//! [`Value`] cells; [`resolve_indirect`] peels exactly one level.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::descriptor::InstanceComponent;
use crate::hash::{Symbol, TypeId};
use crate::registry::{Entity, Registry};
use crate::storage::IndirectRef;
use crate::target::EntityTarget;
use crate::value::{self, Value};
use crate::variables::{VariableContext, VariableScope};

/// `(EntityTarget, type_id, member)`: resolve an entity, fetch the typed
/// component, read the named field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectDataMember {
    pub target: EntityTarget,
    pub type_id: TypeId,
    pub member: Symbol,
}

impl IndirectDataMember {
    pub fn read(&self, registry: &Registry, source: Option<Entity>) -> Value {
        let Some(entity) = self.target.resolve(registry, source) else {
            warn!(type_id = self.type_id.0, "data member target did not resolve");
            return Value::empty();
        };
        match registry.get_meta(entity, self.type_id) {
            Some(component) => component.member(self.member),
            None => Value::empty(),
        }
    }
}

/// `(scope, resolved_name)` variable reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableTarget {
    pub scope: VariableScope,
    pub name: Symbol,
}

impl VariableTarget {
    pub fn new(scope: VariableScope, name: Symbol) -> Self {
        Self { scope, name }
    }
}

/// A variable reference that can cross thread boundaries: the owning entity
/// and thread are resolved first, then the variable inside that thread's
/// scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectVariableTarget {
    pub target: EntityTarget,
    pub thread_id: Option<Symbol>,
    pub variable: VariableTarget,
}

fn register_indirect_types() {
    static DONE: OnceCell<()> = OnceCell::new();
    DONE.get_or_init(|| {
        value::register_basic::<IndirectRef>("IndirectRef");
        value::register_basic::<IndirectDataMember>("IndirectDataMember");
        value::register_basic::<VariableTarget>("VariableTarget");
        value::register_basic::<IndirectVariableTarget>("IndirectVariableTarget");
        value::register_basic::<EntityTarget>("EntityTarget");
    });
}

/// Ensure the indirect wrapper types are registered with the value registry.
pub fn install() {
    register_indirect_types();
}

/// Wrap an indirect reference in an opaque value.
pub fn indirect_value<T: 'static + Clone + PartialEq>(inner: T) -> Value {
    register_indirect_types();
    Value::new(inner)
}

/// If `value` is an indirect variant, resolve one level of indirection
/// (recursively, so chained indirection fully collapses); otherwise clone the
/// value through. Failure is an empty value, not an error.
pub fn resolve_indirect(
    value: &Value,
    registry: &Registry,
    entity: Option<Entity>,
    ctx: &VariableContext,
) -> Value {
    register_indirect_types();

    if let Some(reference) = value.get_ref::<IndirectRef>() {
        let resolved = resolve_storage_ref(*reference, registry, entity);
        if resolved.is_empty() {
            return resolved;
        }
        return resolve_indirect(&resolved, registry, entity, ctx);
    }

    if let Some(member) = value.get_ref::<IndirectDataMember>() {
        let resolved = member.read(registry, entity);
        if resolved.is_empty() {
            return resolved;
        }
        return resolve_indirect(&resolved, registry, entity, ctx);
    }

    if let Some(variable) = value.get_ref::<VariableTarget>() {
        let resolved = ctx
            .get(variable.scope, variable.name)
            .unwrap_or_else(Value::empty);
        if resolved.is_empty() {
            return resolved;
        }
        return resolve_indirect(&resolved, registry, entity, ctx);
    }

    value.clone()
}

/// Dereference a shared-storage handle through the source entity's
/// descriptor. Only string resources can be surfaced as plain values; other
/// resource kinds are dereferenced by their owning subsystems.
fn resolve_storage_ref(
    reference: IndirectRef,
    registry: &Registry,
    entity: Option<Entity>,
) -> Value {
    let Some(entity) = entity else {
        return Value::empty();
    };
    let Some(instance) = registry.get::<InstanceComponent>(entity) else {
        return Value::empty();
    };
    let storage = &instance.descriptor.shared_storage;
    match storage.get::<String>(reference) {
        Ok(text) => Value::new(text.clone()),
        Err(_) => Value::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::shared_store;

    #[test]
    fn test_plain_value_passes_through() {
        let registry = Registry::new();
        let ctx = VariableContext::default();
        let v = Value::new(9i64);
        let resolved = resolve_indirect(&v, &registry, None, &ctx);
        assert_eq!(resolved.as_i64(), Some(9));
    }

    #[test]
    fn test_variable_target_resolves() {
        let registry = Registry::new();
        let local = shared_store();
        local
            .borrow_mut()
            .set(Symbol::of("speed"), Value::new(4.5f64));
        let ctx = VariableContext {
            local: Some(local),
            ..Default::default()
        };
        let v = indirect_value(VariableTarget::new(VariableScope::Local, Symbol::of("speed")));
        assert_eq!(resolve_indirect(&v, &registry, None, &ctx).as_f64(), Some(4.5));
    }

    #[test]
    fn test_data_member_resolves() {
        #[derive(Clone, PartialEq, Debug)]
        struct Armor {
            rating: i64,
        }
        let type_id = crate::value::TypeBuilder::<Armor>::new("IndirectTestArmor")
            .cloneable()
            .comparable()
            .member_get("rating", |a| Value::new(a.rating))
            .register();

        let mut registry = Registry::new();
        let e = registry.create();
        registry.emplace_meta(e, Value::new(Armor { rating: 12 }));

        let member = IndirectDataMember {
            target: EntityTarget::SelfTarget,
            type_id,
            member: Symbol::of("rating"),
        };
        let ctx = VariableContext::default();
        let v = indirect_value(member);
        assert_eq!(
            resolve_indirect(&v, &registry, Some(e), &ctx).as_i64(),
            Some(12)
        );
    }

    #[test]
    fn test_unresolved_member_is_empty() {
        let mut registry = Registry::new();
        let e = registry.create();
        let member = IndirectDataMember {
            target: EntityTarget::SelfTarget,
            type_id: TypeId::of("NoSuchComponent"),
            member: Symbol::of("field"),
        };
        let ctx = VariableContext::default();
        assert!(resolve_indirect(&indirect_value(member), &registry, Some(e), &ctx).is_empty());
    }
}
