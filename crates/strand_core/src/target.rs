//! Indirect entity targets.
//!
//! Authored programs never hold raw entity handles; they hold targets that
//! are resolved against a source entity at dispatch time.

use serde::{Deserialize, Serialize};

use crate::hash::Symbol;
use crate::registry::{Entity, PlayerIndex, Registry};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityTarget {
    /// The entity an instruction or rule is executing for.
    #[default]
    SelfTarget,
    Parent,
    Exact(Entity),
    Name(Symbol),
    Child {
        name: Symbol,
        recursive: bool,
    },
    Player(PlayerIndex),
    Null,
}

impl EntityTarget {
    /// Resolve the targeted entity from `source`. Unresolvable targets
    /// produce `None`; callers log and skip the affected action.
    pub fn resolve(&self, registry: &Registry, source: Option<Entity>) -> Option<Entity> {
        match *self {
            EntityTarget::SelfTarget => source.filter(|&e| registry.is_alive(e)),
            EntityTarget::Parent => registry.parent_of(source?),
            EntityTarget::Exact(entity) => registry.is_alive(entity).then_some(entity),
            EntityTarget::Name(name) => registry.find_named(name),
            EntityTarget::Child { name, recursive } => {
                registry.find_child_by_name(source?, name, recursive)
            }
            EntityTarget::Player(index) => registry.player(index),
            EntityTarget::Null => None,
        }
    }

    pub fn is_self(&self) -> bool {
        matches!(self, EntityTarget::SelfTarget)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EntityTarget::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_and_null() {
        let mut registry = Registry::new();
        let e = registry.create();
        assert_eq!(
            EntityTarget::SelfTarget.resolve(&registry, Some(e)),
            Some(e)
        );
        assert_eq!(EntityTarget::Null.resolve(&registry, Some(e)), None);
        assert_eq!(EntityTarget::SelfTarget.resolve(&registry, None), None);
    }

    #[test]
    fn test_parent_and_child() {
        let mut registry = Registry::new();
        let parent = registry.create();
        let child = registry.create();
        let grandchild = registry.create();
        registry.set_parent(child, Some(parent));
        registry.set_parent(grandchild, Some(child));
        registry.set_name(grandchild, Symbol::of("muzzle"));

        assert_eq!(
            EntityTarget::Parent.resolve(&registry, Some(child)),
            Some(parent)
        );
        assert_eq!(
            EntityTarget::Child {
                name: Symbol::of("muzzle"),
                recursive: true
            }
            .resolve(&registry, Some(parent)),
            Some(grandchild)
        );
        assert_eq!(
            EntityTarget::Child {
                name: Symbol::of("muzzle"),
                recursive: false
            }
            .resolve(&registry, Some(parent)),
            None
        );
    }

    #[test]
    fn test_exact_requires_alive() {
        let mut registry = Registry::new();
        let e = registry.create();
        assert_eq!(
            EntityTarget::Exact(e).resolve(&registry, None),
            Some(e)
        );
        registry.destroy(e);
        assert_eq!(EntityTarget::Exact(e).resolve(&registry, None), None);
    }
}
