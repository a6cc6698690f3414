//! Variable scopes and storage.
//!
//! Four scopes exist: thread-local, entity-global, subtree context, and
//! service-universal. Stores are shared by reference (`Rc<RefCell<…>>`) so a
//! resolved [`VariableContext`] can be carried through evaluation without
//! borrowing the owning thread or entity.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::hash::Symbol;
use crate::value::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableScope {
    #[default]
    Local,
    Global,
    Context,
    Universal,
}

/// Parallel name/value vectors. Declared-but-unassigned entries hold an
/// empty value, which still counts as "exists".
#[derive(Default)]
pub struct VariableStore {
    names: SmallVec<[Symbol; 8]>,
    values: Vec<Value>,
}

impl VariableStore {
    pub fn index_of(&self, name: Symbol) -> Option<usize> {
        if name.is_empty() {
            return None;
        }
        self.names.iter().position(|&n| n == name)
    }

    pub fn contains(&self, name: Symbol) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: Symbol) -> Option<&Value> {
        self.index_of(name).map(|i| &self.values[i])
    }

    pub fn get_mut(&mut self, name: Symbol) -> Option<&mut Value> {
        self.index_of(name).map(|i| &mut self.values[i])
    }

    /// Insert or overwrite.
    pub fn set(&mut self, name: Symbol, value: Value) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.index_of(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => {
                self.names.push(name);
                self.values.push(value);
                true
            }
        }
    }

    pub fn set_existing(&mut self, name: Symbol, value: Value) -> bool {
        match self.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn set_missing(&mut self, name: Symbol, value: Value) -> bool {
        if self.contains(name) {
            return false;
        }
        self.set(name, value)
    }

    /// Declare a name with no value. Fails if already declared.
    pub fn declare(&mut self, name: Symbol) -> bool {
        self.set_missing(name, Value::empty())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Adopt entries from another store without overwriting existing names.
    pub fn merge_missing(&mut self, other: &VariableStore) -> usize {
        let mut adopted = 0;
        for (i, &name) in other.names.iter().enumerate() {
            if self.set_missing(name, other.values[i].clone()) {
                adopted += 1;
            }
        }
        adopted
    }

    pub fn names(&self) -> &[Symbol] {
        &self.names
    }
}

/// Entity-scoped variable store shared by reference across a subtree.
#[derive(Default)]
pub struct EntityContext {
    pub variables: VariableStore,
}

impl EntityContext {
    /// Merge-without-overwrite from another context.
    pub fn set_missing_variables(&mut self, existing: &EntityContext) -> usize {
        self.variables.merge_missing(&existing.variables)
    }
}

pub type SharedStore = Rc<RefCell<VariableStore>>;
pub type SharedContext = Rc<RefCell<EntityContext>>;

pub fn shared_store() -> SharedStore {
    Rc::new(RefCell::new(VariableStore::default()))
}

pub fn shared_context() -> SharedContext {
    Rc::new(RefCell::new(EntityContext::default()))
}

/// Resolve the identifier a variable is stored under.
///
/// Local names in a named thread are prefixed with the thread's name hash so
/// other threads can address them via an indirect variable target.
pub fn resolve_variable_name(
    scope: VariableScope,
    name: Symbol,
    thread_id: Option<Symbol>,
) -> Symbol {
    match (scope, thread_id) {
        (VariableScope::Local, Some(thread)) if !thread.is_empty() => {
            Symbol::scoped(thread, name)
        }
        _ => name,
    }
}

/// A snapshot of the four variable scopes visible to one evaluation.
///
/// Reads hand out clones; the stores are shared across an entity subtree and
/// holding borrows would freeze the interpreter loop.
#[derive(Clone, Default)]
pub struct VariableContext {
    pub local: Option<SharedStore>,
    pub global: Option<SharedStore>,
    pub context: Option<SharedContext>,
    pub universal: Option<SharedStore>,
}

impl VariableContext {
    pub fn is_empty(&self) -> bool {
        self.local.is_none()
            && self.global.is_none()
            && self.context.is_none()
            && self.universal.is_none()
    }

    fn with_store<R>(
        &self,
        scope: VariableScope,
        f: impl FnOnce(&mut VariableStore) -> R,
    ) -> Option<R> {
        match scope {
            VariableScope::Local => self.local.as_ref().map(|s| f(&mut s.borrow_mut())),
            VariableScope::Global => self.global.as_ref().map(|s| f(&mut s.borrow_mut())),
            VariableScope::Context => self
                .context
                .as_ref()
                .map(|c| f(&mut c.borrow_mut().variables)),
            VariableScope::Universal => self.universal.as_ref().map(|s| f(&mut s.borrow_mut())),
        }
    }

    pub fn declare(&self, scope: VariableScope, name: Symbol) -> bool {
        self.with_store(scope, |s| s.declare(name)).unwrap_or(false)
    }

    pub fn set(&self, scope: VariableScope, name: Symbol, value: Value) -> bool {
        self.with_store(scope, |s| s.set(name, value)).unwrap_or(false)
    }

    pub fn set_missing(&self, scope: VariableScope, name: Symbol, value: Value) -> bool {
        self.with_store(scope, |s| s.set_missing(name, value))
            .unwrap_or(false)
    }

    pub fn get(&self, scope: VariableScope, name: Symbol) -> Option<Value> {
        self.with_store(scope, |s| s.get(name).cloned()).flatten()
    }

    pub fn exists(&self, scope: VariableScope, name: Symbol) -> bool {
        self.with_store(scope, |s| s.contains(name)).unwrap_or(false)
    }

    /// Look a name up across scopes, innermost first.
    pub fn lookup(&self, name: Symbol) -> Option<Value> {
        for scope in [
            VariableScope::Local,
            VariableScope::Global,
            VariableScope::Context,
            VariableScope::Universal,
        ] {
            if let Some(found) = self.with_store(scope, |s| s.get(name).cloned()).flatten() {
                return Some(found);
            }
            if self.exists(scope, name) {
                // Declared but unassigned.
                return Some(Value::empty());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_then_assign() {
        let mut store = VariableStore::default();
        let name = Symbol::of("k");
        assert!(store.declare(name));
        assert!(!store.declare(name));
        assert!(store.get(name).unwrap().is_empty());
        assert!(store.set(name, Value::new(5i64)));
        assert_eq!(store.get(name).unwrap().as_i64(), Some(5));
    }

    #[test]
    fn test_set_missing_does_not_overwrite() {
        let mut store = VariableStore::default();
        let name = Symbol::of("a");
        store.set(name, Value::new(1i64));
        assert!(!store.set_missing(name, Value::new(2i64)));
        assert_eq!(store.get(name).unwrap().as_i64(), Some(1));
    }

    #[test]
    fn test_merge_missing() {
        let mut a = VariableStore::default();
        let mut b = VariableStore::default();
        a.set(Symbol::of("x"), Value::new(1i64));
        b.set(Symbol::of("x"), Value::new(2i64));
        b.set(Symbol::of("y"), Value::new(3i64));
        assert_eq!(a.merge_missing(&b), 1);
        assert_eq!(a.get(Symbol::of("x")).unwrap().as_i64(), Some(1));
        assert_eq!(a.get(Symbol::of("y")).unwrap().as_i64(), Some(3));
    }

    #[test]
    fn test_context_scope_routing() {
        let ctx = VariableContext {
            local: Some(shared_store()),
            context: Some(shared_context()),
            ..Default::default()
        };
        let name = Symbol::of("v");
        assert!(ctx.set(VariableScope::Local, name, Value::new(1i64)));
        assert!(ctx.set(VariableScope::Context, name, Value::new(2i64)));
        assert!(!ctx.set(VariableScope::Global, name, Value::new(3i64)));
        assert_eq!(ctx.get(VariableScope::Local, name).unwrap().as_i64(), Some(1));
        assert_eq!(
            ctx.get(VariableScope::Context, name).unwrap().as_i64(),
            Some(2)
        );
        assert!(ctx.get(VariableScope::Global, name).is_none());
    }

    #[test]
    fn test_resolved_local_names_scope_by_thread() {
        let name = Symbol::of("counter");
        let thread = Symbol::of("patrol");
        let resolved = resolve_variable_name(VariableScope::Local, name, Some(thread));
        assert_ne!(resolved, name);
        assert_eq!(
            resolve_variable_name(VariableScope::Global, name, Some(thread)),
            name
        );
        assert_eq!(resolve_variable_name(VariableScope::Local, name, None), name);
    }
}
