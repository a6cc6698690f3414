//! Opaque typed values.
//!
//! A [`Value`] is a type-tagged cell whose payload the runtime never inspects
//! directly; every operation (clone, equality, ordering, member access,
//! function invocation, default construction) dispatches through a
//! process-wide registry of per-type vtables. Concrete types are registered
//! out-of-band with [`TypeBuilder`].
//!
//! An *empty* value represents lookup or evaluation failure. The runtime
//! never panics on a missing capability; it degrades to an empty value and a
//! warning.

use once_cell::sync::Lazy;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::hash::{hash_bytes, Symbol, TypeId};
use crate::ops::ValueOperator;

type CloneFn = Box<dyn Fn(&dyn Any) -> Box<dyn Any> + Send + Sync>;
type EqFn = Box<dyn Fn(&dyn Any, &dyn Any) -> bool + Send + Sync>;
type OrdFn = Box<dyn Fn(&dyn Any, &dyn Any) -> Option<Ordering> + Send + Sync>;
type DisplayFn = Box<dyn Fn(&dyn Any) -> String + Send + Sync>;
type CtorFn = Box<dyn Fn() -> Box<dyn Any> + Send + Sync>;
type GetFn = Box<dyn Fn(&dyn Any) -> Value + Send + Sync>;
type SetFn = Box<dyn Fn(&mut dyn Any, Value) -> bool + Send + Sync>;
type FunctionFn = Box<dyn Fn(Option<&mut dyn Any>, &[Value]) -> Value + Send + Sync>;
type BinaryFn = Box<dyn Fn(&dyn Any, &Value) -> Value + Send + Sync>;

struct MemberOps {
    get: GetFn,
    set: Option<SetFn>,
}

#[derive(Default)]
struct TypeOps {
    clone: Option<CloneFn>,
    eq: Option<EqFn>,
    ord: Option<OrdFn>,
    display: Option<DisplayFn>,
    default_ctor: Option<CtorFn>,
    members: HashMap<Symbol, MemberOps>,
    member_order: Vec<Symbol>,
    functions: HashMap<Symbol, FunctionFn>,
    binary: HashMap<(ValueOperator, TypeId), BinaryFn>,
}

/// Registration record for a value type.
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    /// Process-wide checksum computed at registration; carried inside
    /// `IndirectRef` so compiled descriptors can be validated against the
    /// live registry at load time.
    pub checksum: u32,
    native: std::any::TypeId,
    ops: TypeOps,
}

impl TypeInfo {
    pub fn member_names(&self) -> &[Symbol] {
        &self.ops.member_order
    }

    pub fn has_member(&self, member: Symbol) -> bool {
        self.ops.members.contains_key(&member)
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<TypeId, Arc<TypeInfo>>,
    by_native: HashMap<std::any::TypeId, TypeId>,
}

static REGISTRY: Lazy<RwLock<RegistryInner>> = Lazy::new(|| {
    let mut inner = RegistryInner::default();
    install_primitives(&mut inner);
    RwLock::new(inner)
});

fn register_into<T: 'static>(inner: &mut RegistryInner, builder: TypeBuilder<T>) -> TypeId {
    let id = TypeId::of(&builder.name);
    let native = std::any::TypeId::of::<T>();

    if let Some(existing) = inner.by_id.get(&id) {
        // Re-registration must refer to the same native type.
        assert_eq!(
            existing.native, native,
            "value type '{}' re-registered with a different native type",
            builder.name
        );
        return id;
    }

    let checksum = type_checksum::<T>(&builder.name, &builder.ops.member_order);

    inner.by_native.insert(native, id);
    inner.by_id.insert(
        id,
        Arc::new(TypeInfo {
            id,
            name: builder.name,
            checksum,
            native,
            ops: builder.ops,
        }),
    );

    id
}

fn type_checksum<T>(name: &str, members: &[Symbol]) -> u32 {
    let mut bytes = Vec::with_capacity(name.len() + 8 + members.len() * 4);
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(&(std::mem::size_of::<T>() as u32).to_le_bytes());
    bytes.extend_from_slice(&(members.len() as u32).to_le_bytes());
    for m in members {
        bytes.extend_from_slice(&m.0.to_le_bytes());
    }
    hash_bytes(&bytes)
}

fn info(id: TypeId) -> Option<Arc<TypeInfo>> {
    REGISTRY.read().unwrap().by_id.get(&id).cloned()
}

/// Look up a registered type by id.
pub fn type_info(id: TypeId) -> Option<Arc<TypeInfo>> {
    info(id)
}

/// Look up the registered id for a native Rust type.
pub fn type_id_of<T: 'static>() -> Option<TypeId> {
    REGISTRY
        .read()
        .unwrap()
        .by_native
        .get(&std::any::TypeId::of::<T>())
        .copied()
}

/// Registration checksum for a type id, if registered.
pub fn checksum_of(id: TypeId) -> Option<u32> {
    info(id).map(|i| i.checksum)
}

/// Invoke a registered free function (no receiver) by type and function id.
pub fn invoke_static(type_id: TypeId, function: Symbol, args: &[Value]) -> Value {
    let Some(info) = info(type_id) else {
        warn!(type_id = type_id.0, "invoke on unregistered type");
        return Value::empty();
    };
    match info.ops.functions.get(&function) {
        Some(f) => f(None, args),
        None => {
            warn!(
                type_name = %info.name,
                function = function.0,
                "unresolved function id"
            );
            Value::empty()
        }
    }
}

/// Default-construct a value of the given registered type.
pub fn default_construct(type_id: TypeId) -> Value {
    let Some(info) = info(type_id) else {
        return Value::empty();
    };
    match &info.ops.default_ctor {
        Some(ctor) => Value {
            cell: Some(ValueCell {
                type_id,
                payload: ctor(),
            }),
        },
        None => Value::empty(),
    }
}

/// Builder for registering a concrete type with the value registry.
///
/// Capabilities are opt-in so move-only payloads (e.g. coroutine handles)
/// can still live inside a `Value`.
pub struct TypeBuilder<T> {
    name: String,
    ops: TypeOps,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> TypeBuilder<T> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: TypeOps::default(),
            _marker: PhantomData,
        }
    }

    pub fn cloneable(mut self) -> Self
    where
        T: Clone,
    {
        self.ops.clone = Some(Box::new(|payload| {
            let concrete = payload.downcast_ref::<T>().expect("payload type mismatch");
            Box::new(concrete.clone())
        }));
        self
    }

    pub fn comparable(mut self) -> Self
    where
        T: PartialEq,
    {
        self.ops.eq = Some(Box::new(|lhs, rhs| {
            match (lhs.downcast_ref::<T>(), rhs.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }));
        self
    }

    pub fn ordered(mut self) -> Self
    where
        T: PartialOrd,
    {
        self.ops.ord = Some(Box::new(|lhs, rhs| {
            match (lhs.downcast_ref::<T>(), rhs.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a.partial_cmp(b),
                _ => None,
            }
        }));
        self
    }

    pub fn displayed(mut self) -> Self
    where
        T: fmt::Display,
    {
        self.ops.display = Some(Box::new(|payload| {
            payload
                .downcast_ref::<T>()
                .map(|v| v.to_string())
                .unwrap_or_default()
        }));
        self
    }

    pub fn defaulted(mut self) -> Self
    where
        T: Default,
    {
        self.ops.default_ctor = Some(Box::new(|| Box::new(T::default())));
        self
    }

    /// Register a readable member.
    pub fn member_get<F>(self, name: &str, get: F) -> Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.member_impl(name, get, None::<fn(&mut T, Value) -> bool>)
    }

    /// Register a readable + writable member.
    pub fn member<G, S>(self, name: &str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> bool + Send + Sync + 'static,
    {
        self.member_impl(name, get, Some(set))
    }

    fn member_impl<G, S>(mut self, name: &str, get: G, set: Option<S>) -> Self
    where
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> bool + Send + Sync + 'static,
    {
        let symbol = Symbol::of(name);
        let get: GetFn = Box::new(move |payload| match payload.downcast_ref::<T>() {
            Some(concrete) => get(concrete),
            None => Value::empty(),
        });
        let set: Option<SetFn> = set.map(|set| -> SetFn {
            Box::new(move |payload, value| match payload.downcast_mut::<T>() {
                Some(concrete) => set(concrete, value),
                None => false,
            })
        });
        self.ops.members.insert(symbol, MemberOps { get, set });
        self.ops.member_order.push(symbol);
        self
    }

    /// Register an invocable function. The receiver is `None` for static
    /// calls routed through [`invoke_static`].
    pub fn function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Option<&mut T>, &[Value]) -> Value + Send + Sync + 'static,
    {
        let erased: FunctionFn = Box::new(move |receiver, args| {
            let receiver = receiver.and_then(|r| r.downcast_mut::<T>());
            f(receiver, args)
        });
        self.ops.functions.insert(Symbol::of(name), erased);
        self
    }

    /// Register a binary operator against a specific right-hand type.
    pub fn binary_op<F>(mut self, op: ValueOperator, rhs: TypeId, f: F) -> Self
    where
        F: Fn(&T, &Value) -> Value + Send + Sync + 'static,
    {
        let erased: BinaryFn = Box::new(move |lhs, rhs_value| match lhs.downcast_ref::<T>() {
            Some(concrete) => f(concrete, rhs_value),
            None => Value::empty(),
        });
        self.ops.binary.insert((op, rhs), erased);
        self
    }

    pub fn register(self) -> TypeId {
        let mut inner = REGISTRY.write().unwrap();
        register_into(&mut inner, self)
    }
}

/// Register a plain data type with clone + equality, the common case.
pub fn register_basic<T: 'static + Clone + PartialEq>(name: &str) -> TypeId {
    TypeBuilder::<T>::new(name).cloneable().comparable().register()
}

/// Ensure a marker registration exists for a type used only as a storage or
/// dispatch tag (no value capabilities required).
pub fn ensure_registered<T: 'static>(name: &str) -> TypeId {
    TypeBuilder::<T>::new(name).register()
}

struct ValueCell {
    type_id: TypeId,
    payload: Box<dyn Any>,
}

/// An opaque typed cell. See module docs.
pub struct Value {
    cell: Option<ValueCell>,
}

impl Value {
    pub fn empty() -> Self {
        Value { cell: None }
    }

    /// Wrap a concrete payload. The type must have been registered; an
    /// unregistered type yields an empty value and a warning.
    pub fn new<T: 'static>(payload: T) -> Self {
        match type_id_of::<T>() {
            Some(type_id) => Value {
                cell: Some(ValueCell {
                    type_id,
                    payload: Box::new(payload),
                }),
            },
            None => {
                warn!(
                    native = std::any::type_name::<T>(),
                    "value constructed from unregistered type"
                );
                Value::empty()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cell.is_none()
    }

    pub fn type_id(&self) -> Option<TypeId> {
        self.cell.as_ref().map(|c| c.type_id)
    }

    pub fn is_type(&self, type_id: TypeId) -> bool {
        self.type_id() == Some(type_id)
    }

    pub fn get_ref<T: 'static>(&self) -> Option<&T> {
        self.cell.as_ref()?.payload.downcast_ref::<T>()
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.cell.as_mut()?.payload.downcast_mut::<T>()
    }

    /// Move the payload out, returning the value unchanged on type mismatch.
    pub fn take<T: 'static>(self) -> Result<T, Value> {
        match self.cell {
            Some(cell) => match cell.payload.downcast::<T>() {
                Ok(payload) => Ok(*payload),
                Err(payload) => Err(Value {
                    cell: Some(ValueCell {
                        type_id: cell.type_id,
                        payload,
                    }),
                }),
            },
            None => Err(Value::empty()),
        }
    }

    /// Exact equality via the registered vtable. Cross-type comparison is the
    /// concern of [`crate::ops`], not this method.
    pub fn eq_exact(&self, other: &Value) -> bool {
        let (Some(a), Some(b)) = (self.cell.as_ref(), other.cell.as_ref()) else {
            return false;
        };
        if a.type_id != b.type_id {
            return false;
        }
        match info(a.type_id).and_then(|i| {
            i.ops
                .eq
                .as_ref()
                .map(|eq| eq(a.payload.as_ref(), b.payload.as_ref()))
        }) {
            Some(result) => result,
            None => false,
        }
    }

    /// Same-type ordering via the registered vtable.
    pub fn cmp_exact(&self, other: &Value) -> Option<Ordering> {
        let (a, b) = (self.cell.as_ref()?, other.cell.as_ref()?);
        if a.type_id != b.type_id {
            return None;
        }
        info(a.type_id)?
            .ops
            .ord
            .as_ref()
            .and_then(|ord| ord(a.payload.as_ref(), b.payload.as_ref()))
    }

    pub fn display_string(&self) -> Option<String> {
        let cell = self.cell.as_ref()?;
        let info = info(cell.type_id)?;
        info.ops
            .display
            .as_ref()
            .map(|display| display(cell.payload.as_ref()))
    }

    pub fn type_name(&self) -> Option<String> {
        let cell = self.cell.as_ref()?;
        info(cell.type_id).map(|i| i.name.clone())
    }

    /// Read a named member as a fresh value.
    pub fn member(&self, member: Symbol) -> Value {
        let Some(cell) = self.cell.as_ref() else {
            return Value::empty();
        };
        let Some(info) = info(cell.type_id) else {
            return Value::empty();
        };
        match info.ops.members.get(&member) {
            Some(ops) => (ops.get)(cell.payload.as_ref()),
            None => Value::empty(),
        }
    }

    pub fn has_member(&self, member: Symbol) -> bool {
        self.cell
            .as_ref()
            .and_then(|c| info(c.type_id))
            .map(|i| i.has_member(member))
            .unwrap_or(false)
    }

    /// Write a named member. Returns false on any failure.
    pub fn set_member(&mut self, member: Symbol, value: Value) -> bool {
        let Some(cell) = self.cell.as_mut() else {
            return false;
        };
        let Some(info) = info(cell.type_id) else {
            return false;
        };
        match info.ops.members.get(&member).and_then(|m| m.set.as_ref()) {
            Some(set) => set(cell.payload.as_mut(), value),
            None => false,
        }
    }

    /// Invoke a registered function with this value as receiver.
    pub fn invoke(&mut self, function: Symbol, args: &[Value]) -> Value {
        let Some(cell) = self.cell.as_mut() else {
            return Value::empty();
        };
        let Some(info) = info(cell.type_id) else {
            return Value::empty();
        };
        match info.ops.functions.get(&function) {
            Some(f) => f(Some(cell.payload.as_mut()), args),
            None => {
                warn!(type_name = %info.name, function = function.0, "unresolved function id");
                Value::empty()
            }
        }
    }

    /// Apply a registered binary operator `(self.type, op, rhs.type)`.
    pub fn apply_registered_op(&self, op: ValueOperator, rhs: &Value) -> Value {
        let (Some(cell), Some(rhs_id)) = (self.cell.as_ref(), rhs.type_id()) else {
            return Value::empty();
        };
        let Some(info) = info(cell.type_id) else {
            return Value::empty();
        };
        match info.ops.binary.get(&(op, rhs_id)) {
            Some(f) => f(cell.payload.as_ref(), rhs),
            None => Value::empty(),
        }
    }

    // Primitive coercions. These inspect only the pre-registered primitive
    // types; anything else reports `None`.

    pub fn as_bool(&self) -> Option<bool> {
        if let Some(b) = self.get_ref::<bool>() {
            return Some(*b);
        }
        self.as_i64().map(|v| v != 0)
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let Some(v) = self.get_ref::<i64>() {
            return Some(*v);
        }
        if let Some(v) = self.get_ref::<i32>() {
            return Some(*v as i64);
        }
        if let Some(v) = self.get_ref::<u32>() {
            return Some(*v as i64);
        }
        if let Some(v) = self.get_ref::<u16>() {
            return Some(*v as i64);
        }
        if let Some(v) = self.get_ref::<bool>() {
            return Some(*v as i64);
        }
        None
    }

    pub fn as_f64(&self) -> Option<f64> {
        if let Some(v) = self.get_ref::<f64>() {
            return Some(*v);
        }
        if let Some(v) = self.get_ref::<f32>() {
            return Some(*v as f64);
        }
        self.as_i64().map(|v| v as f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.get_ref::<String>().map(|s| s.as_str())
    }

    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_some()
    }

    pub fn is_string(&self) -> bool {
        self.get_ref::<String>().is_some()
    }
}

impl Clone for Value {
    /// Clone through the registered vtable. Move-only payloads clone to an
    /// empty value with a warning.
    fn clone(&self) -> Self {
        let Some(cell) = self.cell.as_ref() else {
            return Value::empty();
        };
        let Some(info) = info(cell.type_id) else {
            return Value::empty();
        };
        match &info.ops.clone {
            Some(clone) => Value {
                cell: Some(ValueCell {
                    type_id: cell.type_id,
                    payload: clone(cell.payload.as_ref()),
                }),
            },
            None => {
                warn!(type_name = %info.name, "clone of move-only value yields empty");
                Value::empty()
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::empty()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.type_name(), self.display_string()) {
            (Some(name), Some(text)) => write!(f, "Value({name}: {text})"),
            (Some(name), None) => write!(f, "Value({name})"),
            _ => write!(f, "Value(empty)"),
        }
    }
}

macro_rules! register_primitive {
    ($inner:expr, $ty:ty, $name:expr) => {
        register_into(
            $inner,
            TypeBuilder::<$ty>::new($name)
                .cloneable()
                .comparable()
                .ordered()
                .displayed()
                .defaulted(),
        );
    };
}

fn install_primitives(inner: &mut RegistryInner) {
    register_primitive!(inner, bool, "bool");
    register_primitive!(inner, i32, "i32");
    register_primitive!(inner, i64, "i64");
    register_primitive!(inner, u16, "u16");
    register_primitive!(inner, u32, "u32");
    register_primitive!(inner, f32, "f32");
    register_primitive!(inner, f64, "f64");
    register_primitive!(inner, String, "String");
    register_into(
        inner,
        TypeBuilder::<std::time::Duration>::new("Duration")
            .cloneable()
            .comparable()
            .ordered()
            .defaulted(),
    );
}
