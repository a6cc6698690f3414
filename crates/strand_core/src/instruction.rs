//! The compiled instruction set.
//!
//! Threads are ordered sequences of these tagged instructions. Each
//! instruction optionally carries an entity target and/or a thread target;
//! when absent or self-valued, the active entity/thread is used.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::expr::ValueExpr;
use crate::hash::{Symbol, TypeId};
use crate::indirect::VariableTarget;
use crate::storage::IndirectRef;
use crate::target::EntityTarget;
use crate::value;
use crate::{InstructionCount, StateIndex, ThreadIndex};

/// Execution rate class of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cadence {
    /// Stepped once per frame tick.
    #[default]
    Update,
    /// Stepped once per fixed-step tick.
    Fixed,
    /// Stepped repeatedly within a single tick until the thread yields,
    /// completes, or rewinds. Spelled `multi` in authored programs.
    Realtime,
}

impl Cadence {
    /// Alias used by cadence-block syntax.
    pub const MULTI: Cadence = Cadence::Realtime;
}

/// A contiguous span of thread descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadRange {
    pub start: ThreadIndex,
    pub count: ThreadIndex,
}

impl ThreadRange {
    pub fn single(index: ThreadIndex) -> Self {
        Self {
            start: index,
            count: 1,
        }
    }

    pub fn begin(&self) -> ThreadIndex {
        self.start
    }

    pub fn end(&self) -> ThreadIndex {
        self.start + self.count
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadIndex> {
        self.begin()..self.end()
    }
}

/// Which threads a command or bulk operation addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadTarget {
    /// With a self entity target, "the current thread".
    #[default]
    Empty,
    Range(ThreadRange),
    Id(Symbol),
}

impl ThreadTarget {
    pub fn is_empty(&self) -> bool {
        matches!(self, ThreadTarget::Empty)
    }
}

impl From<ThreadRange> for ThreadTarget {
    fn from(range: ThreadRange) -> Self {
        ThreadTarget::Range(range)
    }
}

impl From<Symbol> for ThreadTarget {
    fn from(id: Symbol) -> Self {
        ThreadTarget::Id(id)
    }
}

/// Base payload for instructions that can affect other threads and entities.
/// Defaults address the executing entity and thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub target_entity: EntityTarget,
    /// `None` refers to the current thread.
    pub thread_id: Option<Symbol>,
}

impl ThreadRef {
    pub fn current() -> Self {
        Self::default()
    }

    pub fn named(thread_id: Symbol) -> Self {
        Self {
            target_entity: EntityTarget::SelfTarget,
            thread_id: Some(thread_id),
        }
    }
}

/// Thread control requests lowered into commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ThreadActionKind {
    Spawn {
        threads: ThreadTarget,
        restart_existing: bool,
        state_index: Option<StateIndex>,
    },
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

/// A thread control action aimed at a resolved-at-dispatch entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadAction {
    pub target_entity: EntityTarget,
    pub kind: ThreadActionKind,
}

/// One instruction of a compiled thread.
#[derive(Clone, Debug)]
pub enum Instruction {
    NoOp,

    // State & action emission (dispatched as commands, target = self).
    StateTransition {
        state_name: Symbol,
    },
    StateCommand {
        command: crate::descriptor::TypeDescriptor,
    },
    StateUpdate {
        components: Vec<crate::descriptor::TypeDescriptor>,
    },
    ThreadAction(ThreadAction),

    // Direct control flow.
    Start {
        thread: ThreadRef,
        restart_existing: bool,
    },
    Restart {
        thread: ThreadRef,
    },
    Stop {
        thread: ThreadRef,
        check_linked: bool,
    },
    Pause {
        thread: ThreadRef,
        check_linked: bool,
    },
    Resume {
        thread: ThreadRef,
        check_linked: bool,
    },
    Link,
    Unlink {
        thread: ThreadRef,
    },
    Attach {
        thread: ThreadRef,
        state_id: Option<Symbol>,
        check_linked: bool,
    },
    Detach {
        thread: ThreadRef,
        check_linked: bool,
    },
    Sleep {
        thread: ThreadRef,
        duration: Duration,
        check_linked: bool,
    },
    Yield {
        condition: IndirectRef,
    },
    Skip {
        thread: ThreadRef,
        count: InstructionCount,
        check_linked: bool,
    },
    Rewind {
        thread: ThreadRef,
        count: InstructionCount,
        check_linked: bool,
    },

    // Structured blocks; `size` is measured in instructions.
    MultiBlock {
        size: InstructionCount,
    },
    CadenceBlock {
        cadence: Cadence,
        size: InstructionCount,
    },
    IfBlock {
        condition: IndirectRef,
        size: InstructionCount,
    },

    // Expressions.
    FunctionCall(ValueExpr),
    CoroutineCall(ValueExpr),
    Expression(ValueExpr),

    // Variables.
    VariableDeclaration(VariableTarget),
    VariableAssignment {
        target_entity: EntityTarget,
        thread_id: Option<Symbol>,
        variable: Option<VariableTarget>,
        expr: ValueExpr,
        ignore_if_already_assigned: bool,
        ignore_if_not_declared: bool,
    },
    EventCapture {
        variable: VariableTarget,
        intended_type: Option<TypeId>,
    },

    // Diagnostics.
    Assert {
        condition: IndirectRef,
        message: Option<IndirectRef>,
        representation: Option<IndirectRef>,
    },

    // Runtime-assembled: an expression resolving to an instruction value.
    Dynamic(ValueExpr),
}

impl Default for Instruction {
    fn default() -> Self {
        Instruction::NoOp
    }
}

impl Instruction {
    pub fn is_noop(&self) -> bool {
        matches!(self, Instruction::NoOp)
    }
}

/// Register `Instruction` as a (move-friendly, clonable) value type so
/// runtime-assembled instructions can travel inside opaque values.
pub fn instruction_value_type() -> TypeId {
    value::TypeBuilder::<Instruction>::new("Instruction")
        .cloneable()
        .register()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_range_iteration() {
        let range = ThreadRange { start: 2, count: 3 };
        let indices: Vec<_> = range.iter().collect();
        assert_eq!(indices, vec![2, 3, 4]);
        assert!(!range.is_empty());
        assert!(ThreadRange::default().is_empty());
    }

    #[test]
    fn test_thread_target_conversions() {
        let by_id: ThreadTarget = Symbol::of("patrol").into();
        assert!(matches!(by_id, ThreadTarget::Id(_)));
        let by_range: ThreadTarget = ThreadRange::single(4).into();
        assert!(matches!(by_range, ThreadTarget::Range(r) if r.start == 4 && r.count == 1));
        assert!(ThreadTarget::default().is_empty());
    }

    #[test]
    fn test_instruction_as_value() {
        let type_id = instruction_value_type();
        let v = crate::value::Value::new(Instruction::Link);
        assert!(v.is_type(type_id));
        let back = v.take::<Instruction>().unwrap();
        assert!(matches!(back, Instruction::Link));
    }
}
