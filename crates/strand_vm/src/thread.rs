//! Runtime thread instances.

use strand_core::instruction::Cadence;
use strand_core::variables::{shared_store, SharedStore};
use strand_core::{InstructionCount, InstructionIndex, StateIndex, Symbol, ThreadIndex};

use crate::fiber::FiberHandle;

/// Flag block shared between a running thread and the spawn parameters used
/// to create one.
#[derive(Clone, Copy, Debug)]
pub struct ThreadFlags {
    /// A detached thread continues to execute when the active state changes.
    /// By default threads are terminated on state change (attached).
    ///
    /// A thread can be detached (running indefinitely) and still linked, so
    /// the user controls when it stops rather than being force-terminated.
    /// All threads die with their container regardless; a thread cannot
    /// outlive its entity.
    pub detached: bool,

    /// Linked threads are name-addressable and unique: only one instance of
    /// a given thread description runs per entity. An unlinked thread keeps
    /// executing but no longer blocks creation of another instance.
    pub linked: bool,

    /// Paused threads must be resumed by another thread or rule trigger.
    pub paused: bool,

    /// The thread is awaiting an event; it cannot continue until its
    /// trigger condition is satisfied.
    pub yielding: bool,

    /// The thread has reached a termination point.
    pub complete: bool,

    /// Current execution rate.
    pub cadence: Cadence,
}

impl Default for ThreadFlags {
    fn default() -> Self {
        Self {
            detached: false,
            linked: true,
            paused: false,
            yielding: false,
            complete: false,
            cadence: Cadence::default(),
        }
    }
}

impl ThreadFlags {
    pub fn with_cadence(cadence: Cadence) -> Self {
        Self {
            cadence,
            ..Default::default()
        }
    }

    /// Suspended threads cannot continue until an external operation takes
    /// place (a resume, or a yield condition being met).
    pub fn is_suspended(&self) -> bool {
        self.paused || self.yielding || self.complete
    }

    pub fn is_sleeping(&self) -> bool {
        self.paused
    }
}

/// A per-entity program counter over a compiled instruction sequence,
/// optionally driven by a host-script fiber instead.
pub struct EntityThread {
    pub flags: ThreadFlags,

    /// Locates the `ThreadDescription` this thread executes. `None` for
    /// fiber-only threads.
    pub thread_index: Option<ThreadIndex>,

    /// Index of the next instruction to execute.
    pub next_instruction: InstructionIndex,

    /// The state this thread was spawned from, if any.
    pub state_index: Option<StateIndex>,

    pub thread_id: Option<Symbol>,
    pub parent_thread_id: Option<Symbol>,

    /// Lazily allocated thread-local variables, shared by handle so
    /// evaluation contexts can outlive a borrow of the thread.
    pub variables: Option<SharedStore>,

    /// The active fiber to be executed, if any.
    pub fiber: Option<FiberHandle>,
}

impl EntityThread {
    pub fn new(
        flags: ThreadFlags,
        thread_index: ThreadIndex,
        thread_id: Option<Symbol>,
        parent_thread_id: Option<Symbol>,
        state_index: Option<StateIndex>,
    ) -> Self {
        Self {
            flags,
            thread_index: Some(thread_index),
            next_instruction: 0,
            state_index,
            thread_id,
            parent_thread_id,
            variables: None,
            fiber: None,
        }
    }

    /// A thread driven purely by a host fiber, with no instruction source.
    pub fn from_fiber(
        flags: ThreadFlags,
        fiber: FiberHandle,
        thread_id: Option<Symbol>,
        parent_thread_id: Option<Symbol>,
        state_index: Option<StateIndex>,
    ) -> Self {
        Self {
            flags,
            thread_index: None,
            next_instruction: 0,
            state_index,
            thread_id,
            parent_thread_id,
            variables: None,
            fiber: Some(fiber),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.is_suspended()
    }

    pub fn is_sleeping(&self) -> bool {
        self.flags.is_sleeping()
    }

    /// Returns true when the flag actually changed.
    pub fn pause(&mut self) -> bool {
        let was_paused = self.flags.paused;
        self.flags.paused = true;
        !was_paused
    }

    pub fn resume(&mut self) -> bool {
        let was_paused = self.flags.paused;
        self.flags.paused = false;
        was_paused
    }

    pub fn link(&mut self) -> bool {
        let was_linked = self.flags.linked;
        self.flags.linked = true;
        !was_linked
    }

    pub fn unlink(&mut self) -> bool {
        let was_linked = self.flags.linked;
        self.flags.linked = false;
        was_linked
    }

    pub fn attach(&mut self, state_index: Option<StateIndex>, keep_existing_state: bool) -> bool {
        let was_detached = self.flags.detached;
        self.flags.detached = false;
        if let Some(state_index) = state_index {
            if !keep_existing_state || self.state_index.is_none() {
                self.state_index = Some(state_index);
            }
        }
        was_detached
    }

    pub fn detach(&mut self) -> bool {
        let was_detached = self.flags.detached;
        self.flags.detached = true;
        !was_detached
    }

    pub fn yield_now(&mut self) -> bool {
        let was_yielding = self.flags.yielding;
        self.flags.yielding = true;
        !was_yielding
    }

    /// Wake from a yield, advancing past the yield instruction (and any
    /// event captures the waker already executed).
    pub fn unyield(&mut self, advancement: InstructionCount) -> bool {
        let was_yielding = self.flags.yielding;
        self.flags.yielding = false;
        self.next_instruction = self.next_instruction.saturating_add(advancement);
        was_yielding
    }

    pub fn skip(&mut self, forward_stride: InstructionCount) -> InstructionCount {
        self.next_instruction = self.next_instruction.saturating_add(forward_stride);
        forward_stride
    }

    pub fn rewind(&mut self, backward_stride: InstructionCount) -> InstructionCount {
        let applied = backward_stride.min(self.next_instruction);
        self.next_instruction -= applied;
        applied
    }

    /// Thread-local variable store, allocated on first use.
    pub fn variables(&mut self) -> SharedStore {
        self.variables.get_or_insert_with(shared_store).clone()
    }

    pub fn has_fiber(&self) -> bool {
        self.fiber.is_some()
    }

    pub fn clear_fiber(&mut self) {
        self.fiber = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> EntityThread {
        EntityThread::new(ThreadFlags::default(), 0, None, None, None)
    }

    #[test]
    fn test_pause_resume_transitions() {
        let mut t = thread();
        assert!(!t.is_suspended());
        assert!(t.pause());
        assert!(!t.pause());
        assert!(t.is_suspended());
        assert!(t.is_sleeping());
        assert!(t.resume());
        assert!(!t.resume());
        assert!(!t.is_suspended());
    }

    #[test]
    fn test_yield_unyield_moves_pc() {
        let mut t = thread();
        t.next_instruction = 3;
        assert!(t.yield_now());
        assert!(t.is_suspended());
        assert!(t.unyield(2));
        assert!(!t.flags.yielding);
        assert_eq!(t.next_instruction, 5);
    }

    #[test]
    fn test_rewind_clamps_at_zero() {
        let mut t = thread();
        t.next_instruction = 2;
        assert_eq!(t.rewind(5), 2);
        assert_eq!(t.next_instruction, 0);
    }

    #[test]
    fn test_attach_keeps_existing_state_when_asked() {
        let mut t = thread();
        t.flags.detached = true;
        t.state_index = Some(1);
        t.attach(Some(4), true);
        assert_eq!(t.state_index, Some(1));
        assert!(!t.flags.detached);
        t.detach();
        t.attach(Some(4), false);
        assert_eq!(t.state_index, Some(4));
    }
}
