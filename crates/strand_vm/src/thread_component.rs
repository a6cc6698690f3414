//! Per-entity thread container.
//!
//! Owns the ordered list of running threads plus the entity's global
//! variable store. Operations are keyed by descriptor thread index (with
//! id-based lookups resolving through the descriptor); bulk variants walk a
//! [`ThreadRange`].

use tracing::warn;

use strand_core::descriptor::{EntityDescriptor, EntityState};
use strand_core::instruction::ThreadRange;
use strand_core::variables::{shared_store, SharedStore};
use strand_core::{InstructionCount, StateIndex, Symbol, ThreadIndex};

use crate::thread::{EntityThread, ThreadFlags};

/// Result of stopping a thread: terminated (erased) or detached (left in
/// place, unlinked).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Terminated,
    Detached,
}

#[derive(Default)]
pub struct ThreadComponent {
    pub threads: Vec<EntityThread>,

    /// Variables shared between every thread of this entity; allocated on
    /// first use.
    pub global_variables: Option<SharedStore>,
}

impl ThreadComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_variables(&mut self) -> SharedStore {
        self.global_variables
            .get_or_insert_with(shared_store)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Local index of the first thread spawned from `thread_index`.
    ///
    /// With `check_linked`, only threads holding a positive link status are
    /// considered; otherwise the first match wins.
    pub fn find_local(&self, thread_index: ThreadIndex, check_linked: bool) -> Option<usize> {
        self.threads.iter().position(|t| {
            t.thread_index == Some(thread_index) && (!check_linked || t.flags.linked)
        })
    }

    pub fn find_local_by_id(&self, thread_id: Symbol, check_linked: bool) -> Option<usize> {
        self.threads.iter().position(|t| {
            t.thread_id == Some(thread_id) && (!check_linked || t.flags.linked)
        })
    }

    pub fn get_thread(&self, thread_index: ThreadIndex, check_linked: bool) -> Option<&EntityThread> {
        self.find_local(thread_index, check_linked)
            .map(|i| &self.threads[i])
    }

    pub fn get_thread_mut(
        &mut self,
        thread_index: ThreadIndex,
        check_linked: bool,
    ) -> Option<&mut EntityThread> {
        let local = self.find_local(thread_index, check_linked)?;
        Some(&mut self.threads[local])
    }

    /// A linked thread spawned from `thread_index` is currently running.
    pub fn thread_running(&self, thread_index: ThreadIndex) -> bool {
        self.get_thread(thread_index, true).is_some()
    }

    // Spawning.

    /// Start a thread instance.
    ///
    /// With `check_existing`, a running instance blocks the spawn unless
    /// `restart_existing` re-initializes it in place. Returns the local
    /// index of the started (or restarted) thread.
    #[allow(clippy::too_many_arguments)]
    pub fn start_thread(
        &mut self,
        thread_index: ThreadIndex,
        thread_id: Option<Symbol>,
        parent_thread_id: Option<Symbol>,
        state_index: Option<StateIndex>,
        check_existing: bool,
        check_linked: bool,
        restart_existing: bool,
        flags: ThreadFlags,
    ) -> Option<usize> {
        if check_existing {
            if let Some(local) = self.find_local(thread_index, check_linked) {
                if restart_existing {
                    self.threads[local] = EntityThread::new(
                        flags,
                        thread_index,
                        thread_id,
                        parent_thread_id,
                        state_index,
                    );
                    return Some(local);
                }
                return None;
            }
        }

        self.threads.push(EntityThread::new(
            flags,
            thread_index,
            thread_id,
            parent_thread_id,
            state_index,
        ));
        Some(self.threads.len() - 1)
    }

    /// Start a thread from its descriptor entry, inheriting the description
    /// cadence and name.
    pub fn start_from_description(
        &mut self,
        descriptor: &EntityDescriptor,
        thread_index: ThreadIndex,
        parent_thread_id: Option<Symbol>,
        state_index: Option<StateIndex>,
        restart_existing: bool,
    ) -> Option<usize> {
        let Some(description) = descriptor.thread(thread_index) else {
            warn!(thread_index, "spawn request for unknown thread description");
            return None;
        };
        self.start_thread(
            thread_index,
            description.thread_id,
            parent_thread_id,
            state_index,
            true,
            true,
            restart_existing,
            ThreadFlags::with_cadence(description.cadence),
        )
    }

    pub fn start_thread_by_id(
        &mut self,
        descriptor: &EntityDescriptor,
        thread_id: Symbol,
        parent_thread_id: Option<Symbol>,
        state_index: Option<StateIndex>,
        restart_existing: bool,
    ) -> Option<usize> {
        let thread_index = descriptor.thread_index(thread_id)?;
        self.start_from_description(
            descriptor,
            thread_index,
            parent_thread_id,
            state_index,
            restart_existing,
        )
    }

    /// Start every thread in a range. Returns how many started.
    pub fn start_threads(
        &mut self,
        descriptor: &EntityDescriptor,
        range: ThreadRange,
        state_index: Option<StateIndex>,
        restart_existing: bool,
    ) -> usize {
        range
            .iter()
            .filter(|&index| {
                self.start_from_description(descriptor, index, None, state_index, restart_existing)
                    .is_some()
            })
            .count()
    }

    /// Start a state's immediate threads.
    pub fn start_state_threads(
        &mut self,
        descriptor: &EntityDescriptor,
        state: &EntityState,
        state_index: StateIndex,
        restart_existing: bool,
    ) -> usize {
        state
            .immediate_threads
            .iter()
            .map(|&range| self.start_threads(descriptor, range, Some(state_index), restart_existing))
            .sum()
    }

    // Stopping.

    /// Stop the thread at a local index: erase it, or merely unlink it if it
    /// is detached.
    pub fn stop_local(&mut self, local: usize) -> StopOutcome {
        let thread = &mut self.threads[local];
        if thread.flags.detached {
            // Detached threads stay in place but stop blocking new
            // instances under the same name/index.
            thread.flags.linked = false;
            return StopOutcome::Detached;
        }
        self.threads.remove(local);
        StopOutcome::Terminated
    }

    /// Stop a thread by descriptor index. A missing thread reports
    /// `Terminated`: it no longer conflicts with creating a new one.
    pub fn stop_thread(&mut self, thread_index: ThreadIndex, check_linked: bool) -> StopOutcome {
        match self.find_local(thread_index, check_linked) {
            Some(local) => self.stop_local(local),
            None => StopOutcome::Terminated,
        }
    }

    pub fn stop_threads(&mut self, range: ThreadRange, check_linked: bool) -> usize {
        range
            .iter()
            .filter(|&index| self.stop_thread(index, check_linked) == StopOutcome::Terminated)
            .count()
    }

    /// Stop every thread spawned by a state. Link status is ignored.
    ///
    /// Erase-returning-next iteration: removal does not advance the cursor,
    /// so threads shifted into the current slot are still visited.
    pub fn stop_state_threads_by_index(&mut self, state_index: StateIndex) -> usize {
        let mut terminated = 0;
        let mut local = 0;
        while local < self.threads.len() {
            if self.threads[local].state_index == Some(state_index) {
                match self.stop_local(local) {
                    StopOutcome::Terminated => {
                        terminated += 1;
                        continue;
                    }
                    StopOutcome::Detached => {}
                }
            }
            local += 1;
        }
        terminated
    }

    /// Stop everything. Returns how many threads were fully terminated.
    pub fn stop_all(&mut self) -> usize {
        let mut terminated = 0;
        let mut local = 0;
        while local < self.threads.len() {
            match self.stop_local(local) {
                StopOutcome::Terminated => {
                    terminated += 1;
                    continue;
                }
                StopOutcome::Detached => local += 1,
            }
        }
        terminated
    }

    /// Erase threads marked complete without formally stopping them.
    pub fn erase_completed_threads(&mut self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|t| !t.flags.complete);
        before - self.threads.len()
    }

    // Flag operations.

    pub fn pause_thread(&mut self, thread_index: ThreadIndex, check_linked: bool) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.pause())
            .unwrap_or(false)
    }

    pub fn resume_thread(&mut self, thread_index: ThreadIndex, check_linked: bool) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.resume())
            .unwrap_or(false)
    }

    pub fn attach_thread(
        &mut self,
        thread_index: ThreadIndex,
        state_index: Option<StateIndex>,
        check_linked: bool,
    ) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.attach(state_index, false))
            .unwrap_or(false)
    }

    pub fn detach_thread(&mut self, thread_index: ThreadIndex, check_linked: bool) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.detach())
            .unwrap_or(false)
    }

    pub fn unlink_thread(&mut self, thread_index: ThreadIndex) -> bool {
        self.get_thread_mut(thread_index, false)
            .map(|t| t.unlink())
            .unwrap_or(false)
    }

    /// Re-link a thread by local index. Fails if another thread with the
    /// same source index is already linked.
    pub fn link_thread(&mut self, local: usize) -> bool {
        let Some(thread_index) = self.threads.get(local).and_then(|t| t.thread_index) else {
            return false;
        };
        if self.threads[local].flags.linked {
            return true;
        }
        if self.find_local(thread_index, true).is_some() {
            return false;
        }
        self.threads[local].flags.linked = true;
        true
    }

    pub fn skip_thread(
        &mut self,
        thread_index: ThreadIndex,
        count: InstructionCount,
        check_linked: bool,
    ) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.skip(count) > 0)
            .unwrap_or(false)
    }

    pub fn rewind_thread(
        &mut self,
        thread_index: ThreadIndex,
        count: InstructionCount,
        check_linked: bool,
    ) -> bool {
        self.get_thread_mut(thread_index, check_linked)
            .map(|t| t.rewind(count) > 0)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::descriptor::ThreadDescription;
    use strand_core::instruction::Instruction;

    fn descriptor_with_threads(count: usize) -> EntityDescriptor {
        let mut descriptor = EntityDescriptor::new();
        for i in 0..count {
            descriptor.add_thread(
                ThreadDescription::named(&format!("t{i}"))
                    .with_instructions(vec![Instruction::NoOp]),
            );
        }
        descriptor
    }

    #[test]
    fn test_linked_spawn_blocks_duplicates() {
        let descriptor = descriptor_with_threads(1);
        let mut tc = ThreadComponent::new();
        assert!(tc
            .start_from_description(&descriptor, 0, None, None, false)
            .is_some());
        assert!(tc
            .start_from_description(&descriptor, 0, None, None, false)
            .is_none());
        // Restart re-initializes in place instead of failing.
        tc.threads[0].next_instruction = 5;
        let local = tc
            .start_from_description(&descriptor, 0, None, None, true)
            .unwrap();
        assert_eq!(local, 0);
        assert_eq!(tc.threads[0].next_instruction, 0);
    }

    #[test]
    fn test_stop_detached_only_unlinks() {
        let descriptor = descriptor_with_threads(1);
        let mut tc = ThreadComponent::new();
        let local = tc
            .start_from_description(&descriptor, 0, None, None, false)
            .unwrap();
        tc.threads[local].flags.detached = true;

        assert_eq!(tc.stop_thread(0, true), StopOutcome::Detached);
        assert_eq!(tc.len(), 1);
        assert!(!tc.threads[0].flags.linked);

        // The name/index is free again.
        assert!(tc
            .start_from_description(&descriptor, 0, None, None, false)
            .is_some());
        assert_eq!(tc.len(), 2);
    }

    #[test]
    fn test_stop_state_threads_erases_in_order() {
        let descriptor = descriptor_with_threads(3);
        let mut tc = ThreadComponent::new();
        tc.start_from_description(&descriptor, 0, None, Some(7), false);
        tc.start_from_description(&descriptor, 1, None, Some(7), false);
        tc.start_from_description(&descriptor, 2, None, Some(2), false);

        assert_eq!(tc.stop_state_threads_by_index(7), 2);
        assert_eq!(tc.len(), 1);
        assert_eq!(tc.threads[0].thread_index, Some(2));
    }

    #[test]
    fn test_link_thread_rejects_second_link() {
        let descriptor = descriptor_with_threads(1);
        let mut tc = ThreadComponent::new();
        let a = tc
            .start_from_description(&descriptor, 0, None, None, false)
            .unwrap();
        tc.threads[a].flags.linked = false;
        // Unlinked: a second instance of the same description may spawn.
        let b = tc
            .start_from_description(&descriptor, 0, None, None, false)
            .unwrap();
        assert!(tc.link_thread(b));
        assert!(!tc.link_thread(a));
        assert!(tc.link_thread(b));
    }

    #[test]
    fn test_erase_completed() {
        let descriptor = descriptor_with_threads(2);
        let mut tc = ThreadComponent::new();
        tc.start_from_description(&descriptor, 0, None, None, false);
        tc.start_from_description(&descriptor, 1, None, None, false);
        tc.threads[0].flags.complete = true;
        assert_eq!(tc.erase_completed_threads(), 1);
        assert_eq!(tc.threads[0].thread_index, Some(1));
    }
}
