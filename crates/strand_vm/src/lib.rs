//! Strand VM
//!
//! The entity behavior runtime: per-entity instruction threads, the state
//! machine applying component deltas, the event dispatcher routing payloads
//! to yielding threads and rule triggers, and the command queue carrying
//! cross-entity effects.

pub mod command;
pub mod context;
pub mod events;
pub mod fiber;
pub mod listener;
pub mod state;
pub mod system;
pub mod thread;
pub mod thread_component;

pub use command::{Command, CommandQueue};
pub use events::RuntimeEvent;
pub use fiber::{ControlFlowToken, Fiber, FiberHandle, FiberResponse};
pub use system::BehaviorSystem;
pub use thread::{EntityThread, ThreadFlags};
pub use thread_component::{StopOutcome, ThreadComponent};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
