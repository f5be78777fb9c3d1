// src/lower/lifecycle.rs
//! Lifecycle selection for generated state machines.
//!
//! An iterable-shaped method produces a reusable template: the instance the
//! replacement body returns starts at the not-started sentinel and each
//! enumeration activates it in place or clones it. An iterator-shaped
//! method produces a single-use cursor started at the entry state.

use crate::ir::method::{MethodDescriptor, ReturnShape};

/// State code of an iterable template that has never been activated. Only
/// construction produces this code; activation and every later transition
/// move away from it permanently, which is what makes a "used" instance
/// permanently allocate on re-enumeration.
pub const NOT_STARTED_STATE: i32 = -2;

/// State code of a finished (exhausted, disposed, or poisoned) machine.
pub const FINISHED_STATE: i32 = -1;

/// State code dispatching to the first real statement.
pub const ENTRY_STATE: i32 = 0;

/// First state code allocated to a suspend point.
pub const FIRST_SUSPEND_STATE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMode {
    Iterable,
    Iterator,
}

impl LifecycleMode {
    pub fn select(method: &MethodDescriptor) -> LifecycleMode {
        match method.return_shape {
            ReturnShape::Iterable => LifecycleMode::Iterable,
            ReturnShape::Iterator => LifecycleMode::Iterator,
        }
    }

    /// Initial state the replacement body constructs the instance with.
    pub fn initial_state(self) -> i32 {
        match self {
            LifecycleMode::Iterable => NOT_STARTED_STATE,
            LifecycleMode::Iterator => ENTRY_STATE,
        }
    }

    /// Whether the generated type wants a thread-affinity field (granted
    /// only if the thread-identity member is also available).
    pub fn wants_thread_affinity(self) -> bool {
        matches!(self, LifecycleMode::Iterable)
    }
}
