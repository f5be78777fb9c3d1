// src/well_known.rs
//
// Cached symbols for well-known runtime members.
// These are resolved once against the target runtime description and cached
// for the lowering pass to consult; an absent optional member degrades
// behavior instead of failing.

use crate::ir::intern::{Interner, Symbol};

/// Well-known runtime members the lowering pass depends on.
///
/// `dispose` is required: iterator state machines cannot be lowered without
/// a dispose contract on the target runtime. `current_thread_id` is
/// optional: without it the iterable fast path is skipped entirely and
/// every activation allocates.
#[derive(Debug, Clone, Default)]
pub struct WellKnownMembers {
    /// runtime::Disposable::dispose
    pub dispose: Option<Symbol>,
    /// runtime::current_thread_id
    pub current_thread_id: Option<Symbol>,
}

impl WellKnownMembers {
    /// Create an empty WellKnownMembers (nothing resolved yet)
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate member symbols for a fully equipped target runtime.
    pub fn populate(&mut self, interner: &mut Interner) {
        self.dispose = Some(interner.intern("dispose"));
        self.current_thread_id = Some(interner.intern("current_thread_id"));
    }

    /// A runtime that provides the dispose contract but no way to observe
    /// thread identity.
    pub fn without_thread_identity(interner: &mut Interner) -> Self {
        Self {
            dispose: Some(interner.intern("dispose")),
            current_thread_id: None,
        }
    }

    pub fn has_dispose(&self) -> bool {
        self.dispose.is_some()
    }

    pub fn has_thread_identity(&self) -> bool {
        self.current_thread_id.is_some()
    }
}
