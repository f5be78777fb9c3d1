// src/runtime/thread.rs
//! The thread-identity primitive as an explicit capability.
//!
//! Lowering only records whether the capability exists; the runtime asks
//! this source for the calling thread's identity when a generated body
//! evaluates it. The source is injectable so tests can exercise the
//! cross-thread paths deterministically while everything stays on one
//! OS thread.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone)]
pub struct ThreadIdSource(Rc<dyn Fn() -> i64>);

impl ThreadIdSource {
    pub fn new(source: impl Fn() -> i64 + 'static) -> Self {
        ThreadIdSource(Rc::new(source))
    }

    /// Dense per-OS-thread tokens, assigned on first use.
    pub fn os() -> Self {
        ThreadIdSource::new(os_thread_token)
    }

    /// A source that always reports the same identity. Combined with
    /// [`ThreadIdSource::new`] over a `Cell`, tests can "move" between
    /// threads at will.
    pub fn fixed(id: i64) -> Self {
        ThreadIdSource::new(move || id)
    }

    pub fn current(&self) -> i64 {
        (self.0)()
    }
}

impl fmt::Debug for ThreadIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadIdSource").finish()
    }
}

static NEXT_THREAD_TOKEN: AtomicI64 = AtomicI64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<i64> = const { Cell::new(0) };
}

fn os_thread_token() -> i64 {
    THREAD_TOKEN.with(|token| {
        if token.get() == 0 {
            token.set(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed));
        }
        token.get()
    })
}
