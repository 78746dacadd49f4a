//! Cancellation token shared between the signal listener and the agent controller.
//!
//! An interrupt means "stop the running agent" while a child is active and
//! "exit the program" otherwise. [`CancelToken::interrupt`] reports which of
//! the two applies so the listener can decide whether to exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Flags {
    cancelled: AtomicBool,
    child_active: AtomicBool,
}

/// Cloneable handle; all clones observe the same flags.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flags: Arc<Flags>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancel and report whether an agent child was running at the time.
    pub fn interrupt(&self) -> bool {
        self.cancel();
        self.flags.child_active.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::SeqCst)
    }

    pub fn child_active(&self) -> bool {
        self.flags.child_active.load(Ordering::SeqCst)
    }

    /// Mark a child as running until the returned guard drops.
    pub fn enter_child(&self) -> ActiveChild {
        self.flags.child_active.store(true, Ordering::SeqCst);
        ActiveChild {
            flags: Arc::clone(&self.flags),
        }
    }
}

/// Clears the child-active flag on drop.
#[derive(Debug)]
pub struct ActiveChild {
    flags: Arc<Flags>,
}

impl Drop for ActiveChild {
    fn drop(&mut self) {
        self.flags.child_active.store(false, Ordering::SeqCst);
    }
}
