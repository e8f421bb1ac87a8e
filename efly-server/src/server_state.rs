//! Global service lifecycle and per-thread state.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};

use efly_script::{BasicEngine, Interpreter};

/// Global service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStateKind {
    /// Startup / snapshot load; only `LOADING`-flagged commands are admitted.
    Loading,
    /// Normal request admission.
    Active,
    /// Teardown; requests are rejected.
    ShuttingDown,
}

impl GlobalStateKind {
    /// Human-readable state name used in error replies and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Loading => "LOADING",
            Self::Active => "ACTIVE",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Loading,
            1 => Self::Active,
            _ => Self::ShuttingDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Loading => 0,
            Self::Active => 1,
            Self::ShuttingDown => 2,
        }
    }
}

/// Single-step CAS state machine `LOADING -> ACTIVE -> SHUTTING_DOWN`.
#[derive(Debug)]
pub struct GlobalState(AtomicU8);

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalState {
    /// Starts in `LOADING`.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(GlobalStateKind::Loading.as_u8()))
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> GlobalStateKind {
        GlobalStateKind::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts the single-step transition into `next`.
    ///
    /// Returns the state observed before the attempt and whether the switch happened.
    pub fn next(&self, next: GlobalStateKind) -> (GlobalStateKind, bool) {
        let expected = match next {
            GlobalStateKind::Loading => return (self.current(), false),
            GlobalStateKind::Active => GlobalStateKind::Loading,
            GlobalStateKind::ShuttingDown => GlobalStateKind::Active,
        };
        match self.0.compare_exchange(
            expected.as_u8(),
            next.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(previous) => (GlobalStateKind::from_u8(previous), true),
            Err(current) => (GlobalStateKind::from_u8(current), false),
        }
    }
}

thread_local! {
    static TL_INTERPRETER: RefCell<Option<Interpreter>> = const { RefCell::new(None) };
}

/// Runs `f` with this thread's interpreter, creating it on first use.
///
/// The exclusive borrow doubles as the interpreter lock: one script runs per interpreter at a
/// time, and attempting to re-enter from the same thread is a programming error that panics.
pub fn with_interpreter<R>(f: impl FnOnce(&mut Interpreter) -> R) -> R {
    TL_INTERPRETER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let interpreter = slot.get_or_insert_with(|| Interpreter::new(Box::new(BasicEngine)));
        f(interpreter)
    })
}

/// Initializes this thread's interpreter eagerly.
pub fn init_thread_local() {
    with_interpreter(|_| {});
}

/// Drops this thread's interpreter.
pub fn shutdown_thread_local() {
    TL_INTERPRETER.with(|cell| {
        let _ = cell.borrow_mut().take();
    });
}

#[cfg(test)]
mod tests {
    use super::{GlobalState, GlobalStateKind};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn lifecycle_advances_only_in_single_steps() {
        let state = GlobalState::new();
        assert_that!(state.current(), eq(GlobalStateKind::Loading));

        // Skipping a step does not switch.
        let (seen, switched) = state.next(GlobalStateKind::ShuttingDown);
        assert_that!(switched, eq(false));
        assert_that!(seen, eq(GlobalStateKind::Loading));

        let (seen, switched) = state.next(GlobalStateKind::Active);
        assert_that!(switched, eq(true));
        assert_that!(seen, eq(GlobalStateKind::Loading));

        let (seen, switched) = state.next(GlobalStateKind::Active);
        assert_that!(switched, eq(false));
        assert_that!(seen, eq(GlobalStateKind::Active));

        let (_, switched) = state.next(GlobalStateKind::ShuttingDown);
        assert_that!(switched, eq(true));
        assert_that!(state.current(), eq(GlobalStateKind::ShuttingDown));
    }
}
