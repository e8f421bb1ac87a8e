//! Intent locks coordinating overlapping multi-key operations.

/// Lock mode requested by a transaction for a key or a whole shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentMode {
    /// Shared intent: admits other shared holders, excludes exclusive.
    Shared,
    /// Exclusive intent: excludes everything.
    Exclusive,
}

/// Counting intent lock.
///
/// Holders are counted rather than tracked by owner; the transaction layer releases exactly what
/// it acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentLock {
    shared: u32,
    exclusive: u32,
}

impl IntentLock {
    /// Returns whether `mode` could be acquired right now.
    #[must_use]
    pub fn can_acquire(&self, mode: IntentMode) -> bool {
        match mode {
            IntentMode::Shared => self.exclusive == 0,
            IntentMode::Exclusive => self.exclusive == 0 && self.shared == 0,
        }
    }

    /// Attempts to acquire `mode`; returns whether the lock was taken.
    pub fn try_acquire(&mut self, mode: IntentMode) -> bool {
        if !self.can_acquire(mode) {
            return false;
        }
        match mode {
            IntentMode::Shared => self.shared += 1,
            IntentMode::Exclusive => self.exclusive += 1,
        }
        true
    }

    /// Releases one holder of `mode`.
    pub fn release(&mut self, mode: IntentMode) {
        match mode {
            IntentMode::Shared => self.shared = self.shared.saturating_sub(1),
            IntentMode::Exclusive => self.exclusive = self.exclusive.saturating_sub(1),
        }
    }

    /// Returns whether no holder remains.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{IntentLock, IntentMode};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn exclusive_excludes_everything() {
        let mut lock = IntentLock::default();
        assert_that!(lock.try_acquire(IntentMode::Exclusive), eq(true));
        assert_that!(lock.can_acquire(IntentMode::Shared), eq(false));
        assert_that!(lock.can_acquire(IntentMode::Exclusive), eq(false));

        lock.release(IntentMode::Exclusive);
        assert_that!(lock.is_free(), eq(true));
    }

    #[rstest]
    fn shared_admits_shared_but_blocks_exclusive() {
        let mut lock = IntentLock::default();
        assert_that!(lock.try_acquire(IntentMode::Shared), eq(true));
        assert_that!(lock.try_acquire(IntentMode::Shared), eq(true));
        assert_that!(lock.can_acquire(IntentMode::Exclusive), eq(false));

        lock.release(IntentMode::Shared);
        lock.release(IntentMode::Shared);
        assert_that!(lock.can_acquire(IntentMode::Exclusive), eq(true));
    }
}
