use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Counter that defers task switches.
///
/// While at least one holder has [`enter`](Self::enter)ed, a requested switch
/// is recorded with [`postpone`](Self::postpone) instead of being performed.
/// The holder whose [`exit`](Self::exit) brings the counter back to zero is told
/// to replay the switch, at most once regardless of how many were requested.
#[derive(Debug, Default)]
pub struct SwitchPostponer {
    depth: AtomicU32,
    postponed: AtomicBool,
}

impl SwitchPostponer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            postponed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn enter(&self) {
        self.depth.fetch_add(1, Ordering::Acquire);
    }

    /// Leaves one level; returns `true` if a postponed switch must run now.
    #[inline]
    #[must_use]
    pub fn exit(&self) -> bool {
        let previous = self.depth.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "switch postponer underflow");
        previous == 1 && self.postponed.swap(false, Ordering::AcqRel)
    }

    /// Whether switches are currently deferred.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::Relaxed) > 0
    }

    /// Records that a switch was requested while deferred.
    #[inline]
    pub fn postpone(&self) {
        self.postponed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_postponed(&self) -> bool {
        self.postponed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_happens_once_at_outermost_exit() {
        let p = SwitchPostponer::new();
        p.enter();
        p.enter();
        p.postpone();
        p.postpone();
        assert!(!p.exit());
        assert!(p.is_postponed());
        assert!(p.exit());
        assert!(!p.is_postponed());
        assert!(!p.is_active());
    }

    #[test]
    fn no_replay_without_request() {
        let p = SwitchPostponer::new();
        p.enter();
        assert!(p.is_active());
        assert!(!p.exit());
    }
}
