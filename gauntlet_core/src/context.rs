use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation token with an optional deadline.
///
/// Clones share the same cancellation flag. A child created with
/// [`RunContext::child`] or [`RunContext::child_with_timeout`] observes its
/// ancestors' cancellation, but cancelling the child leaves the parent running.
/// A child expires at the earlier of its own and its parent's deadline.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancelled: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    /// Child that inherits the parent's deadline.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.cancelled));
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            ancestors,
            deadline: self.deadline,
        }
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = match self.deadline {
            Some(parent) if parent < candidate => Some(parent),
            _ => Some(candidate),
        };
        child
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self
                .ancestors
                .iter()
                .any(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_cancel_reaches_clones_and_children() {
        let parent = RunContext::new();
        let clone = parent.clone();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        let grandchild = child.child();
        assert!(!grandchild.is_done());
        clone.cancel();
        assert!(parent.is_done());
        assert!(child.is_done());
        assert!(grandchild.is_done());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn child_takes_earlier_deadline() {
        let parent = RunContext::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        assert!(child.remaining().unwrap() <= Duration::from_millis(10));
        assert_eq!(parent.child().deadline(), parent.deadline());
    }

    #[test]
    fn expired_deadline_is_done() {
        let ctx = RunContext::with_timeout(Duration::ZERO);
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(RunContext::new().remaining().is_none());
    }
}
