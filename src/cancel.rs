use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag for a run, optionally armed with a deadline.
/// Clones observe the same flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A token sharing this token's flag that also expires after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// SIGINT and SIGTERM set the flag. In-flight work is left to finish.
    #[cfg(unix)]
    pub fn register_signals(&self) -> std::io::Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};

        for sig in [SIGINT, SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.cancelled))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn register_signals(&self) -> std::io::Result<()> {
        tracing::warn!("signal-driven cancellation is only available on unix");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn deadline_expires() {
        let t = CancelToken::with_timeout(Duration::from_millis(0));
        assert!(t.is_cancelled());
    }

    #[test]
    fn child_deadline_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child_with_timeout(Duration::from_millis(0));
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        parent.cancel();
        assert!(parent.child_with_timeout(Duration::from_secs(60)).is_cancelled());
    }
}
