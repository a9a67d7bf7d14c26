use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Shared view of the worker loop's progress for external monitoring.
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    inner: Arc<State>,
}

#[derive(Debug, Default)]
struct State {
    last_cycle_ms: AtomicI64,
    cycles: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful cycle and returns its timestamp.
    pub fn touch(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.inner
            .last_cycle_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.inner.cycles.fetch_add(1, Ordering::Relaxed);
        now
    }

    pub fn last_cycle(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_cycle_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::Relaxed)
    }

    /// True when no cycle has completed within `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let Some(last) = self.last_cycle() else {
            return true;
        };
        let age = Utc::now().signed_duration_since(last);
        age.to_std().is_ok_and(|age| age > max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_handle_is_stale() {
        let liveness = Liveness::new();

        assert!(liveness.last_cycle().is_none());
        assert!(liveness.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn touch_is_visible_through_clones() {
        let liveness = Liveness::new();
        let monitor = liveness.clone();

        let at = liveness.touch();
        liveness.touch();

        assert_eq!(monitor.cycles(), 2);
        assert!(
            monitor
                .last_cycle()
                .is_some_and(|last| last.timestamp_millis() >= at.timestamp_millis())
        );
        assert!(!monitor.is_stale(Duration::from_secs(60)));
    }
}
