//! Leader failure detection: a randomised per-tablet timer.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::ConsensusOptions;

struct DetectorInner {
    deadline: Instant,
    enabled: bool,
}

/// Fires a callback when no leader contact has been observed within a
/// jittered window.
///
/// The window is re-randomised on every snooze, uniform in `[base, 2 * base]`
/// with `base = heartbeat_interval * max_missed_heartbeats`, so that replicas
/// time out at different moments and split votes stay unlikely (§5.2). The
/// detector is disabled while this peer is the leader.
pub(crate) struct FailureDetector {
    options: Arc<ConsensusOptions>,
    inner: Mutex<DetectorInner>,
    changed: Notify,
    abort: Mutex<Option<AbortHandle>>,
}

impl FailureDetector {
    pub fn new(options: Arc<ConsensusOptions>) -> Arc<Self> {
        let deadline = Instant::now() + options.new_rand_election_period();
        Arc::new(Self {
            options,
            inner: Mutex::new(DetectorInner {
                deadline,
                enabled: false,
            }),
            changed: Notify::new(),
            abort: Mutex::new(None),
        })
    }

    /// Spawn the timer task. `on_expire` must be cheap; it runs on the timer
    /// task and is expected to schedule the election elsewhere.
    pub fn start(self: &Arc<Self>, on_expire: Box<dyn Fn() + Send + Sync + 'static>) {
        let detector = self.clone();
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        *self.abort.lock().unwrap() = Some(abort_handle);
        let task = Abortable::new(
            async move {
                loop {
                    let (deadline, enabled) = {
                        let inner = detector.inner.lock().unwrap();
                        (inner.deadline, inner.enabled)
                    };
                    if !enabled {
                        detector.changed.notified().await;
                        continue;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = detector.changed.notified() => continue,
                    }
                    {
                        let mut inner = detector.inner.lock().unwrap();
                        if !inner.enabled || Instant::now() < inner.deadline {
                            continue;
                        }
                        // Re-arm before reporting so a stalled election does
                        // not stop further attempts.
                        inner.deadline = Instant::now() + detector.options.new_rand_election_period();
                    }
                    on_expire();
                }
            },
            abort_registration,
        );
        tokio::spawn(async move {
            let _ = task.await;
        });
    }

    /// Push the deadline out by a fresh randomised period, plus `extra` when
    /// the caller wants this replica to hold back (commit lag, failed
    /// election backoff, graceful handoff).
    pub fn snooze(&self, extra: Option<Duration>) {
        let period = self.options.new_rand_election_period() + extra.unwrap_or(Duration::ZERO);
        let mut inner = self.inner.lock().unwrap();
        inner.deadline = Instant::now() + period;
        drop(inner);
        self.changed.notify_one();
    }

    /// Arm the detector (follower mode).
    pub fn enable(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled = true;
        inner.deadline = Instant::now() + self.options.new_rand_election_period();
        drop(inner);
        self.changed.notify_one();
    }

    /// Disarm the detector (leader mode, or shutdown).
    pub fn disable(&self) {
        self.inner.lock().unwrap().enabled = false;
        self.changed.notify_one();
    }

    /// Stop the timer task for good.
    pub fn shutdown(&self) {
        self.disable();
        if let Some(handle) = self.abort.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    fn fast_options() -> Arc<ConsensusOptions> {
        Arc::new(
            ConsensusOptions::build()
                .heartbeat_interval(10)
                .max_missed_heartbeats(2)
                .validate()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fires_after_window_expires() {
        let detector = FailureDetector::new(fast_options());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        detector.start(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        detector.enable();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1);
        detector.shutdown();
    }

    #[tokio::test]
    async fn test_snooze_defers_expiry() {
        let detector = FailureDetector::new(fast_options());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        detector.start(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        detector.enable();

        // Keep snoozing more often than the minimum window (20ms base).
        for _ in 0..20 {
            detector.snooze(None);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        detector.shutdown();
    }

    #[tokio::test]
    async fn test_disabled_detector_does_not_fire() {
        let detector = FailureDetector::new(fast_options());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        detector.start(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        detector.shutdown();
    }
}
