//! Matches recognition results to their originating frames by frame index.
//!
//! Recognition runs behind the decode path and never blocks it, so for any
//! frame the overlay stage either finds a result that already arrived,
//! waits out a short deadline for one that is in flight, or passes the
//! frame through unannotated. Results that outlive the skew window are
//! discarded; their frames left the pipeline long ago.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;
use vigil_recognition::{FaceRecord, RecognitionResult};

/// What the overlay stage learns about a frame's recognition.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Result arrived; draw it.
    Ready(Vec<FaceRecord>),
    /// A request is in flight; worth waiting for up to the deadline.
    Pending,
    /// Recognition was never dispatched for this frame (engine busy).
    NotDispatched,
}

/// Pure state; all methods take an explicit `now` for testability.
pub struct ResultRouter {
    skew_window: Duration,
    /// Dispatched to the engine, result not yet back
    pending: HashSet<u64>,
    /// Results keyed by frame index, with arrival times for expiry
    ready: HashMap<u64, Vec<FaceRecord>>,
    arrivals: VecDeque<(u64, Instant)>,
    overlay_missed: u64,
    overlay_drawn: u64,
}

impl ResultRouter {
    pub fn new(skew_window: Duration) -> Self {
        Self {
            skew_window,
            pending: HashSet::new(),
            ready: HashMap::new(),
            arrivals: VecDeque::new(),
            overlay_missed: 0,
            overlay_drawn: 0,
        }
    }

    /// Record that a frame was handed to the recognition engine.
    pub fn mark_dispatched(&mut self, frame_index: u64) {
        self.pending.insert(frame_index);
    }

    /// Store an engine result.
    pub fn store(&mut self, result: RecognitionResult, now: Instant) {
        self.expire(now);
        self.pending.remove(&result.frame_index);
        self.arrivals.push_back((result.frame_index, now));
        self.ready.insert(result.frame_index, result.records);
    }

    /// Look up the result for a frame. `Ready` consumes it.
    pub fn take(&mut self, frame_index: u64, now: Instant) -> RouteOutcome {
        self.expire(now);
        if let Some(records) = self.ready.remove(&frame_index) {
            self.overlay_drawn += 1;
            return RouteOutcome::Ready(records);
        }
        if self.pending.contains(&frame_index) {
            return RouteOutcome::Pending;
        }
        RouteOutcome::NotDispatched
    }

    /// Record that a frame left overlay unannotated.
    pub fn mark_missed(&mut self, frame_index: u64) {
        self.pending.remove(&frame_index);
        self.overlay_missed += 1;
        debug!(frame_index, missed = self.overlay_missed, "Overlay deadline missed");
    }

    pub fn overlay_missed(&self) -> u64 {
        self.overlay_missed
    }

    pub fn overlay_drawn(&self) -> u64 {
        self.overlay_drawn
    }

    /// Drop results older than the skew window; their frames are gone.
    fn expire(&mut self, now: Instant) {
        while let Some(&(idx, arrived)) = self.arrivals.front() {
            if now.duration_since(arrived) < self.skew_window {
                break;
            }
            self.arrivals.pop_front();
            if self.ready.remove(&idx).is_some() {
                debug!(frame_index = idx, "Recognition result expired unused");
            }
        }
    }
}

/// Shared handle: recognition tasks store results, the overlay stage waits.
pub struct ResultRouterHandle {
    inner: Mutex<ResultRouter>,
    arrived: Notify,
}

impl ResultRouterHandle {
    pub fn new(skew_window: Duration) -> Self {
        Self {
            inner: Mutex::new(ResultRouter::new(skew_window)),
            arrived: Notify::new(),
        }
    }

    pub fn mark_dispatched(&self, frame_index: u64) {
        self.lock().mark_dispatched(frame_index);
    }

    pub fn store(&self, result: RecognitionResult) {
        self.lock().store(result, Instant::now());
        self.arrived.notify_waiters();
    }

    pub fn overlay_missed(&self) -> u64 {
        self.lock().overlay_missed()
    }

    /// Wait up to `deadline` for this frame's result.
    ///
    /// Returns the records to draw, or None for pass-through (which is
    /// counted as an overlay miss only if a result had been dispatched;
    /// an undispatched frame was never going to be annotated).
    pub async fn wait_for(&self, frame_index: u64, deadline: Duration) -> Option<Vec<FaceRecord>> {
        let waited = Instant::now();
        loop {
            let notified = self.arrived.notified();
            {
                let mut router = self.lock();
                match router.take(frame_index, Instant::now()) {
                    RouteOutcome::Ready(records) => return Some(records),
                    RouteOutcome::NotDispatched => return None,
                    RouteOutcome::Pending => {}
                }
            }
            let elapsed = waited.elapsed();
            if elapsed >= deadline {
                self.lock().mark_missed(frame_index);
                return None;
            }
            if tokio::time::timeout(deadline - elapsed, notified).await.is_err() {
                self.lock().mark_missed(frame_index);
                return None;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResultRouter> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(frame_index: u64) -> RecognitionResult {
        RecognitionResult {
            frame_index,
            records: vec![],
            partial: false,
        }
    }

    #[test]
    fn ready_result_is_consumed_once() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        let now = Instant::now();
        router.mark_dispatched(3);
        router.store(result(3), now);

        assert!(matches!(router.take(3, now), RouteOutcome::Ready(_)));
        // Second take: gone
        assert!(matches!(router.take(3, now), RouteOutcome::NotDispatched));
    }

    #[test]
    fn pending_while_in_flight() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        router.mark_dispatched(7);
        assert!(matches!(
            router.take(7, Instant::now()),
            RouteOutcome::Pending
        ));
    }

    #[test]
    fn undispatched_frame_is_not_pending() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        assert!(matches!(
            router.take(9, Instant::now()),
            RouteOutcome::NotDispatched
        ));
    }

    #[test]
    fn results_expire_after_skew_window() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        let t0 = Instant::now();
        router.mark_dispatched(1);
        router.store(result(1), t0);

        let t1 = t0 + Duration::from_millis(600);
        assert!(matches!(router.take(1, t1), RouteOutcome::NotDispatched));
    }

    #[test]
    fn result_within_window_survives() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        let t0 = Instant::now();
        router.store(result(1), t0);
        let t1 = t0 + Duration::from_millis(400);
        assert!(matches!(router.take(1, t1), RouteOutcome::Ready(_)));
    }

    #[test]
    fn missed_counter_increments() {
        let mut router = ResultRouter::new(Duration::from_millis(500));
        router.mark_dispatched(5);
        router.mark_missed(5);
        router.mark_missed(6);
        assert_eq!(router.overlay_missed(), 2);
        assert_eq!(router.overlay_drawn(), 0);
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_when_ready() {
        let handle = ResultRouterHandle::new(Duration::from_millis(500));
        handle.mark_dispatched(2);
        handle.store(result(2));
        let records = handle.wait_for(2, Duration::from_millis(100)).await;
        assert!(records.is_some());
    }

    #[tokio::test]
    async fn wait_for_undisplatched_is_instant_passthrough() {
        let handle = ResultRouterHandle::new(Duration::from_millis(500));
        let started = Instant::now();
        let records = handle.wait_for(2, Duration::from_millis(200)).await;
        assert!(records.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
        // Not counted as a miss: nothing was ever in flight
        assert_eq!(handle.overlay_missed(), 0);
    }

    #[tokio::test]
    async fn wait_for_times_out_on_slow_result() {
        let handle = ResultRouterHandle::new(Duration::from_millis(500));
        handle.mark_dispatched(4);
        let records = handle.wait_for(4, Duration::from_millis(50)).await;
        assert!(records.is_none());
        assert_eq!(handle.overlay_missed(), 1);
    }

    #[tokio::test]
    async fn wait_for_wakes_on_arrival() {
        use std::sync::Arc;
        let handle = Arc::new(ResultRouterHandle::new(Duration::from_millis(500)));
        handle.mark_dispatched(8);

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait_for(8, Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.store(result(8));

        let records = waiter.await.unwrap();
        assert!(records.is_some());
    }
}
