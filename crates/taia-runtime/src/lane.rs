//! Single-lane mutation queue.
//!
//! All mutating work in the process shares one permit. The semaphore is fair,
//! so waiters acquire it in the order they asked for it: operations run one
//! at a time, in submission order. A failed operation releases the permit
//! like any other, and the next waiter proceeds.

use crate::error::{BridgeError, BridgeResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Lane occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneOccupancy {
    /// Operations executing right now (0 or 1).
    pub active: u32,
    /// Operations waiting for the permit.
    pub queued: u64,
    /// Operations that have finished, successfully or not.
    pub completed: u64,
}

/// Counts one waiter for as long as it lives, so a submission dropped
/// while queued (e.g. by a timeout) does not leak into `queued`.
struct Waiting<'a>(&'a AtomicU64);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The process-wide queue for mutating operations.
#[derive(Debug, Clone)]
pub struct MutationLane {
    sem: Arc<Semaphore>,
    queued: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl MutationLane {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
            queued: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for the lane, run `work`, release.
    ///
    /// Returns `Err(LaneClosed)` if the lane was closed before the permit
    /// was granted.
    pub async fn submit<F, T>(&self, work: F) -> BridgeResult<T>
    where
        F: Future<Output = T>,
    {
        let waiting = Waiting::enter(&self.queued);
        let permit = self.sem.acquire().await;
        drop(waiting);
        let _permit = permit.map_err(|_| BridgeError::LaneClosed)?;

        let out = work.await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }

    pub fn occupancy(&self) -> LaneOccupancy {
        LaneOccupancy {
            active: 1u32.saturating_sub(self.sem.available_permits() as u32),
            queued: self.queued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }

    /// Refuse all further submissions. Work already holding the permit
    /// finishes normally.
    pub fn close(&self) {
        self.sem.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sem.is_closed()
    }
}

impl Default for MutationLane {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_operations_never_overlap() {
        let lane = MutationLane::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (l1, log1) = (lane.clone(), log.clone());
        let a = tokio::spawn(async move {
            l1.submit(async move {
                log1.lock().unwrap().push("A-start");
                tokio::time::sleep(Duration::from_millis(50)).await;
                log1.lock().unwrap().push("A-end");
            })
            .await
        });
        // Let A take the permit before B is submitted.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (l2, log2) = (lane.clone(), log.clone());
        let b = tokio::spawn(async move {
            l2.submit(async move {
                log2.lock().unwrap().push("B-start");
                log2.lock().unwrap().push("B-end");
            })
            .await
        });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A-start", "A-end", "B-start", "B-end"]
        );
        assert_eq!(lane.occupancy().completed, 2);
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let lane = MutationLane::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lane so every submission has to queue.
        let gate = lane.sem.clone().acquire_owned().await.unwrap();
        let mut handles = Vec::new();
        for i in 0..5 {
            let (l, o) = (lane.clone(), order.clone());
            handles.push(tokio::spawn(async move {
                l.submit(async move { o.lock().unwrap().push(i) }).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(lane.occupancy().queued, 5);
        drop(gate);

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stall_lane() {
        let lane = MutationLane::new();
        let first: Result<(), String> = lane
            .submit(async { Err("disk full".to_string()) })
            .await
            .unwrap();
        assert!(first.is_err());

        let second = lane.submit(async { 7 }).await.unwrap();
        assert_eq!(second, 7);
        assert_eq!(lane.occupancy().active, 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_no_trace() {
        let lane = MutationLane::new();
        let gate = lane.sem.clone().acquire_owned().await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), lane.submit(async { 1 })).await;
        assert!(timed_out.is_err());
        assert_eq!(lane.occupancy().queued, 0);
        assert_eq!(lane.occupancy().active, 1);

        drop(gate);
        assert_eq!(
            lane.occupancy(),
            LaneOccupancy {
                active: 0,
                queued: 0,
                completed: 0,
            }
        );
        assert_eq!(lane.submit(async { 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_closed_lane_rejects() {
        let lane = MutationLane::new();
        lane.close();
        assert!(lane.is_closed());
        let err = lane.submit(async { 1 }).await.unwrap_err();
        assert!(matches!(err, BridgeError::LaneClosed));
    }
}
