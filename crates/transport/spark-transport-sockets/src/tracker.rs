use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::Notify;

/// `ConnectionTracker` 统计传输实例上的活跃连接数，并在归零时唤醒等待者。
///
/// # 教案级注释
/// - **意图 (Why)**：连接交给分发回调后即与接受循环脱钩，停机时仍需要知道“还有多少连接没关完”；
///   以 WaitGroup 语义为 `stop` 提供等待点；
/// - **设计与逻辑 (How)**：内部以原子计数跟踪在途连接，计数归零时通过 [`Notify::notify_waiters`]
///   唤醒全部等待者；每条连接持有一个 [`ConnectionGuard`]，连接进入 `Closed` 时守卫被释放，计数随之递减；
/// - **契约 (What)**：`wait_for_idle` 在计数为零时立即返回，可被任意多个任务并发调用；
/// - **风险与权衡 (Trade-offs & Gotchas)**：`notify_waiters` 不保留许可，等待者必须先 `enable`
///   登记再检查计数，否则会错过检查与挂起之间发生的归零。
#[derive(Clone, Default)]
pub(crate) struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    counter: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 登记一条新连接。
    pub(crate) fn track(&self) -> ConnectionGuard {
        self.inner.counter.fetch_add(1, Ordering::Release);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.inner.counter.load(Ordering::Acquire)
    }

    /// 等待所有被跟踪的连接关闭。
    pub(crate) async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("active", &self.active())
            .finish()
    }
}

/// 活跃连接守卫，释放时递减计数。
pub(crate) struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.inner.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_idle_returns_after_last_guard_drops() {
        let tracker = ConnectionTracker::new();
        tracker.wait_for_idle().await;

        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(tracker.active(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_idle().await })
        };
        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(second);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("idle must be observed")
            .expect("join");
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_waiters_all_observe_idle() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.wait_for_idle().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|waiter| !waiter.is_finished()));

        drop(guard);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("every waiter must observe idle")
                .expect("join");
        }
    }

    #[tokio::test]
    async fn idle_can_be_reached_more_than_once() {
        let tracker = ConnectionTracker::new();
        for _ in 0..3 {
            let guard = tracker.track();
            let waiter = {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.wait_for_idle().await })
            };
            tokio::task::yield_now().await;
            drop(guard);
            tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("idle must be observed")
                .expect("join");
        }
    }
}
