//! 完成原语使用的同步原语切换层：常规构建使用标准库与 `futures-util`，`--cfg spark_loom` 时换成 Loom 模型。

#[cfg(not(spark_loom))]
pub(crate) use core::sync::atomic::{AtomicUsize, Ordering};
#[cfg(spark_loom)]
pub(crate) use loom::sync::atomic::{AtomicUsize, Ordering};

/// 单值槽位，`put`/`take` 均为短临界区。
pub(crate) struct Slot<T> {
    #[cfg(not(spark_loom))]
    inner: parking_lot::Mutex<Option<T>>,
    #[cfg(spark_loom)]
    inner: loom::sync::Mutex<Option<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(not(spark_loom))]
            inner: parking_lot::Mutex::new(None),
            #[cfg(spark_loom)]
            inner: loom::sync::Mutex::new(None),
        }
    }

    pub(crate) fn put(&self, value: Option<T>) {
        *self.lock() = value;
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.lock().take()
    }

    #[cfg(not(spark_loom))]
    fn lock(&self) -> parking_lot::MutexGuard<'_, Option<T>> {
        self.inner.lock()
    }

    #[cfg(spark_loom)]
    fn lock(&self) -> loom::sync::MutexGuard<'_, Option<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// 续体槽位：统一 `futures-util` 与 Loom 两套 `AtomicWaker` 的登记签名。
pub(crate) struct WakerSlot {
    #[cfg(not(spark_loom))]
    inner: futures_util::task::AtomicWaker,
    #[cfg(spark_loom)]
    inner: loom::future::AtomicWaker,
}

impl WakerSlot {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(not(spark_loom))]
            inner: futures_util::task::AtomicWaker::new(),
            #[cfg(spark_loom)]
            inner: loom::future::AtomicWaker::new(),
        }
    }

    pub(crate) fn register(&self, waker: &core::task::Waker) {
        #[cfg(not(spark_loom))]
        self.inner.register(waker);
        #[cfg(spark_loom)]
        self.inner.register_by_ref(waker);
    }

    pub(crate) fn wake(&self) {
        self.inner.wake();
    }
}
