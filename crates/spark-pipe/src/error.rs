use alloc::sync::Arc;
use std::error::Error as StdError;

/// 管道完成时携带的错误。
///
/// # 契约（What）
/// - 由生产者或消费者在 `complete(Some(err))` 时注入，另一端在下一次 `read`/`flush` 时观察到；
/// - 内部以 `Arc` 共享，`Clone` 成本为一次引用计数；
/// - 通过 [`PipeError::downcast_ref`] 还原具体错误类型（例如传输层的连接重置）。
#[derive(Clone, Debug, thiserror::Error)]
#[error("pipe completed with error: {inner}")]
pub struct PipeError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl PipeError {
    /// 包装任意错误。
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// 以具体类型查看内部错误。
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// 内部错误是否为 `E` 类型。
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.inner.is::<E>()
    }

    /// 返回内部错误的引用。
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}
