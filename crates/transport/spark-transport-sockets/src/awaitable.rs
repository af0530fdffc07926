use std::{
    io,
    task::{Context, Poll, Waker},
};

use crate::sync::{AtomicUsize, Ordering, Slot, WakerSlot};

const IDLE: usize = 0;
const WAITING: usize = 1;
const COMPLETED: usize = 2;

/// `SocketAwaitable` 把“任意线程上的完成回调”桥接为可轮询的完成单元。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接收与发送操作由反应器的唤醒回调驱动完成，回调线程与等待该结果的任务线程无关；
///   需要一个无锁的交汇点，让“先完成后等待”和“先等待后完成”两种时序都只唤醒一次；
/// - 每个方向每条连接只有一个实例，在 `get_result` 之后复位重用，避免逐次分配。
///
/// ## 核心机制（How）
/// - 状态字在 `IDLE`/`WAITING`/`COMPLETED` 三值间迁移，`COMPLETED` 是哨兵：
///   - `complete` 先写入结果，再以 `swap(COMPLETED)` 发布；若旧值为 `WAITING` 则唤醒登记的续体；
///   - `on_completed` 先把 `Waker` 放入原子续体槽，再尝试 `IDLE → WAITING`；
///     若发现已是 `COMPLETED`，说明完成先到，直接 `wake_by_ref` 同步执行续体；
/// - 结果字节数存放在原子整数中，错误放在短临界区槽位里，二者都在哨兵发布之前写入。
///
/// ## 契约（What）
/// - 每个武装周期最多调用一次 `complete`；
/// - `get_result` 只能在 [`SocketAwaitable::is_completed`] 为真之后调用，调用后状态回到 `IDLE`；
/// - 同一周期内重复 `on_completed` 会替换续体，只有最后登记的 `Waker` 被唤醒。
///
/// ## 注意事项（Trade-offs）
/// - `complete` 与 `on_completed` 交错时续体可能被唤醒两次，调用方的轮询逻辑需容忍多余唤醒。
pub struct SocketAwaitable {
    state: AtomicUsize,
    waker: WakerSlot,
    bytes_transferred: AtomicUsize,
    error: Slot<io::Error>,
}

impl Default for SocketAwaitable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketAwaitable {
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(IDLE),
            waker: WakerSlot::new(),
            bytes_transferred: AtomicUsize::new(0),
            error: Slot::new(),
        }
    }

    /// 记录一次操作的结果并发布完成哨兵，可从任意线程调用。
    pub fn complete(&self, bytes_transferred: usize, error: Option<io::Error>) {
        self.bytes_transferred
            .store(bytes_transferred, Ordering::Relaxed);
        self.error.put(error);
        if self.state.swap(COMPLETED, Ordering::AcqRel) == WAITING {
            self.waker.wake();
        }
    }

    /// 登记续体；若操作已完成则立即执行续体。
    pub fn on_completed(&self, waker: &Waker) {
        self.waker.register(waker);
        match self
            .state
            .compare_exchange(IDLE, WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) | Err(WAITING) => {}
            Err(_) => waker.wake_by_ref(),
        }
    }

    /// 操作是否已完成。
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    /// 取走结果并复位，供下一次操作重用。
    pub fn get_result(&self) -> io::Result<usize> {
        debug_assert!(self.is_completed(), "get_result before completion");
        let bytes = self.bytes_transferred.swap(0, Ordering::Relaxed);
        let error = self.error.take();
        self.state.store(IDLE, Ordering::Release);
        match error {
            Some(error) => Err(error),
            None => Ok(bytes),
        }
    }

    /// `Future` 风格的组合：完成则取结果，否则登记续体。
    pub fn poll_completion(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.is_completed() {
            return Poll::Ready(self.get_result());
        }
        self.on_completed(cx.waker());
        if self.is_completed() {
            Poll::Ready(self.get_result())
        } else {
            Poll::Pending
        }
    }
}

impl std::fmt::Debug for SocketAwaitable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            IDLE => "idle",
            WAITING => "waiting",
            _ => "completed",
        };
        f.debug_struct("SocketAwaitable")
            .field("state", &state)
            .finish()
    }
}
