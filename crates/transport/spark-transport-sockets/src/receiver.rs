use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::BytesMut;
use futures_util::task::{ArcWake, waker_ref};
use parking_lot::Mutex;

use crate::{
    awaitable::SocketAwaitable,
    error::socket_disposed_error,
    socket::{DisposeWatcher, SocketHandle},
};

/// 单次接收的发起者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接收循环每一轮只发起一次接收，结果要么是字节数，要么是错误；
///   把“发起 → 等待 OS 通知 → 完成”封装成可复用的操作，让循环本身只剩业务判定；
/// - 缓冲区在操作期间归操作所有，完成后随结果交还，调用方在完成前无法复用同一块内存。
///
/// ## 核心机制（How）
/// - 操作对象 `ReceiveOperation` 实现 [`ArcWake`]，自身就是反应器的完成回调：
///   非阻塞读遇到 `WouldBlock` 时，以自身为 `Waker` 登记读就绪；
///   就绪后回调在反应器所在线程上重试读取，并调用 [`SocketAwaitable::complete`] 发布结果；
/// - 发起时若数据已经就绪，读取在调用线程同步完成，随后的首次轮询即可取得结果；
/// - 套接字释放时操作被通知，挂起中的接收以“套接字已释放”中止类错误完成，而不是伪装成 FIN。
///
/// ## 契约（What）
/// - `receive` 返回 `(io::Result<usize>, BytesMut)`；`Ok(0)` 表示对端有序关闭（FIN）；
/// - `wait_for_data` 只等待可读（或 EOF/错误），不消耗缓冲区，完成值恒为 `Ok(0)`；
/// - 同一 `Receiver` 上的操作严格串行，由 `&mut self` 借用保证；错误不会被隐式重试。
pub struct Receiver {
    operation: Arc<ReceiveOperation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceiveMode {
    Read,
    WaitForData,
}

struct ReceiveSlot {
    buffer: Option<BytesMut>,
    mode: ReceiveMode,
    in_flight: bool,
}

struct ReceiveOperation {
    socket: Arc<SocketHandle>,
    awaitable: SocketAwaitable,
    slot: Mutex<ReceiveSlot>,
}

impl Receiver {
    pub(crate) fn new(socket: Arc<SocketHandle>) -> Self {
        let operation = Arc::new(ReceiveOperation {
            socket,
            awaitable: SocketAwaitable::new(),
            slot: Mutex::new(ReceiveSlot {
                buffer: None,
                mode: ReceiveMode::Read,
                in_flight: false,
            }),
        });
        let watcher = Arc::downgrade(&operation);
        operation.socket.watch(watcher);
        Self { operation }
    }

    /// 发起一次接收，读入 `buffer` 的剩余容量。
    pub fn receive(&mut self, mut buffer: BytesMut) -> Receive<'_> {
        if buffer.capacity() == buffer.len() {
            buffer.reserve(1);
        }
        self.operation.start(ReceiveMode::Read, Some(buffer));
        Receive {
            receiver: self,
            finished: false,
        }
    }

    /// 发起一次零字节接收：等待套接字可读，不占用缓冲区。
    pub fn wait_for_data(&mut self) -> WaitForData<'_> {
        self.operation.start(ReceiveMode::WaitForData, None);
        WaitForData { receiver: self }
    }

    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.operation.awaitable.poll_completion(cx)
    }

    fn take_buffer(&self) -> BytesMut {
        self.operation.slot.lock().buffer.take().unwrap_or_default()
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("awaitable", &self.operation.awaitable)
            .finish()
    }
}

impl ReceiveOperation {
    fn start(self: &Arc<Self>, mode: ReceiveMode, buffer: Option<BytesMut>) {
        // 上一次操作的 Future 若在完成前被丢弃，残留结果在此清理。
        if self.awaitable.is_completed() {
            let _ = self.awaitable.get_result();
        }
        {
            let mut slot = self.slot.lock();
            slot.buffer = buffer;
            slot.mode = mode;
            slot.in_flight = true;
        }
        self.attempt();
    }

    /// 尝试推进挂起中的操作；由发起方与反应器回调共同调用。
    fn attempt(self: &Arc<Self>) {
        loop {
            let mut slot = self.slot.lock();
            if !slot.in_flight {
                return;
            }
            if self.socket.is_disposed() {
                self.finish(slot, 0, Some(socket_disposed_error()));
                return;
            }
            if slot.mode == ReceiveMode::Read {
                let outcome = match slot.buffer.as_mut() {
                    Some(buffer) => self.socket.stream().try_read_buf(buffer),
                    None => Ok(0),
                };
                match outcome {
                    Ok(0) if self.socket.is_disposed() => {
                        self.finish(slot, 0, Some(socket_disposed_error()));
                        return;
                    }
                    Ok(read) => {
                        self.finish(slot, read, None);
                        return;
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        self.finish(slot, 0, Some(err));
                        return;
                    }
                }
            }
            drop(slot);

            let waker = waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            match self.socket.stream().poll_read_ready(&mut cx) {
                Poll::Ready(Ok(())) => {
                    let slot = self.slot.lock();
                    if slot.in_flight && slot.mode == ReceiveMode::WaitForData {
                        self.finish(slot, 0, None);
                        return;
                    }
                }
                Poll::Ready(Err(err)) => {
                    let slot = self.slot.lock();
                    if slot.in_flight {
                        self.finish(slot, 0, Some(err));
                    }
                    return;
                }
                Poll::Pending => return,
            }
        }
    }

    fn finish(
        &self,
        mut slot: parking_lot::MutexGuard<'_, ReceiveSlot>,
        read: usize,
        error: Option<io::Error>,
    ) {
        slot.in_flight = false;
        drop(slot);
        self.awaitable.complete(read, error);
    }
}

impl ArcWake for ReceiveOperation {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.attempt();
    }
}

impl DisposeWatcher for ReceiveOperation {
    fn socket_disposed(self: Arc<Self>) {
        self.attempt();
    }
}

/// [`Receiver::receive`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct Receive<'a> {
    receiver: &'a mut Receiver,
    finished: bool,
}

impl Future for Receive<'_> {
    type Output = (io::Result<usize>, BytesMut);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        debug_assert!(!self.finished, "Receive polled after completion");
        match self.receiver.poll_result(cx) {
            Poll::Ready(result) => {
                self.finished = true;
                let buffer = self.receiver.take_buffer();
                Poll::Ready((result, buffer))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// [`Receiver::wait_for_data`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct WaitForData<'a> {
    receiver: &'a mut Receiver,
}

impl Future for WaitForData<'_> {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_result(cx).map(|result| result.map(|_| ()))
    }
}
