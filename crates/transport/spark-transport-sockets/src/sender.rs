use std::{
    future::Future,
    io::{self, IoSlice},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use futures_util::task::{ArcWake, waker_ref};
use parking_lot::{Mutex, MutexGuard};
use spark_pipe::ReadBuffer;

use crate::{
    awaitable::SocketAwaitable,
    error::socket_disposed_error,
    socket::{DisposeWatcher, SocketHandle},
};

/// 单次分散/聚集写最多携带的段数，与常见 `IOV_MAX` 下限对齐。
pub const MAX_IOVECS: usize = 64;

/// 单次逻辑发送的发起者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 出站管道交给发送循环的数据可能由多个不连续段组成；逐段发送会产生多次系统调用，
///   合并复制又会浪费带宽，因此多段时走 `writev` 式分散/聚集写；
/// - 段列表由 `Sender` 缓存并在每次完成后清空复用，避免每次发送重新分配。
///
/// ## 核心机制（How）
/// - 与接收侧相同，操作对象 `SendOperation` 实现 [`ArcWake`]，写就绪后由反应器回调继续推进；
/// - 单段走 `try_write`，多段在栈上组装至多 [`MAX_IOVECS`] 个 [`IoSlice`] 后走 `try_write_vectored`；
/// - 部分写入时按已写字节推进段列表并继续，直到全部写出才完成。
///
/// ## 契约（What）
/// - `send` 的完成值为本次发送的总字节数；只有全部写出或出错时才完成；
/// - 完成之前一定先清空缓存段列表；
/// - 套接字释放后挂起中的发送以中止类错误完成。
pub struct Sender {
    operation: Arc<SendOperation>,
}

struct SendSlot {
    segments: Vec<Bytes>,
    transferred: usize,
    in_flight: bool,
}

struct SendOperation {
    socket: Arc<SocketHandle>,
    awaitable: SocketAwaitable,
    slot: Mutex<SendSlot>,
}

impl Sender {
    pub(crate) fn new(socket: Arc<SocketHandle>) -> Self {
        let operation = Arc::new(SendOperation {
            socket,
            awaitable: SocketAwaitable::new(),
            slot: Mutex::new(SendSlot {
                segments: Vec::new(),
                transferred: 0,
                in_flight: false,
            }),
        });
        let watcher = Arc::downgrade(&operation);
        operation.socket.watch(watcher);
        Self { operation }
    }

    /// 发送读缓冲中的全部段。
    pub fn send(&mut self, buffer: &ReadBuffer) -> SendFuture<'_> {
        self.send_segments(buffer.segments().iter().cloned())
    }

    /// 发送任意段序列；空段被忽略。
    pub fn send_segments<I>(&mut self, segments: I) -> SendFuture<'_>
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.operation.start(segments);
        SendFuture { sender: self }
    }

    /// 缓存段列表当前的容量；列表在每次完成时清空但保留容量。
    pub fn cached_capacity(&self) -> usize {
        self.operation.slot.lock().segments.capacity()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("awaitable", &self.operation.awaitable)
            .finish()
    }
}

impl SendOperation {
    fn start<I>(self: &Arc<Self>, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        if self.awaitable.is_completed() {
            let _ = self.awaitable.get_result();
        }
        {
            let mut slot = self.slot.lock();
            slot.segments.clear();
            slot.segments
                .extend(segments.into_iter().filter(|segment| !segment.is_empty()));
            slot.transferred = 0;
            slot.in_flight = true;
        }
        self.attempt();
    }

    fn attempt(self: &Arc<Self>) {
        loop {
            let mut slot = self.slot.lock();
            if !slot.in_flight {
                return;
            }
            if self.socket.is_disposed() {
                self.finish(slot, Some(socket_disposed_error()));
                return;
            }
            if slot.segments.is_empty() {
                self.finish(slot, None);
                return;
            }

            match write_segments(self.socket.stream(), &slot.segments) {
                Ok(0) => {
                    self.finish(slot, Some(io::Error::from(io::ErrorKind::WriteZero)));
                    return;
                }
                Ok(written) => {
                    slot.transferred += written;
                    consume(&mut slot.segments, written);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    self.finish(slot, Some(err));
                    return;
                }
            }
            drop(slot);

            let waker = waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            match self.socket.stream().poll_write_ready(&mut cx) {
                Poll::Ready(Ok(())) => continue,
                Poll::Ready(Err(err)) => {
                    let slot = self.slot.lock();
                    if slot.in_flight {
                        self.finish(slot, Some(err));
                    }
                    return;
                }
                Poll::Pending => return,
            }
        }
    }

    fn finish(&self, mut slot: MutexGuard<'_, SendSlot>, error: Option<io::Error>) {
        slot.segments.clear();
        slot.in_flight = false;
        let transferred = std::mem::take(&mut slot.transferred);
        drop(slot);
        self.awaitable.complete(transferred, error);
    }
}

fn write_segments(stream: &tokio::net::TcpStream, segments: &[Bytes]) -> io::Result<usize> {
    match segments {
        [single] => stream.try_write(single),
        many => {
            let count = many.len().min(MAX_IOVECS);
            let slices: [IoSlice<'_>; MAX_IOVECS] = std::array::from_fn(|index| {
                IoSlice::new(many.get(index).map_or(&[][..], |segment| &segment[..]))
            });
            stream.try_write_vectored(&slices[..count])
        }
    }
}

/// 从段列表头部移除已写出的 `written` 字节。
fn consume(segments: &mut Vec<Bytes>, mut written: usize) {
    let mut drained = 0;
    for segment in segments.iter_mut() {
        if written == 0 {
            break;
        }
        if segment.len() <= written {
            written -= segment.len();
            drained += 1;
        } else {
            segment.advance(written);
            written = 0;
        }
    }
    segments.drain(..drained);
}

impl ArcWake for SendOperation {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.attempt();
    }
}

impl DisposeWatcher for SendOperation {
    fn socket_disposed(self: Arc<Self>) {
        self.attempt();
    }
}

/// [`Sender::send`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct SendFuture<'a> {
    sender: &'a mut Sender,
}

impl Future for SendFuture<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.sender.operation.awaitable.poll_completion(cx)
    }
}
