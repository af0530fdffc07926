use alloc::{sync::Arc, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};

use crate::{
    PipeError, ReadBuffer,
    pipe::{Shared, WriterStatus, wake},
};

/// 一次读取的结果。
///
/// # 契约（What）
/// - `buffer`：当前全部未消费的已提交数据（可能为空）；
/// - `is_completed`：生产者已完成，`buffer` 之后不会再有新数据；
/// - `is_canceled`：本次读取因 [`PipeReader::cancel_pending_read`] 提前返回。
#[derive(Clone, Debug, Default)]
pub struct ReadResult {
    buffer: ReadBuffer,
    is_completed: bool,
    is_canceled: bool,
}

impl ReadResult {
    pub fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> ReadBuffer {
        self.buffer
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }
}

/// 管道读端，唯一消费者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读端在 `read` 得到数据后必须通过 `advance_to` 告知消费进度，写端的背压以“未消费字节”计算；
/// - `advance_to_examined` 允许“看过但不消费”：协议层解析到半帧时声明已查看全部数据，
///   下一次 `read` 会等待新数据而不是立刻返回同一批字节。
///
/// ## 契约（What）
/// - 生产者以错误完成时，先交付剩余未查看的数据，数据耗尽后 `read` 返回该错误；
/// - `complete` 之后写端的 `flush` 会观察到 `is_completed`；
/// - `Drop` 等价于 `complete(None)`。
pub struct PipeReader {
    shared: Arc<Shared>,
    completed: bool,
}

/// 可跨任务持有的取消句柄，用于在读端被其他任务独占时打断其挂起中的 `read`。
#[derive(Clone)]
pub struct ReadCanceler {
    shared: Arc<Shared>,
}

impl ReadCanceler {
    /// 让挂起中（或下一次）的 `read` 以 `is_canceled = true` 返回。
    pub fn cancel(&self) {
        cancel_pending_read(&self.shared);
    }
}

impl core::fmt::Debug for ReadCanceler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ReadCanceler")
    }
}

fn cancel_pending_read(shared: &Shared) {
    let waker = {
        let mut state = shared.state.lock();
        state.read_canceled = true;
        state.reader_waker.take()
    };
    wake(waker);
}

impl PipeReader {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            completed: false,
        }
    }

    /// 等待数据、生产者完成或取消。
    pub fn read(&mut self) -> Read<'_> {
        Read { reader: self }
    }

    /// 非阻塞读取；没有可交付的结果时返回 `None`。
    pub fn try_read(&mut self) -> Option<Result<ReadResult, PipeError>> {
        let state = self.shared.state.lock();
        if !state.read_canceled && state.buffered <= state.examined && !state.writer_completed() {
            return None;
        }
        drop(state);
        match self.poll_read(&mut Context::from_waker(core::task::Waker::noop())) {
            Poll::Ready(result) => Some(result),
            Poll::Pending => None,
        }
    }

    /// 轮询式读取。
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Result<ReadResult, PipeError>> {
        let mut state = self.shared.state.lock();
        let completed = state.writer_completed();
        if state.read_canceled {
            state.read_canceled = false;
            return Poll::Ready(Ok(ReadResult {
                buffer: snapshot(&state.segments),
                is_completed: completed,
                is_canceled: true,
            }));
        }
        let has_new_data = state.buffered > state.examined;
        if has_new_data {
            return Poll::Ready(Ok(ReadResult {
                buffer: snapshot(&state.segments),
                is_completed: completed,
                is_canceled: false,
            }));
        }
        if !completed {
            state.reader_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        match &state.writer {
            WriterStatus::Completed(Some(error)) => Poll::Ready(Err(error.clone())),
            _ => Poll::Ready(Ok(ReadResult {
                buffer: snapshot(&state.segments),
                is_completed: true,
                is_canceled: false,
            })),
        }
    }

    /// 消费前 `consumed` 个字节，且视为已查看到同一位置。
    pub fn advance_to(&mut self, consumed: usize) {
        self.advance_to_examined(consumed, consumed);
    }

    /// 消费前 `consumed` 个字节，并声明已查看到 `examined`。
    pub fn advance_to_examined(&mut self, consumed: usize, examined: usize) {
        let mut released: Vec<Bytes> = Vec::new();
        let waker = {
            let mut state = self.shared.state.lock();
            let consumed = consumed.min(state.buffered);
            let examined = examined.clamp(consumed, state.buffered);

            let mut remaining = consumed;
            while remaining > 0 {
                let Some(front) = state.segments.front_mut() else {
                    break;
                };
                if front.len() <= remaining {
                    remaining -= front.len();
                    if let Some(segment) = state.segments.pop_front() {
                        released.push(segment);
                    }
                } else {
                    front.advance(remaining);
                    remaining = 0;
                }
            }
            state.buffered -= consumed;
            state.examined = examined - consumed;
            if consumed > 0 {
                state.writer_waker.take()
            } else {
                None
            }
        };
        wake(waker);
        let pool = self.shared.options.pool();
        for segment in released {
            pool.reclaim(segment);
        }
    }

    /// 让挂起中（或下一次）的 `read` 以取消状态返回。
    pub fn cancel_pending_read(&self) {
        cancel_pending_read(&self.shared);
    }

    /// 获取可跨任务持有的取消句柄。
    pub fn canceler(&self) -> ReadCanceler {
        ReadCanceler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 消费者声明结束；可选地携带错误告知生产者。
    pub fn complete(mut self, error: Option<PipeError>) {
        self.complete_inner(error);
    }

    fn complete_inner(&mut self, error: Option<PipeError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let (waker, segments) = {
            let mut state = self.shared.state.lock();
            state.reader_completed = true;
            state.reader_error = error;
            (state.writer_waker.take(), state.drain_segments())
        };
        wake(waker);
        let pool = self.shared.options.pool();
        for segment in segments {
            pool.reclaim(segment);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.complete_inner(None);
    }
}

impl core::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PipeReader")
            .field("buffered", &state.buffered)
            .field("writer_completed", &state.writer_completed())
            .finish()
    }
}

/// [`PipeReader::read`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct Read<'a> {
    reader: &'a mut PipeReader,
}

impl Future for Read<'_> {
    type Output = Result<ReadResult, PipeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.reader.poll_read(cx)
    }
}

fn snapshot(segments: &alloc::collections::VecDeque<Bytes>) -> ReadBuffer {
    ReadBuffer::from_segments(segments.iter().cloned().collect())
}
