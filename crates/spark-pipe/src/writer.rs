use alloc::{sync::Arc, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    PipeError,
    pipe::{Shared, WriterStatus, wake},
};

/// 一次 `flush` 的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushResult {
    is_completed: bool,
    is_canceled: bool,
}

impl FlushResult {
    /// 消费者已完成，继续写入没有意义。
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// 本次 `flush` 被 [`PipeWriter::cancel_pending_flush`] 打断。
    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }
}

/// 管道写端，唯一生产者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 写入分两步：`get_memory` 租借可写块并由调用方填充，`advance` 登记为未提交段；
///   `flush` 才把段交给读端。接收循环据此把“套接字收到的字节”零拷贝地移交给协议层；
/// - `write_bytes` 直接追加已存在的 `Bytes`，多个不连续的段会原样保留，
///   发送侧可以据此走分散/聚集写。
///
/// ## 契约（What）
/// - `flush` 在未消费字节达到暂停阈值时挂起，读端消费到恢复阈值以下后返回；
/// - 读端完成后 `flush` 返回 `is_completed = true`（读端携带错误时返回该错误）；
/// - `complete` 会先提交剩余未提交段；`Drop` 等价于 `complete(None)`。
pub struct PipeWriter {
    shared: Arc<Shared>,
    unflushed: Vec<Bytes>,
    unflushed_len: usize,
    flush_waiting: bool,
    completed: bool,
}

impl PipeWriter {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            unflushed: Vec::new(),
            unflushed_len: 0,
            flush_waiting: false,
            completed: false,
        }
    }

    /// 租借一块至少 `size_hint` 字节的可写内存（`len() == 0`）。
    pub fn get_memory(&mut self, size_hint: usize) -> BytesMut {
        let options = &self.shared.options;
        options
            .pool()
            .rent(size_hint.max(options.minimum_segment_size()))
    }

    /// 登记 `filled` 中已写入的字节为未提交段；空块直接归还内存池。
    pub fn advance(&mut self, filled: BytesMut) {
        if filled.is_empty() {
            self.shared.options.pool().give_back(filled);
            return;
        }
        self.unflushed_len += filled.len();
        self.unflushed.push(filled.freeze());
    }

    /// 复制 `data` 到租借块中并登记为未提交段。
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let mut memory = self.get_memory(data.len());
            let take = data.len().min(memory.capacity());
            memory.put_slice(&data[..take]);
            data = &data[take..];
            self.advance(memory);
        }
    }

    /// 零拷贝追加一个已有段。
    pub fn write_bytes(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.unflushed_len += segment.len();
        self.unflushed.push(segment);
    }

    /// 尚未提交给读端的字节数。
    pub fn unflushed_bytes(&self) -> usize {
        self.unflushed_len
    }

    /// 消费者是否已经完成。
    pub fn is_reader_completed(&self) -> bool {
        self.shared.state.lock().reader_completed
    }

    /// 提交未提交段并按背压等待。
    pub fn flush(&mut self) -> Flush<'_> {
        Flush { writer: self }
    }

    /// 轮询式 `flush`。
    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<FlushResult, PipeError>> {
        let options = &self.shared.options;
        let pause = options.pause_writer_threshold();
        let resume = options.resume_writer_threshold();

        let mut state = self.shared.state.lock();
        let reader_waker = if self.unflushed.is_empty() {
            None
        } else {
            let len = core::mem::take(&mut self.unflushed_len);
            state.append(self.unflushed.drain(..), len);
            state.reader_waker.take()
        };

        let outcome = if state.reader_completed {
            self.flush_waiting = false;
            match state.reader_error.clone() {
                Some(error) => Poll::Ready(Err(error)),
                None => Poll::Ready(Ok(FlushResult {
                    is_completed: true,
                    is_canceled: false,
                })),
            }
        } else if state.flush_canceled {
            state.flush_canceled = false;
            self.flush_waiting = false;
            Poll::Ready(Ok(FlushResult {
                is_completed: false,
                is_canceled: true,
            }))
        } else {
            let must_wait = match pause {
                Some(_) if self.flush_waiting => state.buffered > resume,
                Some(pause) => state.buffered >= pause,
                None => false,
            };
            if must_wait {
                self.flush_waiting = true;
                state.writer_waker = Some(cx.waker().clone());
                Poll::Pending
            } else {
                self.flush_waiting = false;
                Poll::Ready(Ok(FlushResult::default()))
            }
        };
        drop(state);
        wake(reader_waker);
        outcome
    }

    /// 让挂起中（或下一次）的 `flush` 以取消状态返回。
    pub fn cancel_pending_flush(&self) {
        let waker = {
            let mut state = self.shared.state.lock();
            state.flush_canceled = true;
            state.writer_waker.take()
        };
        wake(waker);
    }

    /// 生产者声明结束；`error` 会在读端耗尽数据后交付。
    pub fn complete(mut self, error: Option<PipeError>) {
        self.complete_inner(error);
    }

    fn complete_inner(&mut self, error: Option<PipeError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let waker = {
            let mut state = self.shared.state.lock();
            if !self.unflushed.is_empty() && !state.reader_completed {
                let len = core::mem::take(&mut self.unflushed_len);
                state.append(self.unflushed.drain(..), len);
            }
            state.writer = WriterStatus::Completed(error);
            state.reader_waker.take()
        };
        self.unflushed.clear();
        wake(waker);
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.complete_inner(None);
    }
}

impl core::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("unflushed", &self.unflushed_len)
            .field("completed", &self.completed)
            .finish()
    }
}

/// [`PipeWriter::flush`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct Flush<'a> {
    writer: &'a mut PipeWriter,
}

impl Future for Flush<'_> {
    type Output = Result<FlushResult, PipeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.writer.poll_flush(cx)
    }
}
