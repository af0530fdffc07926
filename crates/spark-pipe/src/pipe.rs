use alloc::{collections::VecDeque, sync::Arc};
use core::task::Waker;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{PipeError, SlabMemoryPool, reader::PipeReader, writer::PipeWriter};

const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 64 * 1024;
const DEFAULT_MINIMUM_SEGMENT_SIZE: usize = 4096;

/// 管道的背压与内存配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 入站管道的阈值决定“协议层读得慢时，接收循环何时停止从套接字取数据”，进而让 TCP 窗口
///   把压力反馈给对端；出站管道的阈值决定协议层写得过快时何时被挂起；
/// - 内存池在传输实例范围内共享，由选项携带进每条管道。
///
/// ## 契约（What）
/// - `pause_writer_threshold`：未消费字节达到该值时 `flush` 挂起；`None` 表示不限；
/// - `resume_writer_threshold`：挂起中的 `flush` 在未消费字节不超过该值时恢复；
/// - `minimum_segment_size`：`get_memory` 的最小租借尺寸。
///
/// ## 注意事项（Trade-offs）
/// - `with_pause_writer_threshold` 会把恢复阈值同步为暂停阈值的一半，需要不同比例时再显式覆盖。
#[derive(Clone, Debug)]
pub struct PipeOptions {
    pause_writer_threshold: Option<usize>,
    resume_writer_threshold: usize,
    minimum_segment_size: usize,
    pool: SlabMemoryPool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            pause_writer_threshold: Some(DEFAULT_PAUSE_WRITER_THRESHOLD),
            resume_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD / 2,
            minimum_segment_size: DEFAULT_MINIMUM_SEGMENT_SIZE,
            pool: SlabMemoryPool::default(),
        }
    }
}

impl PipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置暂停阈值，恢复阈值随之设为一半；`None` 或 `Some(0)` 表示不限。
    pub fn with_pause_writer_threshold(mut self, threshold: Option<usize>) -> Self {
        let threshold = threshold.filter(|value| *value > 0);
        self.pause_writer_threshold = threshold;
        self.resume_writer_threshold = threshold.map(|value| value / 2).unwrap_or(0);
        self
    }

    /// 覆盖恢复阈值，取值会被限制在暂停阈值以内。
    pub fn with_resume_writer_threshold(mut self, threshold: usize) -> Self {
        self.resume_writer_threshold = match self.pause_writer_threshold {
            Some(pause) => threshold.min(pause),
            None => threshold,
        };
        self
    }

    pub fn with_minimum_segment_size(mut self, size: usize) -> Self {
        self.minimum_segment_size = size.max(1);
        self
    }

    pub fn with_pool(mut self, pool: SlabMemoryPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn pause_writer_threshold(&self) -> Option<usize> {
        self.pause_writer_threshold
    }

    pub fn resume_writer_threshold(&self) -> usize {
        self.resume_writer_threshold
    }

    pub fn minimum_segment_size(&self) -> usize {
        self.minimum_segment_size
    }

    pub fn pool(&self) -> &SlabMemoryPool {
        &self.pool
    }
}

/// 创建一条管道，返回写端与读端。
pub fn pipe(options: PipeOptions) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState::default()),
        options,
    });
    (
        PipeWriter::new(Arc::clone(&shared)),
        PipeReader::new(shared),
    )
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<PipeState>,
    pub(crate) options: PipeOptions,
}

#[derive(Default)]
pub(crate) enum WriterStatus {
    #[default]
    Active,
    Completed(Option<PipeError>),
}

#[derive(Default)]
pub(crate) struct PipeState {
    /// 已提交、未消费的段。
    pub(crate) segments: VecDeque<Bytes>,
    /// `segments` 的字节总数。
    pub(crate) buffered: usize,
    /// 读端已查看但未消费的字节数；`buffered > examined` 才算有新数据。
    pub(crate) examined: usize,
    pub(crate) writer: WriterStatus,
    pub(crate) reader_completed: bool,
    pub(crate) reader_error: Option<PipeError>,
    pub(crate) read_canceled: bool,
    pub(crate) flush_canceled: bool,
    pub(crate) reader_waker: Option<Waker>,
    pub(crate) writer_waker: Option<Waker>,
}

impl PipeState {
    pub(crate) fn writer_completed(&self) -> bool {
        matches!(self.writer, WriterStatus::Completed(_))
    }

    pub(crate) fn append(&mut self, segments: impl IntoIterator<Item = Bytes>, len: usize) {
        self.segments.extend(segments);
        self.buffered += len;
    }

    pub(crate) fn drain_segments(&mut self) -> VecDeque<Bytes> {
        self.buffered = 0;
        self.examined = 0;
        core::mem::take(&mut self.segments)
    }
}

/// 在锁外唤醒，避免被唤醒方立即争抢同一把锁。
pub(crate) fn wake(waker: Option<Waker>) {
    if let Some(waker) = waker {
        waker.wake();
    }
}
