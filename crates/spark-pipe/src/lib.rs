//! `spark-pipe` 提供连接两端之间的单生产者/单消费者字节管道，以及支撑管道段的 slab 内存池。
//!
//! # 模块定位（Why）
//! - 传输层的接收循环把套接字数据写入“入站管道”，协议层从中读取；协议层把响应写入“出站管道”，
//!   发送循环从中取出并写回套接字。两条管道的背压决定了连接在慢消费者面前如何暂停；
//! - 管道完成时携带的错误是传输失败向协议层传播的唯一通道。
//!
//! # 设计概要（How）
//! - [`pipe`] 返回一对 [`PipeWriter`]/[`PipeReader`]，共享状态由 `parking_lot::Mutex` 保护，
//!   读写两端分别登记自己的 `Waker`；
//! - 写端在 `flush` 时把未提交段移交给读端，并在未消费字节超过 `pause_writer_threshold` 时挂起，
//!   直至读端消费到 `resume_writer_threshold` 以下；
//! - [`SlabMemoryPool`] 为 `get_memory` 提供块复用，读端消费完整段后尝试归还。
//!
//! # 命名约定（Consistency）
//! - `advance`/`advance_to`/`flush`/`complete` 与常见管道抽象保持一致，便于协议层移植。

extern crate alloc;

mod buffer;
mod error;
mod pipe;
mod pool;
mod reader;
mod writer;

pub use buffer::ReadBuffer;
pub use error::PipeError;
pub use pipe::{PipeOptions, pipe};
pub use pool::{DEFAULT_BLOCK_SIZE, PoolStats, SlabMemoryPool};
pub use reader::{PipeReader, Read, ReadCanceler, ReadResult};
pub use writer::{Flush, FlushResult, PipeWriter};
