use std::time::Duration;

use serde::Deserialize;
use socket2::SockRef;
use spark_pipe::{PipeOptions, SlabMemoryPool};
use tokio::net::TcpStream;

use crate::error::{CONFIGURE, TransportError, map_io_error};

const DEFAULT_BACKLOG: u32 = 512;
const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;
const DEFAULT_MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_MIN_ALLOCATION_SIZE: usize = 2048;

/// 套接字传输的运行参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“监听队列长度”“入站/出站管道的背压阈值”“每次接收至少申请多少内存”等旋钮集中到一处，
///   既能在代码中以 Builder 风格配置，也能从 TOML 配置文件直接加载；
/// - 套接字级选项（`TCP_NODELAY`、`SO_LINGER`）在接受或建连后立即落地，保证同一传输实例下的连接行为一致。
///
/// ## 契约（What）
/// - `no_delay`：是否关闭 Nagle 算法，默认 `true`；
/// - `backlog`：监听队列长度，默认 512；
/// - `max_read_buffer_size`：入站管道暂停阈值，`None` 表示不限，默认 1 MiB；
/// - `max_write_buffer_size`：出站管道暂停阈值，默认 64 KiB；
/// - `wait_for_data_before_allocating_buffer`：接收前先做零字节等待，空闲连接不占用缓冲，默认 `true`；
/// - `min_allocation_size`：每次接收向管道申请的最小内存，默认 2048 字节；
/// - `linger`：`SO_LINGER` 超时，`None` 沿用内核默认。
///
/// ## 注意事项（Trade-offs）
/// - TOML 中 `linger_ms` 以毫秒表达，`max_*_buffer_size = 0` 视为不限；
/// - 恢复阈值固定为暂停阈值的一半，与管道默认策略一致。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketTransportOptions {
    no_delay: bool,
    backlog: u32,
    max_read_buffer_size: Option<usize>,
    max_write_buffer_size: Option<usize>,
    wait_for_data_before_allocating_buffer: bool,
    min_allocation_size: usize,
    #[serde(rename = "linger_ms", with = "linger_millis")]
    linger: Option<Duration>,
}

impl Default for SocketTransportOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            backlog: DEFAULT_BACKLOG,
            max_read_buffer_size: Some(DEFAULT_MAX_READ_BUFFER_SIZE),
            max_write_buffer_size: Some(DEFAULT_MAX_WRITE_BUFFER_SIZE),
            wait_for_data_before_allocating_buffer: true,
            min_allocation_size: DEFAULT_MIN_ALLOCATION_SIZE,
            linger: None,
        }
    }
}

impl SocketTransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本加载；缺省字段取默认值。
    pub fn from_toml_str(source: &str) -> Result<Self, TransportError> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    pub fn with_max_read_buffer_size(mut self, size: Option<usize>) -> Self {
        self.max_read_buffer_size = size;
        self
    }

    pub fn with_max_write_buffer_size(mut self, size: Option<usize>) -> Self {
        self.max_write_buffer_size = size;
        self
    }

    pub fn with_wait_for_data_before_allocating_buffer(mut self, enabled: bool) -> Self {
        self.wait_for_data_before_allocating_buffer = enabled;
        self
    }

    pub fn with_min_allocation_size(mut self, size: usize) -> Self {
        self.min_allocation_size = size.max(1);
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn max_read_buffer_size(&self) -> Option<usize> {
        self.max_read_buffer_size
    }

    pub fn max_write_buffer_size(&self) -> Option<usize> {
        self.max_write_buffer_size
    }

    pub fn wait_for_data_before_allocating_buffer(&self) -> bool {
        self.wait_for_data_before_allocating_buffer
    }

    pub fn min_allocation_size(&self) -> usize {
        self.min_allocation_size
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    /// 入站管道：接收循环写、协议层读。
    pub(crate) fn input_pipe_options(&self, pool: &SlabMemoryPool) -> PipeOptions {
        PipeOptions::new()
            .with_pause_writer_threshold(self.max_read_buffer_size)
            .with_minimum_segment_size(self.min_allocation_size)
            .with_pool(pool.clone())
    }

    /// 出站管道：协议层写、发送循环读。
    pub(crate) fn output_pipe_options(&self, pool: &SlabMemoryPool) -> PipeOptions {
        PipeOptions::new()
            .with_pause_writer_threshold(self.max_write_buffer_size)
            .with_minimum_segment_size(self.min_allocation_size)
            .with_pool(pool.clone())
    }

    /// 把套接字级选项写入新连接。
    pub(crate) fn apply(&self, stream: &TcpStream) -> Result<(), TransportError> {
        stream
            .set_nodelay(self.no_delay)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        if self.linger.is_some() {
            SockRef::from(stream)
                .set_linger(self.linger)
                .map_err(|err| map_io_error(CONFIGURE, err))?;
        }
        Ok(())
    }
}

mod linger_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
