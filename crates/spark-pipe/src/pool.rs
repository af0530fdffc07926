use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use spin::Mutex;

/// 默认块大小，与常见页大小对齐。
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// 自由链表最多保留的块数量，超出部分直接归还给分配器。
const MAX_RETAINED_BLOCKS: usize = 1024;

/// `SlabMemoryPool` 为管道段提供固定块大小的 `BytesMut` 复用。
///
/// # 模块角色（Why）
/// - 每条连接的接收循环都会反复向入站管道申请至少 `min_allocation_size` 的可写区域，
///   若每次都向系统申请内存，会在高连接数下放大分配抖动；
/// - 池由传输实例持有并在所有连接间共享，管道的读端在消费完整段后把内存交还给池。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，`rent` 优先复用容量足够的块；
/// - 段在冻结为 `Bytes` 后，`reclaim` 通过 `Bytes::try_into_mut` 尝试夺回唯一所有权，
///   失败（仍有别名）时直接丢弃，不影响正确性；
/// - `PoolMetrics` 以原子计数追踪分配、可用字节与在途租约，供 `statistics` 快照。
///
/// # 契约说明（What）
/// - **线程安全**：`Clone` 得到的句柄共享同一自由链表，满足 `Send + Sync`；
/// - **后置条件**：`rent(n)` 返回的缓冲 `len() == 0` 且 `capacity() >= max(n, block_size)`。
///
/// # 设计权衡（Trade-offs）
/// - 仅回收容量不小于块大小的缓冲，被拆分过的小尾巴直接释放，避免链表碎片化；
/// - 自旋锁临界区只做 `Vec` 的 push/pop，竞争窗口极短。
#[derive(Clone)]
pub struct SlabMemoryPool {
    inner: Arc<PoolInner>,
}

impl Default for SlabMemoryPool {
    fn default() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }
}

impl core::fmt::Debug for SlabMemoryPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlabMemoryPool")
            .field("block_size", &self.inner.block_size)
            .field("stats", &self.statistics())
            .finish()
    }
}

impl SlabMemoryPool {
    /// 创建默认块大小的空池。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定块大小创建空池；`block_size` 为 0 时退化为默认值。
    pub fn with_block_size(block_size: usize) -> Self {
        let block_size = if block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            block_size
        };
        Self {
            inner: Arc::new(PoolInner::new(block_size)),
        }
    }

    /// 返回池的块大小。
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// 租借一个至少 `min_capacity` 字节的空缓冲。
    pub fn rent(&self, min_capacity: usize) -> BytesMut {
        self.inner.acquire_buffer(min_capacity)
    }

    /// 归还一个仍处于可写状态的缓冲。
    pub fn give_back(&self, buffer: BytesMut) {
        self.inner.release_buffer(buffer);
    }

    /// 尝试回收已冻结的段；段仍被其他视图引用时静默放弃。
    pub fn reclaim(&self, segment: Bytes) {
        match segment.try_into_mut() {
            Ok(buffer) => self.inner.release_buffer(buffer),
            Err(_) => self.inner.metrics.decrease_active_leases(),
        }
    }

    /// 清空自由链表，返回释放的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 读取池统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 累计向分配器申请的字节数（扣除已收缩部分）。
    pub allocated_bytes: usize,
    /// 自由链表中可立即复用的字节数。
    pub available_bytes: usize,
    /// 尚未归还的租约数量。
    pub active_leases: usize,
    /// 自由链表中的块数量。
    pub free_blocks: usize,
}

struct PoolInner {
    block_size: usize,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            free_list: Mutex::new(Vec::new()),
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足容量的 `BytesMut`。
    fn acquire_buffer(&self, min_capacity: usize) -> BytesMut {
        let wanted = min_capacity.max(self.block_size);
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= wanted)
                .map(|index| list.swap_remove(index))
        };

        let mut buffer = match reused {
            Some(buf) => {
                self.metrics.decrease_available(buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(wanted);
                self.metrics.increase_on_new_allocation(buf.capacity());
                buf
            }
        };
        buffer.clear();
        self.metrics.increase_active_leases();
        buffer
    }

    fn release_buffer(&self, mut buffer: BytesMut) {
        self.metrics.decrease_active_leases();
        buffer.clear();
        let capacity = buffer.capacity();
        if capacity < self.block_size {
            self.metrics.decrease_on_loss(capacity);
            return;
        }
        let mut list = self.free_list.lock();
        if list.len() >= MAX_RETAINED_BLOCKS {
            drop(list);
            self.metrics.decrease_on_loss(capacity);
            return;
        }
        list.push(buffer);
        self.metrics.increase_available(capacity);
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        self.metrics.decrease_available(reclaimed);
        self.metrics.decrease_on_loss(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_blocks = self.free_list.lock().len();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            free_blocks,
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_loss(&self, capacity: usize) {
        saturating_sub(&self.allocated_bytes, capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn rent_honours_block_size() {
        let pool = SlabMemoryPool::with_block_size(256);
        let small = pool.rent(16);
        assert!(small.capacity() >= 256);
        assert!(small.is_empty());
        let large = pool.rent(1024);
        assert!(large.capacity() >= 1024);
        assert_eq!(pool.statistics().active_leases, 2);
    }

    #[test]
    fn give_back_makes_block_reusable() {
        let pool = SlabMemoryPool::with_block_size(128);
        let mut buffer = pool.rent(128);
        buffer.put_slice(b"hello");
        pool.give_back(buffer);
        let stats = pool.statistics();
        assert_eq!(stats.free_blocks, 1);
        assert!(stats.available_bytes >= 128);

        let reused = pool.rent(64);
        assert!(reused.is_empty(), "复用块必须被清空");
        assert_eq!(pool.statistics().free_blocks, 0);
    }

    #[test]
    fn reclaim_of_aliased_segment_is_ignored() {
        let pool = SlabMemoryPool::with_block_size(64);
        let mut buffer = pool.rent(64);
        buffer.put_slice(&[7u8; 32]);
        let frozen = buffer.freeze();
        let alias = frozen.clone();
        pool.reclaim(frozen);
        assert_eq!(pool.statistics().free_blocks, 0);
        assert_eq!(alias.len(), 32);
    }
}
