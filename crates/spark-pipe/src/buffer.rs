use alloc::vec::Vec;

use bytes::{Bytes, BytesMut};

/// 一次读取返回的只读段序列。
///
/// # 契约（What）
/// - 段按写入顺序排列，拼接后即为当前未消费的全部已提交字节；
/// - 段是共享视图（`Bytes`），克隆与持有不会复制数据；
/// - 多段时意味着数据在内存中不连续，发送方可据此选择分散/聚集写。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadBuffer {
    segments: Vec<Bytes>,
    len: usize,
}

impl ReadBuffer {
    pub(crate) fn from_segments(segments: Vec<Bytes>) -> Self {
        let len = segments.iter().map(Bytes::len).sum();
        Self { segments, len }
    }

    /// 字节总数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 是否只有一个连续段。
    pub fn is_single_segment(&self) -> bool {
        self.segments.len() <= 1
    }

    /// 段视图。
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// 第一个段；空缓冲返回空切片。
    pub fn first(&self) -> &[u8] {
        self.segments.first().map(|seg| &seg[..]).unwrap_or(&[])
    }

    /// 复制为连续字节，主要供测试与调试使用。
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut joined = BytesMut::with_capacity(self.len);
                for segment in many {
                    joined.extend_from_slice(segment);
                }
                joined.freeze()
            }
        }
    }
}
