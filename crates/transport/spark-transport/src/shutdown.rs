/// 半关闭/全关闭方向。
///
/// # 契约（What）
/// - `Read`：停止接收，对端后续数据被丢弃；
/// - `Write`：发送 FIN，本端不再写入；
/// - `Both`：等价于 `SHUT_RDWR`，会让阻塞中的收发操作尽快返回。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

impl ShutdownDirection {
    /// 是否包含写方向（即会向对端发送 FIN）。
    pub const fn includes_write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

#[cfg(feature = "std")]
impl From<ShutdownDirection> for std::net::Shutdown {
    fn from(direction: ShutdownDirection) -> Self {
        match direction {
            ShutdownDirection::Read => std::net::Shutdown::Read,
            ShutdownDirection::Write => std::net::Shutdown::Write,
            ShutdownDirection::Both => std::net::Shutdown::Both,
        }
    }
}
