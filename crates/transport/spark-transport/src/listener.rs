use core::future::Future;

use crate::TransportSocketAddr;

/// 统一的传输监听器接口。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“绑定 → 后台接受 → 解绑”这一监听生命周期收敛到一个 trait，宿主可以在不同传输实现间切换；
/// - 接受到的连接不经由 trait 返回，而是交给 [`ConnectionDispatcher`](crate::ConnectionDispatcher)，
///   因此监听器自身不会因单条连接的生命周期而阻塞。
///
/// ## 契约说明（What）
/// - `bind`：同步完成套接字创建与绑定，启动后台接受循环后立即返回实际绑定地址（端口 `0` 已被解析）；
/// - `unbind`：停止接受新连接并等待接受循环退出；已建立的连接不受影响；
/// - `stop`：在 `unbind` 的基础上等待所有活跃连接关闭；
/// - `local_addr`：未绑定时返回 `None`。
///
/// ## 风险提示（Trade-offs）
/// - `bind` 需要在异步运行时上下文中调用，以便实现派生后台任务；
/// - 重复 `bind` 应返回错误而不是静默重绑。
pub trait TransportListener: Send + 'static {
    /// 错误类型。
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// 解绑的 Future 类型。
    type UnbindFuture<'a>: Future<Output = Result<(), Self::Error>> + Send + 'a
    where
        Self: 'a;

    /// 停止的 Future 类型。
    type StopFuture<'a>: Future<Output = Result<(), Self::Error>> + Send + 'a
    where
        Self: 'a;

    /// 返回协议标识（例如 `"tcp"`）。
    fn scheme(&self) -> &'static str;

    /// 查询监听器实际绑定的地址。
    fn local_addr(&self) -> Option<TransportSocketAddr>;

    /// 绑定并启动接受循环。
    fn bind(&mut self) -> Result<TransportSocketAddr, Self::Error>;

    /// 停止接受新连接。
    fn unbind(&mut self) -> Self::UnbindFuture<'_>;

    /// 解绑并等待所有连接结束。
    fn stop(&mut self) -> Self::StopFuture<'_>;
}
