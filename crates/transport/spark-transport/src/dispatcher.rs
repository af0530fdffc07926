/// 连接分发契约：监听器每接受一条连接就调用一次 `on_connection`。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让传输层与协议层解耦：传输只负责产出连接，协议层（HTTP、自定义帧协议等）在回调中接管字节流；
/// - 回调为同步签名，迫使实现方把耗时逻辑派生到独立任务中，保证接受循环永不因单条连接阻塞。
///
/// ## 契约（What）
/// - `connection`：所有权完全移交给回调；
/// - **前置条件**：实现必须快速返回，不得在回调内等待连接生命周期结束；
/// - **后置条件**：连接的清理由连接自身的收发循环负责，与回调是否持有连接无关。
pub trait ConnectionDispatcher<C>: Send + Sync + 'static {
    /// 处理一条新连接。
    fn on_connection(&self, connection: C);
}

impl<C, F> ConnectionDispatcher<C> for F
where
    F: Fn(C) + Send + Sync + 'static,
{
    fn on_connection(&self, connection: C) {
        (self)(connection)
    }
}
