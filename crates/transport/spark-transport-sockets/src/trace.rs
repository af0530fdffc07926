use std::sync::Arc;

use spark_transport::TransportSocketAddr;

use crate::error::TransportError;

/// 传输层日志使用的字段键名。
///
/// `tracing` 宏要求字段名为字面量，此处常量作为键名的单一事实来源，供文档与测试断言引用。
pub mod keys {
    /// 传输实例标签。
    pub const FIELD_TRANSPORT: &str = "transport";
    /// 连接标识。
    pub const FIELD_CONNECTION_ID: &str = "connection.id";
    /// 对端地址。
    pub const FIELD_REMOTE_ADDR: &str = "connection.remote";
    /// 监听地址。
    pub const FIELD_LOCAL_ADDR: &str = "listener.local";
    /// 稳定错误码。
    pub const FIELD_ERROR_CODE: &str = "error.code";
}

const TARGET: &str = "spark::transport::sockets";

/// `SocketsTrace` 是套接字传输的结构化日志协作者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 收发循环的每个终止分支（FIN、重置、错误）与背压切换都需要留下可检索的事件，
///   便于排查“连接为何关闭”“为何吞吐骤降”；
/// - 以一个可克隆的小对象承载事件方法，连接与接受循环共享同一标签，调用点保持一行。
///
/// ## 契约（What）
/// - 生命周期事件（FIN、暂停/恢复、接受、关闭）为 `debug` 级别；绑定与解绑为 `info`；
///   重置为 `debug`，其余错误为 `warn`；
/// - 所有事件携带 `transport` 标签，连接事件额外携带 `connection.id`。
#[derive(Clone, Debug)]
pub struct SocketsTrace {
    name: Arc<str>,
}

impl Default for SocketsTrace {
    fn default() -> Self {
        Self::new("sockets")
    }
}

impl SocketsTrace {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener_bound(&self, local: TransportSocketAddr) {
        tracing::info!(target: TARGET, transport = %self.name, listener.local = %local, "listener bound");
    }

    pub fn listener_unbound(&self, local: TransportSocketAddr) {
        tracing::info!(target: TARGET, transport = %self.name, listener.local = %local, "listener unbound");
    }

    pub fn accept_error(&self, error: &TransportError) {
        tracing::warn!(
            target: TARGET,
            transport = %self.name,
            error.code = error.code(),
            error = %error,
            "accept loop failed"
        );
    }

    pub fn connection_accepted(&self, connection_id: &str, remote: TransportSocketAddr) {
        tracing::debug!(
            target: TARGET,
            transport = %self.name,
            connection.id = connection_id,
            connection.remote = %remote,
            "connection accepted"
        );
    }

    pub fn connection_read_fin(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection received FIN");
    }

    pub fn connection_write_fin(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection sent FIN");
    }

    pub fn connection_reset(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection reset");
    }

    pub fn connection_error(&self, connection_id: &str, error: &TransportError) {
        tracing::warn!(
            target: TARGET,
            transport = %self.name,
            connection.id = connection_id,
            error.code = error.code(),
            error = %error,
            "connection error"
        );
    }

    pub fn connection_pause(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection paused");
    }

    pub fn connection_resume(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection resumed");
    }

    pub fn connection_aborted(&self, connection_id: &str, reason: &str) {
        tracing::debug!(
            target: TARGET,
            transport = %self.name,
            connection.id = connection_id,
            reason,
            "connection aborted"
        );
    }

    pub fn connection_closed(&self, connection_id: &str) {
        tracing::debug!(target: TARGET, transport = %self.name, connection.id = connection_id, "connection closed");
    }
}
