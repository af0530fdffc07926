use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use spark_pipe::SlabMemoryPool;
use spark_transport::{ConnectionDispatcher, TransportListener, TransportSocketAddr};
use tokio::{net::TcpListener, sync::Notify, task::JoinHandle};

use crate::{
    connection::{ConnectionContext, SocketConnection},
    error::{LISTEN, TransportError, is_connection_reset, map_io_error, socket_disposed_error},
    options::SocketTransportOptions,
    trace::SocketsTrace,
    tracker::ConnectionTracker,
};

type ListenSlot = Arc<Mutex<Option<Arc<ListenSocket>>>>;

/// 监听套接字及其释放信号。
///
/// Tokio 的 `accept` 不会因为其它任务持有同一监听器而被打断，释放时通过 [`Notify`] 让接受循环退出挂起。
struct ListenSocket {
    listener: TcpListener,
    disposed: AtomicBool,
    notify: Notify,
}

impl ListenSocket {
    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }
}

/// 基于原始套接字的传输监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 负责“创建监听套接字 → 持续接受 → 包装为 [`SocketConnection`] → 交给分发回调”这条流水线；
/// - 连接一旦交出便与监听器脱钩，解绑只停止接受新连接，存量连接继续运行。
///
/// ## 核心机制（How）
/// - 使用 `socket2` 手工创建套接字：IPv6 任意地址关闭 `IPV6_V6ONLY` 以同时接收 IPv4 映射连接，
///   Unix 平台开启 `SO_REUSEADDR` 以便解绑后立即在同一端口重绑；
/// - 监听套接字放在共享槽位中，接受循环与 `unbind` 共同引用；
/// - `unbind` 先清空槽位、再释放套接字，接受循环据“槽位已空”判定随后出现的错误属于预期，静默退出。
///
/// ## 契约（What）
/// - `bind` 成功后 [`SocketTransport::local_addr`] 返回实际地址，端口 `0` 已被解析为内核分配的端口；
/// - 地址冲突返回 [`TransportError::AddressInUse`]，其余绑定失败返回 [`TransportError::Bind`]；
/// - 重复 `bind` 返回 [`TransportError::AlreadyBound`]，未绑定时 `unbind` 返回 [`TransportError::NotBound`]；
/// - 接受到的每条连接都已写入 `no_delay` 与 `linger` 选项。
///
/// ## 注意事项（Trade-offs）
/// - `bind` 为同步调用，但必须位于 Tokio 运行时上下文中，以便注册监听器并派生接受循环；
/// - 分发回调在接受循环上同步执行，耗时处理必须自行派生任务。
pub struct SocketTransport<D> {
    endpoint: TransportSocketAddr,
    options: SocketTransportOptions,
    dispatcher: Arc<D>,
    trace: SocketsTrace,
    pool: SlabMemoryPool,
    tracker: ConnectionTracker,
    listen_socket: ListenSlot,
    accept_task: Option<JoinHandle<Result<(), TransportError>>>,
    local_addr: Option<TransportSocketAddr>,
}

impl<D> SocketTransport<D>
where
    D: ConnectionDispatcher<SocketConnection>,
{
    pub fn new(endpoint: TransportSocketAddr, options: SocketTransportOptions, dispatcher: D) -> Self {
        Self {
            endpoint,
            options,
            dispatcher: Arc::new(dispatcher),
            trace: SocketsTrace::default(),
            pool: SlabMemoryPool::new(),
            tracker: ConnectionTracker::new(),
            listen_socket: Arc::new(Mutex::new(None)),
            accept_task: None,
            local_addr: None,
        }
    }

    /// 替换日志标签，同一进程内多个传输实例可据此区分。
    pub fn with_trace(mut self, trace: SocketsTrace) -> Self {
        self.trace = trace;
        self
    }

    pub fn endpoint(&self) -> TransportSocketAddr {
        self.endpoint
    }

    pub fn options(&self) -> &SocketTransportOptions {
        &self.options
    }

    /// 实际绑定地址；未绑定时为 `None`。
    pub fn local_addr(&self) -> Option<TransportSocketAddr> {
        self.local_addr
    }

    pub fn is_bound(&self) -> bool {
        self.accept_task.is_some()
    }

    /// 仍未关闭的已接受连接数。
    pub fn active_connections(&self) -> usize {
        self.tracker.active()
    }

    /// 等待所有已接受的连接关闭。
    pub async fn wait_for_idle(&self) {
        self.tracker.wait_for_idle().await
    }

    /// 创建监听套接字并启动接受循环，返回实际绑定地址。
    pub fn bind(&mut self) -> Result<TransportSocketAddr, TransportError> {
        if let Some(addr) = self.local_addr.filter(|_| self.is_bound()) {
            return Err(TransportError::AlreadyBound { addr });
        }

        let listener = create_listener(self.endpoint, self.options.backlog())?;
        let local_addr = listener
            .local_addr()
            .map(TransportSocketAddr::from)
            .map_err(|err| map_io_error(LISTEN, err))?;

        let listen_socket = Arc::new(ListenSocket {
            listener,
            disposed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        *self.listen_socket.lock() = Some(Arc::clone(&listen_socket));

        let context = ConnectionContext {
            options: self.options.clone(),
            pool: self.pool.clone(),
            trace: self.trace.clone(),
            tracker: Some(self.tracker.clone()),
        };
        self.accept_task = Some(tokio::spawn(accept_loop(
            listen_socket,
            Arc::clone(&self.listen_socket),
            context,
            Arc::clone(&self.dispatcher),
        )));
        self.local_addr = Some(local_addr);
        self.trace.listener_bound(local_addr);
        Ok(local_addr)
    }

    /// 停止接受新连接并等待接受循环退出。
    ///
    /// 返回接受循环自身遇到的致命错误（若有）；已建立的连接不受影响。
    pub async fn unbind(&mut self) -> Result<(), TransportError> {
        let task = self.accept_task.take().ok_or(TransportError::NotBound)?;
        if let Some(listen_socket) = self.listen_socket.lock().take() {
            listen_socket.dispose();
        }
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(TransportError::Accept {
                source: io::Error::other(join_error.to_string()),
            }),
        };
        if let Some(addr) = self.local_addr.take() {
            self.trace.listener_unbound(addr);
        }
        result
    }

    /// 解绑（若仍绑定）并等待所有已接受连接关闭。
    pub async fn stop(&mut self) -> Result<(), TransportError> {
        let result = if self.is_bound() {
            self.unbind().await
        } else {
            Ok(())
        };
        self.tracker.wait_for_idle().await;
        result
    }
}

impl<D> Drop for SocketTransport<D> {
    fn drop(&mut self) {
        if let Some(listen_socket) = self.listen_socket.lock().take() {
            listen_socket.dispose();
        }
    }
}

impl<D> std::fmt::Debug for SocketTransport<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("endpoint", &self.endpoint)
            .field("local_addr", &self.local_addr)
            .field("active_connections", &self.tracker.active())
            .finish()
    }
}

impl<D> TransportListener for SocketTransport<D>
where
    D: ConnectionDispatcher<SocketConnection>,
{
    type Error = TransportError;
    type UnbindFuture<'a>
        = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>
    where
        Self: 'a;
    type StopFuture<'a>
        = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>
    where
        Self: 'a;

    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        SocketTransport::local_addr(self)
    }

    fn bind(&mut self) -> Result<TransportSocketAddr, TransportError> {
        SocketTransport::bind(self)
    }

    fn unbind(&mut self) -> Self::UnbindFuture<'_> {
        Box::pin(SocketTransport::unbind(self))
    }

    fn stop(&mut self) -> Self::StopFuture<'_> {
        Box::pin(SocketTransport::stop(self))
    }
}

/// 按端点地址族创建、绑定并开始监听。
fn create_listener(endpoint: TransportSocketAddr, backlog: u32) -> Result<TcpListener, TransportError> {
    let addr = SocketAddr::from(endpoint);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| TransportError::Bind { addr: endpoint, source })?;

    if let SocketAddr::V6(v6) = addr
        && v6.ip().is_unspecified()
    {
        socket
            .set_only_v6(false)
            .map_err(|source| TransportError::Bind { addr: endpoint, source })?;
    }
    #[cfg(unix)]
    socket
        .set_reuse_address(true)
        .map_err(|source| TransportError::Bind { addr: endpoint, source })?;

    socket.bind(&addr.into()).map_err(|source| bind_error(endpoint, source))?;
    socket
        .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
        .map_err(|source| match source.kind() {
            io::ErrorKind::AddrInUse => TransportError::AddressInUse {
                addr: endpoint,
                source,
            },
            _ => map_io_error(LISTEN, source),
        })?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(LISTEN, err))?;

    TcpListener::from_std(socket.into()).map_err(|err| map_io_error(LISTEN, err))
}

fn bind_error(addr: TransportSocketAddr, source: io::Error) -> TransportError {
    if source.kind() == io::ErrorKind::AddrInUse {
        TransportError::AddressInUse { addr, source }
    } else {
        TransportError::Bind { addr, source }
    }
}

/// 槽位已被 `unbind` 清空时，接受错误属于预期。
fn is_unbound(slot: &ListenSlot) -> bool {
    slot.lock().is_none()
}

/// 排队中的连接在被接受前已失效：对端重置，或 `accept` 报告 `ECONNABORTED`。
fn is_queued_connection_lost(error: &io::Error) -> bool {
    is_connection_reset(error) || error.kind() == io::ErrorKind::ConnectionAborted
}

/// 接受循环：持续接受连接并交给分发回调，直到监听套接字被释放或遇到致命错误。
async fn accept_loop<D>(
    listen_socket: Arc<ListenSocket>,
    slot: ListenSlot,
    context: ConnectionContext,
    dispatcher: Arc<D>,
) -> Result<(), TransportError>
where
    D: ConnectionDispatcher<SocketConnection>,
{
    loop {
        let accepted = tokio::select! {
            biased;
            _ = listen_socket.notify.notified() => Err(socket_disposed_error()),
            accepted = listen_socket.listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(_) if is_unbound(&slot) => return Ok(()),
            Err(source) if is_queued_connection_lost(&source) => {
                // 连接在排队期间被对端重置或中止，不影响后续接受。
                let error = TransportError::ConnectionReset {
                    source: Some(source),
                };
                context.trace.accept_error(&error);
                continue;
            }
            Err(source) => {
                let error = TransportError::Accept { source };
                context.trace.accept_error(&error);
                return Err(error);
            }
        };

        if let Err(error) = context.options.apply(&stream) {
            context.trace.accept_error(&error);
            continue;
        }
        match SocketConnection::start(stream, &context) {
            Ok(connection) => {
                context
                    .trace
                    .connection_accepted(connection.connection_id(), connection.remote_addr());
                dispatcher.on_connection(connection);
            }
            Err(error) => context.trace.accept_error(&error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    fn loopback_any_port() -> TransportSocketAddr {
        TransportSocketAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
    }

    #[test]
    fn aborted_queued_connection_does_not_end_accept_loop() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            assert!(is_queued_connection_lost(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_queued_connection_lost(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[tokio::test]
    async fn listener_resolves_ephemeral_port() {
        let listener = create_listener(loopback_any_port(), 512).expect("listen");
        let local = listener.local_addr().expect("local addr");
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn ipv6_any_accepts_ipv4_clients() {
        let endpoint = TransportSocketAddr::from(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::UNSPECIFIED,
            0,
            0,
            0,
        )));
        // 部分 CI 环境未启用 IPv6。
        let Ok(listener) = create_listener(endpoint, 16) else {
            return;
        };
        let port = listener.local_addr().expect("local addr").port();
        let client = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port));
        let (connected, accepted) = tokio::join!(client, listener.accept());
        connected.expect("ipv4 client connects to dual-stack listener");
        accepted.expect("dual-stack listener accepts ipv4 client");
    }

    #[test]
    fn bind_error_distinguishes_address_in_use() {
        let addr = loopback_any_port();
        let in_use = bind_error(addr, io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(in_use, TransportError::AddressInUse { .. }));
        let denied = bind_error(addr, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, TransportError::Bind { .. }));
    }
}
