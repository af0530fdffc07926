use std::{
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use socket2::SockRef;
use spark_transport::ShutdownDirection;
use tokio::net::TcpStream;

/// 套接字释放时需要被通知的挂起操作。
///
/// 接收与发送操作在登记后以弱引用保存，释放时逐个唤醒，使其以“套接字已释放”错误完成。
pub(crate) trait DisposeWatcher: Send + Sync {
    fn socket_disposed(self: Arc<Self>);
}

/// 一条已建立 TCP 连接的共享句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接收循环、发送循环与 `abort` 调用方需要共同引用同一个套接字，而释放必须恰好发生一次；
/// - 释放是 I/O 路径上唯一的取消原语：它让挂起中的收发尽快以中止类错误返回。
///
/// ## 核心机制（How）
/// - `TcpStream` 以 `&self` 提供 `try_read`/`try_write` 与就绪轮询，因此句柄只需 `Arc` 共享，无需互斥；
/// - `dispose` 以 `AtomicBool::swap` 保证幂等，随后对套接字执行 `shutdown(Both)`，
///   并通知所有登记的 [`DisposeWatcher`]；
/// - 文件描述符在最后一个 `Arc` 释放时关闭。
///
/// ## 契约（What）
/// - `dispose` 返回 `true` 表示本次调用完成了释放，之后的调用返回 `false` 且无副作用；
/// - `shutdown` 的错误（例如对端已断开导致的 `ENOTCONN`）被视为无害并吞掉。
pub(crate) struct SocketHandle {
    stream: TcpStream,
    disposed: AtomicBool,
    watchers: Mutex<Vec<Weak<dyn DisposeWatcher>>>,
}

impl SocketHandle {
    pub(crate) fn new(stream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            stream,
            disposed: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn watch(&self, watcher: Weak<dyn DisposeWatcher>) {
        self.watchers.lock().push(watcher);
    }

    /// 对套接字执行半关闭或全关闭。
    pub(crate) fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(direction.into())
    }

    /// 幂等释放套接字。
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.shutdown(ShutdownDirection::Both);
        let watchers = std::mem::take(&mut *self.watchers.lock());
        for watcher in watchers {
            if let Some(watcher) = watcher.upgrade() {
                watcher.socket_disposed();
            }
        }
        true
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("stream", &self.stream)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
