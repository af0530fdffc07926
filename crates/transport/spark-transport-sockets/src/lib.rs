#![deny(unsafe_code)]
#![doc = "spark-transport-sockets: 基于原始套接字的接受、接收与发送循环。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：协议层只面向两条字节管道编程；套接字读写、背压、连接终止协调全部在本 crate 内收敛。"]
#![doc = "- **What**：提供 `SocketTransport`（绑定、接受、解绑）、`SocketConnection`（收发循环与管道）、"]
#![doc = "  `Receiver`/`Sender`（单次收发操作）以及 `SocketAwaitable`（一次性完成原语）。"]
#![doc = "- **How**：收发操作以反应器就绪回调推进，并通过 `SocketAwaitable` 把结果交给等待中的循环；"]
#![doc = "  连接关闭原因以管道完成错误的形式传给协议层。"]
#![doc = ""]
#![doc = "== 并发模型 =="]
#![doc = "- 每条连接占用两个 Tokio 任务：接收循环写入站管道，发送循环读出站管道；"]
#![doc = "- 接受循环独占一个任务，新连接通过 `ConnectionDispatcher` 同步交给宿主；"]
#![doc = "- `--cfg spark_loom` 下完成原语改用 Loom 原子类型，供 `tests/loom_awaitable.rs` 做模型检查。"]

mod awaitable;
mod connection;
mod error;
mod options;
mod receiver;
mod sender;
mod socket;
mod sync;
mod trace;
mod tracker;
mod transport;

pub use awaitable::SocketAwaitable;
pub use connection::{ConnectionHandle, ConnectionState, SocketConnection};
pub use error::{OperationKind, TransportError, is_connection_abort, is_connection_reset};
pub use options::SocketTransportOptions;
pub use receiver::{Receive, Receiver, WaitForData};
pub use sender::{MAX_IOVECS, SendFuture, Sender};
pub use trace::{SocketsTrace, keys};
pub use transport::SocketTransport;
