#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![doc = "spark-transport: 传输层契约接口统一抽象层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：为 sockets 等传输实现提供共同语言，使上层协议只面向地址、监听器与连接分发契约编程。"]
#![doc = "- **What**：定义 `TransportSocketAddr`、`ShutdownDirection`、`TransportListener` 与 `ConnectionDispatcher`。"]
#![doc = "- **How**：契约层不依赖任何运行时；`std` 特性仅用于与 `std::net` 地址互转。"]

extern crate alloc;

pub mod addr;
pub mod dispatcher;
pub mod listener;
pub mod shutdown;

pub use addr::TransportSocketAddr;
pub use dispatcher::ConnectionDispatcher;
pub use listener::TransportListener;
pub use shutdown::ShutdownDirection;
