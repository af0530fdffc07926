use alloc::{format, string::String, vec::Vec};
use core::fmt;

/// `TransportSocketAddr` 为监听端点与连接两端提供统一的 Socket 地址表达。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 监听器绑定、连接建立与日志字段都需要同一份地址描述，避免各处直接依赖 `std::net::SocketAddr`；
/// - 端口 `0` 代表“由内核分配临时端口”，绑定完成后监听器会以 [`TransportSocketAddr::with_port`]
///   回填真实端口，调用方据此获取可连接地址。
///
/// ## 合同（What）
/// - `V4` 与 `V6` 分别表示 IPv4/IPv6，端口为主机序 `u16`；
/// - `Display` 输出 `a.b.c.d:port` 或 `[v6]:port`，可直接用于日志字段；
/// - **后置条件**：所有方法均不修改原值，`with_port` 返回新实例。
///
/// ## 设计权衡（Trade-offs）
/// - IPv6 显示未做零压缩，保持与日志解析脚本的稳定格式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum TransportSocketAddr {
    /// IPv4 地址。
    V4 { addr: [u8; 4], port: u16 },
    /// IPv6 地址。
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    /// IPv4 任意地址 `0.0.0.0:port`。
    pub const fn ipv4_any(port: u16) -> Self {
        Self::V4 {
            addr: [0; 4],
            port,
        }
    }

    /// IPv6 任意地址 `[::]:port`；sockets 实现会在该地址上开启双栈监听。
    pub const fn ipv6_any(port: u16) -> Self {
        Self::V6 {
            addr: [0; 8],
            port,
        }
    }

    /// IPv4 回环地址 `127.0.0.1:port`。
    pub const fn loopback_v4(port: u16) -> Self {
        Self::V4 {
            addr: [127, 0, 0, 1],
            port,
        }
    }

    /// 返回端口号。
    pub const fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    /// 以新端口构造地址，常用于回填内核分配的临时端口。
    pub const fn with_port(self, port: u16) -> Self {
        match self {
            Self::V4 { addr, .. } => Self::V4 { addr, port },
            Self::V6 { addr, .. } => Self::V6 { addr, port },
        }
    }

    /// 是否为 IPv6 地址。
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6 { .. })
    }

    /// 是否为任意地址（`0.0.0.0` 或 `::`）。
    pub fn is_unspecified(&self) -> bool {
        match self {
            Self::V4 { addr, .. } => addr.iter().all(|octet| *octet == 0),
            Self::V6 { addr, .. } => addr.iter().all(|segment| *segment == 0),
        }
    }

    /// 是否为 IPv6 任意地址；监听器据此决定是否关闭 `IPV6_V6ONLY`。
    pub fn is_ipv6_any(&self) -> bool {
        self.is_ipv6() && self.is_unspecified()
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSocketAddr::V4 { addr, port } => write!(
                f,
                "{}.{}.{}.{}:{}",
                addr[0], addr[1], addr[2], addr[3], port
            ),
            TransportSocketAddr::V6 { addr, port } => {
                let segments: Vec<String> = addr
                    .iter()
                    .map(|segment| format!("{:x}", segment))
                    .collect();
                write!(f, "[{}]:{}", segments.join(":"), port)
            }
        }
    }
}

#[cfg(feature = "std")]
impl From<std::net::SocketAddr> for TransportSocketAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            std::net::SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                // 双栈监听接受的 IPv4 客户端以映射地址出现，还原为 V4 便于日志与比较。
                Some(v4) => Self::V4 {
                    addr: v4.octets(),
                    port: v6.port(),
                },
                None => Self::V6 {
                    addr: v6.ip().segments(),
                    port: v6.port(),
                },
            },
        }
    }
}

#[cfg(feature = "std")]
impl From<TransportSocketAddr> for std::net::SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        match addr {
            TransportSocketAddr::V4 { addr, port } => std::net::SocketAddr::from((addr, port)),
            TransportSocketAddr::V6 { addr, port } => {
                std::net::SocketAddr::from((std::net::Ipv6Addr::from(addr), port))
            }
        }
    }
}
