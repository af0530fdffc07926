use std::io;

use spark_transport::TransportSocketAddr;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.sockets.bind_failed",
    message: "socket bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.transport.sockets.listen_failed",
    message: "socket listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.sockets.accept_failed",
    message: "socket accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.sockets.connect_failed",
    message: "socket connect",
};
pub(crate) const RECEIVE: OperationKind = OperationKind {
    code: "spark.transport.sockets.receive_failed",
    message: "socket receive",
};
pub(crate) const SEND: OperationKind = OperationKind {
    code: "spark.transport.sockets.send_failed",
    message: "socket send",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.sockets.configure_failed",
    message: "socket configure",
};

const RESET_CODE: &str = "spark.transport.sockets.connection_reset";
const ABORTED_CODE: &str = "spark.transport.sockets.connection_aborted";
const ADDRESS_IN_USE_CODE: &str = "spark.transport.sockets.address_in_use";
const ALREADY_BOUND_CODE: &str = "spark.transport.sockets.already_bound";
const NOT_BOUND_CODE: &str = "spark.transport.sockets.not_bound";
const CONFIG_CODE: &str = "spark.transport.sockets.invalid_config";

/// 套接字传输层的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接上的失败最终以管道完成错误的形式交给协议层，协议层需要稳定地区分
///   “对端重置”“连接被中止”“一般 I/O 失败”三类，才能决定是否记录告警；
/// - 绑定冲突需要成为独立分支，宿主据此向运维输出“端口已被占用”而非笼统的 I/O 错误。
///
/// ## 契约（What）
/// - 每个变体通过 [`TransportError::code`] 暴露稳定错误码，前缀统一为 `spark.transport.sockets.`；
/// - `Io`/`Bind`/`Accept`/`Connect` 保留底层 `io::Error` 作为 `source`；
/// - [`TransportError::is_retryable`] 给出粗粒度的重试建议，仅用于观测与宿主策略，不改变传输行为。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 对端重置了连接。
    #[error("connection reset by peer")]
    ConnectionReset {
        #[source]
        source: Option<io::Error>,
    },
    /// 连接被本端中止，或在未声明中止时遇到中止类错误。
    #[error("connection aborted: {reason}")]
    ConnectionAborted { reason: String },
    /// 一般性 I/O 失败。
    #[error("{}: {source}", .operation.message)]
    Io {
        operation: OperationKind,
        #[source]
        source: io::Error,
    },
    /// 绑定地址已被占用。
    #[error("address {addr} is already in use")]
    AddressInUse {
        addr: TransportSocketAddr,
        #[source]
        source: io::Error,
    },
    /// 其它绑定失败。
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: TransportSocketAddr,
        #[source]
        source: io::Error,
    },
    /// 接受循环遇到致命错误。
    #[error("accept loop failed: {source}")]
    Accept {
        #[source]
        source: io::Error,
    },
    /// 客户端建连失败。
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: TransportSocketAddr,
        #[source]
        source: io::Error,
    },
    /// 重复绑定。
    #[error("transport is already bound to {addr}")]
    AlreadyBound { addr: TransportSocketAddr },
    /// 未绑定时请求解绑。
    #[error("transport is not bound")]
    NotBound,
    /// 配置解析失败。
    #[error("invalid socket transport options: {0}")]
    Config(#[from] toml::de::Error),
}

impl TransportError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionReset { .. } => RESET_CODE,
            Self::ConnectionAborted { .. } => ABORTED_CODE,
            Self::Io { operation, .. } => operation.code,
            Self::AddressInUse { .. } => ADDRESS_IN_USE_CODE,
            Self::Bind { .. } => BIND.code,
            Self::Accept { .. } => ACCEPT.code,
            Self::Connect { .. } => CONNECT.code,
            Self::AlreadyBound { .. } => ALREADY_BOUND_CODE,
            Self::NotBound => NOT_BOUND_CODE,
            Self::Config(_) => CONFIG_CODE,
        }
    }

    /// 粗粒度的重试建议。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionReset { .. } | Self::AddressInUse { .. } => true,
            Self::Io { source, .. } | Self::Connect { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }

    pub(crate) fn connection_aborted(reason: impl Into<String>) -> Self {
        Self::ConnectionAborted {
            reason: reason.into(),
        }
    }
}

/// 将 IO 错误映射为带操作上下文的传输错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        operation: kind,
        source: error,
    }
}

/// 套接字被本端释放后，挂起中的收发以该错误完成。
///
/// 文案固定，便于 [`is_connection_abort`] 识别。
const SOCKET_DISPOSED: &str = "socket disposed";

pub(crate) fn socket_disposed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, SOCKET_DISPOSED)
}

/// 是否为“连接被对端重置”类错误。
///
/// 包括 `ECONNRESET`、`EPIPE`；Windows 把对端重置报告为 `WSAECONNABORTED`，因此仅在该平台
/// 把 `ConnectionAborted` 归入此类。
pub fn is_connection_reset(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => true,
        io::ErrorKind::ConnectionAborted => cfg!(windows),
        _ => false,
    }
}

/// 是否为“操作被本端中止”类错误。
///
/// 套接字在收发挂起时被释放，各平台报告的错误各不相同：
/// - Unix：`EINTR`、`EINVAL`、`ENOTCONN`、`ECONNABORTED`、`ECANCELED`、`EBADF`；
/// - Windows：`WSAEINTR`、`WSAEINVAL`、`WSAENOTSOCK`、`ERROR_OPERATION_ABORTED`；
/// - 本 crate 在套接字释放后主动完成挂起操作时使用的 `NotConnected` 标记错误。
pub fn is_connection_abort(error: &io::Error) -> bool {
    match error.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected => {
            return true;
        }
        io::ErrorKind::ConnectionAborted if !cfg!(windows) => return true,
        _ => {}
    }
    match error.raw_os_error() {
        Some(code) => platform_abort_codes().contains(&code),
        None => false,
    }
}

#[cfg(unix)]
fn platform_abort_codes() -> &'static [i32] {
    // ECANCELED / EBADF，Linux 与 BSD 系编号不同。
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const CODES: &[i32] = &[125, 9];
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const CODES: &[i32] = &[89, 9];
    CODES
}

#[cfg(windows)]
fn platform_abort_codes() -> &'static [i32] {
    // WSAEINTR、WSAEINVAL、WSAENOTSOCK、ERROR_OPERATION_ABORTED
    &[10004, 10022, 10038, 995]
}

#[cfg(not(any(unix, windows)))]
fn platform_abort_codes() -> &'static [i32] {
    &[]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_classification_covers_peer_failures() {
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::BrokenPipe] {
            assert!(is_connection_reset(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_connection_reset(&io::Error::from(
            io::ErrorKind::TimedOut
        )));
    }

    #[cfg(not(windows))]
    #[test]
    fn connection_aborted_is_abort_class_off_windows() {
        let error = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(is_connection_abort(&error));
        assert!(!is_connection_reset(&error));
    }

    #[cfg(windows)]
    #[test]
    fn connection_aborted_is_reset_class_on_windows() {
        let error = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(is_connection_reset(&error));
        assert!(!is_connection_abort(&error));
    }

    #[test]
    fn abort_classification_includes_disposed_marker() {
        assert!(is_connection_abort(&socket_disposed_error()));
        assert!(is_connection_abort(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_connection_abort(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
    }

    #[cfg(unix)]
    #[test]
    fn abort_classification_includes_raw_bad_descriptor() {
        assert!(is_connection_abort(&io::Error::from_raw_os_error(9)));
    }

    #[test]
    fn codes_are_stable() {
        let err = TransportError::connection_aborted("test");
        assert_eq!(err.code(), "spark.transport.sockets.connection_aborted");
        let err = map_io_error(SEND, io::Error::from(io::ErrorKind::Other));
        assert_eq!(err.code(), "spark.transport.sockets.send_failed");
        assert!(err.to_string().starts_with("socket send"));
        assert!(TransportError::ConnectionReset { source: None }.is_retryable());
    }
}
