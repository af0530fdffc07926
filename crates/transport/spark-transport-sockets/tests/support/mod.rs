//! 集成测试共用的装配工具：回显分发器、管道读尽、地址构造与超时包装。

#![allow(dead_code)]

use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use spark_pipe::{PipeError, PipeReader};
use spark_transport::TransportSocketAddr;
use spark_transport_sockets::SocketConnection;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn loopback() -> TransportSocketAddr {
    TransportSocketAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
}

/// 为测试中的等待加上统一超时，挂起即视为失败。
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("operation must finish before timeout")
}

/// 每条连接派生一个回显任务。
pub fn echo_dispatcher() -> impl Fn(SocketConnection) + Send + Sync + 'static {
    |connection: SocketConnection| {
        tokio::spawn(echo(connection));
    }
}

/// 把入站段原样写回出站管道，直到入站完成。
pub async fn echo(connection: SocketConnection) {
    let (mut input, mut output, _handle) = connection.split();
    loop {
        let Ok(result) = input.read().await else {
            break;
        };
        let buffer = result.buffer();
        for segment in buffer.segments() {
            output.write_bytes(segment.clone());
        }
        input.advance_to(buffer.len());
        match output.flush().await {
            Ok(flushed) if !flushed.is_completed() => {}
            _ => break,
        }
        if result.is_completed() {
            break;
        }
    }
    input.complete(None);
    output.complete(None);
}

/// 把连接交给测试线程，由用例自行驱动。
pub fn channel_dispatcher() -> (
    impl Fn(SocketConnection) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<SocketConnection>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let dispatcher = move |connection: SocketConnection| {
        let _ = sender.send(connection);
    };
    (dispatcher, receiver)
}

/// 读尽入站管道；管道以错误完成时返回该错误。
pub async fn read_to_completion(input: &mut PipeReader) -> Result<Vec<u8>, PipeError> {
    let mut data = Vec::new();
    loop {
        let result = input.read().await?;
        let buffer = result.buffer();
        // 完成错误排在剩余数据之后，读到“已完成且为空”才算读尽。
        if buffer.is_empty() && result.is_completed() {
            return Ok(data);
        }
        for segment in buffer.segments() {
            data.extend_from_slice(segment);
        }
        input.advance_to(buffer.len());
    }
}
