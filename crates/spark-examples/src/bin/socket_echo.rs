//! 套接字回显服务：演示 `SocketTransport` 的绑定、连接分发与优雅停机。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark::transport::sockets=debug cargo run --bin socket_echo -- 127.0.0.1:7000 --config sockets.toml
//! ```
//! - 第一个位置参数为监听地址，缺省为 `127.0.0.1:0`（由内核分配端口）；
//! - `--config`：可选，`SocketTransportOptions` 的 TOML 文件，例如 `backlog = 1024`、`linger_ms = 0`。
//!
//! # 设计要点（Why）
//! - 每条连接派生一个任务，把入站管道的段原样写回出站管道，协议层完全不接触套接字；
//! - `Ctrl+C` 触发 `stop`：先解绑停止接受，再等待存量连接全部关闭。

use std::{env, fs, net::SocketAddr, path::PathBuf};

use spark_pipe::PipeError;
use spark_transport::TransportSocketAddr;
use spark_transport_sockets::{SocketConnection, SocketTransport, SocketTransportOptions};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    endpoint: TransportSocketAddr,
    config: Option<PathBuf>,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        tracing::error!(error = %error, "socket echo failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let options = match &args.config {
        Some(path) => SocketTransportOptions::from_toml_str(&fs::read_to_string(path)?)?,
        None => SocketTransportOptions::default(),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(args.endpoint, options))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut raw_args: Vec<String> = env::args().skip(1).collect();
    raw_args.retain(|arg| arg.trim_start_matches('-') != "quick");
    let mut args = raw_args.into_iter();

    let mut endpoint = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config 之后必须提供文件路径"))?;
                config = Some(PathBuf::from(path));
            }
            other if endpoint.is_none() => {
                let addr: SocketAddr = other
                    .parse()
                    .map_err(|err| anyhow::anyhow!("无法解析监听地址 {other}: {err}"))?;
                endpoint = Some(TransportSocketAddr::from(addr));
            }
            other => anyhow::bail!("未知参数: {other}"),
        }
    }

    Ok(Args {
        endpoint: endpoint.unwrap_or_else(|| TransportSocketAddr::V4 {
            addr: [127, 0, 0, 1],
            port: 0,
        }),
        config,
    })
}

async fn serve(endpoint: TransportSocketAddr, options: SocketTransportOptions) -> anyhow::Result<()> {
    let mut transport = SocketTransport::new(endpoint, options, |connection: SocketConnection| {
        tokio::spawn(echo(connection));
    });
    let bound = transport.bind()?;
    tracing::info!(listener.local = %bound, "echo server ready, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!(active = transport.active_connections(), "stopping echo server");
    transport.stop().await?;
    Ok(())
}

async fn echo(connection: SocketConnection) {
    let connection_id = connection.connection_id().to_owned();
    let (mut input, mut output, _handle) = connection.split();
    let error = match pump(&mut input, &mut output).await {
        Ok(()) => None,
        Err(error) => {
            tracing::debug!(connection.id = %connection_id, error = %error, "echo stopped");
            Some(error)
        }
    };
    input.complete(None);
    output.complete(error);
}

async fn pump(
    input: &mut spark_pipe::PipeReader,
    output: &mut spark_pipe::PipeWriter,
) -> Result<(), PipeError> {
    loop {
        let result = input.read().await?;
        let buffer = result.buffer();
        for segment in buffer.segments() {
            output.write_bytes(segment.clone());
        }
        input.advance_to(buffer.len());

        if output.flush().await?.is_completed() || result.is_completed() {
            return Ok(());
        }
    }
}
