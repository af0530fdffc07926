//! 连接层契约：回显、分散写、终止语义与背压。

mod support;

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use proptest::prelude::*;
use socket2::SockRef;
use spark_transport::TransportSocketAddr;
use spark_transport_sockets::{
    ConnectionState, SocketConnection, SocketTransport, SocketTransportOptions, TransportError,
};
use support::{
    channel_dispatcher, echo_dispatcher, loopback, read_to_completion, within,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip_spans_two_client_writes() -> anyhow::Result<()> {
    //
    // 教案级说明：两次写入的 "PI" 与 "NG" 必须按序回显为 "PING"。
    // - **How**：服务端以回显分发器处理连接，客户端分两次写入后读满 4 字节；
    // - **What**：客户端关闭后 `stop` 能等到连接全部关闭。
    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    let addr = SocketAddr::from(transport.bind()?);

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(b"PI").await?;
    client.write_all(b"NG").await?;
    let mut received = [0u8; 4];
    within(client.read_exact(&mut received)).await?;
    assert_eq!(&received, b"PING");

    drop(client);
    within(transport.stop()).await?;
    assert_eq!(transport.active_connections(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discontiguous_segments_reach_peer_in_order() -> anyhow::Result<()> {
    //
    // 教案级说明：出站管道中 5 个互不相邻的 2000 字节段经由分散写完整送达。
    // - **Why**：多段数据走 `writev` 式发送，任何段序或偏移错误都会破坏字节流；
    // - **What**：对端读到的 10 000 字节与写入序列逐字节一致，且完成出站后对端看到 EOF。
    let listener = TcpListener::bind(SocketAddr::from(loopback())).await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await?;
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await?;
        anyhow::Ok(received)
    });

    let connection =
        SocketConnection::connect(TransportSocketAddr::from(addr), SocketTransportOptions::default())
            .await?;
    let handle = connection.handle();
    let (_input, mut output, _) = connection.split();

    let expected: Vec<u8> = (0..10_000u32).map(|value| (value % 251) as u8).collect();
    for chunk in expected.chunks(2000) {
        output.write_bytes(Bytes::copy_from_slice(chunk));
    }
    output.flush().await?;
    output.complete(None);

    let received = within(server).await??;
    assert_eq!(received.len(), 10_000);
    assert_eq!(received, expected);
    within(handle.closed()).await;
    assert_eq!(handle.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_do_not_mix_bytes() -> anyhow::Result<()> {
    //
    // 教案级说明：100 条并发连接各自回显 1 KiB 专属数据。
    // - **Why**：连接共享内存池与接受循环，任何跨连接的段复用错误都会表现为串流；
    // - **What**：每个客户端收到的正是自己发出的字节。
    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    let addr = SocketAddr::from(transport.bind()?);

    let mut clients = Vec::new();
    for index in 0..100u32 {
        clients.push(tokio::spawn(async move {
            let payload: Vec<u8> = (0..1024u32)
                .map(|offset| (index.wrapping_mul(31).wrapping_add(offset) % 256) as u8)
                .collect();
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&payload).await?;
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await?;
            anyhow::ensure!(echoed == payload, "connection {index} received foreign bytes");
            anyhow::Ok(())
        }));
    }
    for client in clients {
        within(client).await??;
    }

    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_fin_completes_input_cleanly() -> anyhow::Result<()> {
    //
    // 教案级说明：对端半关闭写方向后，入站管道交付剩余数据并以无错误方式完成。
    // - **What**：协议层仍可写出响应，对端在 FIN 之后照常收到数据。
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), SocketTransportOptions::default(), dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(b"hello").await?;
    client.shutdown().await?;

    let connection = within(accepted.recv()).await.expect("connection dispatched");
    let (mut input, mut output, handle) = connection.split();
    let data = within(read_to_completion(&mut input)).await?;
    assert_eq!(data, b"hello");

    output.write(b"bye");
    output.flush().await?;
    output.complete(None);
    let mut response = Vec::new();
    within(client.read_to_end(&mut response)).await?;
    assert_eq!(response, b"bye");

    within(handle.closed()).await;
    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_during_pending_receive_completes_input_with_reason() -> anyhow::Result<()> {
    //
    // 教案级说明：接收循环挂起等待数据时调用 `abort`，连接必须及时关闭。
    // - **Why**：释放套接字是接收侧唯一的取消手段，若挂起操作不被唤醒，停机会永久等待；
    // - **What**：入站管道以携带原因的 `ConnectionAborted` 完成，连接进入 `Closed`，对端看到连接结束。
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), SocketTransportOptions::default(), dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let mut client = TcpStream::connect(addr).await?;
    let connection = within(accepted.recv()).await.expect("connection dispatched");
    assert_eq!(connection.state(), ConnectionState::Running);
    let (mut input, _output, handle) = connection.split();

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort("server shutting down");

    let error = within(read_to_completion(&mut input))
        .await
        .expect_err("aborted connection must fail the input pipe");
    match error.downcast_ref::<TransportError>() {
        Some(TransportError::ConnectionAborted { reason }) => {
            assert_eq!(reason, "server shutting down");
        }
        other => panic!("unexpected input error: {other:?}"),
    }
    within(handle.closed()).await;
    assert_eq!(handle.state(), ConnectionState::Closed);

    let mut rest = Vec::new();
    let _ = within(client.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());

    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_reset_surfaces_as_connection_reset() -> anyhow::Result<()> {
    //
    // 教案级说明：对端以 RST 断开时，入站管道以 `ConnectionReset` 完成。
    // - **How**：客户端设置 `SO_LINGER = 0` 后关闭，内核发送 RST 而非 FIN。
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), SocketTransportOptions::default(), dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let client = TcpStream::connect(addr).await?;
    let connection = within(accepted.recv()).await.expect("connection dispatched");
    let (mut input, _output, handle) = connection.split();

    SockRef::from(&client).set_linger(Some(Duration::ZERO))?;
    drop(client);

    let error = within(read_to_completion(&mut input))
        .await
        .expect_err("reset must fail the input pipe");
    assert!(
        matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::ConnectionReset { .. })
        ),
        "unexpected input error: {error}"
    );
    within(handle.closed()).await;
    assert_eq!(handle.state(), ConnectionState::Closed);
    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_closes_connection_while_output_stays_open() -> anyhow::Result<()> {
    //
    // 教案级说明：接收侧失败后对端不会再响应，连接不能停在半关闭。
    // - **How**：协议层既不读入站也不完成出站，发送循环挂起在出站读取上；
    // - **What**：对端 RST 后连接仍走到 `Closed`，活跃计数归零，`stop` 正常返回。
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), SocketTransportOptions::default(), dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let client = TcpStream::connect(addr).await?;
    let connection = within(accepted.recv()).await.expect("connection dispatched");
    let (_input, _output, handle) = connection.split();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), ConnectionState::Running);

    SockRef::from(&client).set_linger(Some(Duration::ZERO))?;
    drop(client);

    within(handle.closed()).await;
    assert_eq!(handle.state(), ConnectionState::Closed);
    within(transport.wait_for_idle()).await;
    assert_eq!(transport.active_connections(), 0);
    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completing_output_shuts_down_both_directions() -> anyhow::Result<()> {
    //
    // 教案级说明：发送循环结束后执行 `shutdown(Both)`，对端读到 EOF。
    // - **What**：协议层完成出站而未读取入站时，连接仍会完整关闭并从活跃计数中移除。
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), SocketTransportOptions::default(), dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let mut client = TcpStream::connect(addr).await?;
    let connection = within(accepted.recv()).await.expect("connection dispatched");
    let (_input, output, handle) = connection.split();
    output.complete(None);

    let mut buf = [0u8; 8];
    let read = within(client.read(&mut buf)).await?;
    assert_eq!(read, 0, "peer must observe EOF");

    within(handle.closed()).await;
    within(transport.wait_for_idle()).await;
    assert_eq!(transport.active_connections(), 0);
    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_consumer_pauses_receive_without_losing_bytes() -> anyhow::Result<()> {
    //
    // 教案级说明：入站阈值远小于发送量时，接收循环在 flush 上暂停，消费后恢复。
    // - **Why**：暂停期间不再从套接字读取，TCP 窗口把压力传回对端；
    // - **What**：协议层延迟消费后读到的字节与发送内容完全一致。
    let options = SocketTransportOptions::default()
        .with_max_read_buffer_size(Some(1024))
        .with_min_allocation_size(512);
    let (dispatcher, mut accepted) = channel_dispatcher();
    let mut transport = SocketTransport::new(loopback(), options, dispatcher);
    let addr = SocketAddr::from(transport.bind()?);

    let payload: Vec<u8> = (0..64 * 1024u32).map(|value| (value % 239) as u8).collect();
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await?;
            client.write_all(&payload).await?;
            client.shutdown().await?;
            anyhow::Ok(client)
        })
    };

    let connection = within(accepted.recv()).await.expect("connection dispatched");
    let (mut input, output, _handle) = connection.split();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let data = within(read_to_completion(&mut input)).await?;
    assert_eq!(data, payload);

    // 对端只发了 FIN，连接仍处于半关闭；完成出站后连接才会关闭。
    output.complete(None);
    drop(within(writer).await??);
    within(transport.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_connect_to_closed_port_reports_connect_error() -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(loopback())).await?;
    let addr = TransportSocketAddr::from(listener.local_addr()?);
    drop(listener);

    let error = SocketConnection::connect(addr, SocketTransportOptions::default())
        .await
        .expect_err("nothing listens on the port");
    assert!(matches!(error, TransportError::Connect { .. }));
    assert_eq!(error.code(), "spark.transport.sockets.connect_failed");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, .. ProptestConfig::default() })]

    /// 任意分块写入的字节经回显后顺序不变。
    #[test]
    fn echoed_chunks_preserve_order(chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 1..12)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let expected: Vec<u8> = chunks.concat();
        let echoed = runtime.block_on(async move {
            let mut transport = SocketTransport::new(
                loopback(),
                SocketTransportOptions::default(),
                echo_dispatcher(),
            );
            let addr = SocketAddr::from(transport.bind().expect("bind"));
            let mut client = TcpStream::connect(addr).await.expect("connect");
            for chunk in &chunks {
                client.write_all(chunk).await.expect("write");
            }
            client.shutdown().await.expect("shutdown");
            let mut echoed = Vec::new();
            within(client.read_to_end(&mut echoed)).await.expect("read");
            within(transport.stop()).await.expect("stop");
            echoed
        });
        prop_assert_eq!(echoed, expected);
    }
}
