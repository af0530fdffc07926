//! 监听器契约：端口解析、地址冲突、解绑与重绑。

mod support;

use std::net::SocketAddr;

use spark_transport::{TransportListener, TransportSocketAddr};
use spark_transport_sockets::{SocketTransport, SocketTransportOptions, TransportError};
use support::{echo_dispatcher, loopback, within};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

#[tokio::test]
async fn bind_resolves_ephemeral_port() -> anyhow::Result<()> {
    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    assert_eq!(transport.local_addr(), None);

    let bound = transport.bind()?;
    assert_ne!(SocketAddr::from(bound).port(), 0, "port 0 must be resolved");
    assert_eq!(transport.local_addr(), Some(bound));
    assert_eq!(transport.endpoint(), loopback());

    within(transport.unbind()).await?;
    assert_eq!(transport.local_addr(), None);
    Ok(())
}

#[tokio::test]
async fn second_transport_on_same_port_reports_address_in_use() -> anyhow::Result<()> {
    //
    // 教案级说明：地址冲突必须是独立的错误分支，而不是笼统的 I/O 失败。
    // - **What**：第二个传输绑定同一地址时得到 `AddressInUse`，错误码稳定，第一个传输不受影响。
    let mut first =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    let bound = first.bind()?;

    let mut second =
        SocketTransport::new(bound, SocketTransportOptions::default(), echo_dispatcher());
    let error = second.bind().expect_err("address is taken");
    assert!(
        matches!(error, TransportError::AddressInUse { addr, .. } if addr == bound),
        "unexpected error: {error}"
    );
    assert_eq!(error.code(), "spark.transport.sockets.address_in_use");
    assert!(!second.is_bound());

    let mut client = TcpStream::connect(SocketAddr::from(bound)).await?;
    client.write_all(b"ok").await?;
    let mut echoed = [0u8; 2];
    within(client.read_exact(&mut echoed)).await?;
    assert_eq!(&echoed, b"ok");

    drop(client);
    within(first.stop()).await?;
    Ok(())
}

#[tokio::test]
async fn repeated_bind_and_unbind_are_rejected() -> anyhow::Result<()> {
    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    assert!(matches!(
        within(transport.unbind()).await,
        Err(TransportError::NotBound)
    ));

    let bound = transport.bind()?;
    assert!(matches!(
        transport.bind(),
        Err(TransportError::AlreadyBound { addr }) if addr == bound
    ));

    within(transport.unbind()).await?;
    assert!(matches!(
        within(transport.unbind()).await,
        Err(TransportError::NotBound)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbind_then_rebind_same_port() -> anyhow::Result<()> {
    //
    // 教案级说明：解绑后端口立即可以被重新绑定。
    // - **Why**：解绑先清空监听槽位再释放套接字，接受循环随之静默退出，不应把预期中的接受错误上报；
    // - **What**：`unbind` 返回 `Ok`，新的传输在同一端口绑定成功并正常服务。
    let mut first =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    let bound = first.bind()?;
    within(first.unbind()).await?;

    let mut second =
        SocketTransport::new(bound, SocketTransportOptions::default(), echo_dispatcher());
    assert_eq!(second.bind()?, bound);

    let mut client = TcpStream::connect(SocketAddr::from(bound)).await?;
    client.write_all(b"again").await?;
    let mut echoed = [0u8; 5];
    within(client.read_exact(&mut echoed)).await?;
    assert_eq!(&echoed, b"again");

    drop(client);
    within(second.stop()).await?;
    within(first.stop()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unbind_keeps_established_connections_running() -> anyhow::Result<()> {
    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    let addr = SocketAddr::from(transport.bind()?);

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(b"one").await?;
    let mut echoed = [0u8; 3];
    within(client.read_exact(&mut echoed)).await?;

    within(transport.unbind()).await?;
    assert_eq!(transport.active_connections(), 1);

    client.write_all(b"two").await?;
    within(client.read_exact(&mut echoed)).await?;
    assert_eq!(&echoed, b"two");

    drop(client);
    within(transport.stop()).await?;
    assert_eq!(transport.active_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn listener_trait_drives_lifecycle() -> anyhow::Result<()> {
    async fn cycle<L: TransportListener>(listener: &mut L) -> Result<TransportSocketAddr, L::Error> {
        let bound = listener.bind()?;
        listener.stop().await?;
        Ok(bound)
    }

    let mut transport =
        SocketTransport::new(loopback(), SocketTransportOptions::default(), echo_dispatcher());
    assert_eq!(TransportListener::scheme(&transport), "tcp");
    let bound = within(cycle(&mut transport)).await?;
    assert_ne!(SocketAddr::from(bound).port(), 0);
    assert_eq!(TransportListener::local_addr(&transport), None);
    Ok(())
}
