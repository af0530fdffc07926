use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::FutureExt;
use parking_lot::Mutex;
use spark_pipe::{FlushResult, PipeError, PipeReader, PipeWriter, ReadCanceler, SlabMemoryPool, pipe};
use spark_transport::{ShutdownDirection, TransportSocketAddr};
use tokio::{net::TcpStream, sync::watch};

use crate::{
    error::{
        CONFIGURE, RECEIVE, SEND, TransportError, is_connection_abort, is_connection_reset,
        map_io_error,
    },
    options::SocketTransportOptions,
    receiver::Receiver,
    sender::Sender,
    socket::SocketHandle,
    trace::SocketsTrace,
    tracker::{ConnectionGuard, ConnectionTracker},
};

/// 连接生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// 套接字已包装，收发循环尚未启动。
    Starting = 0,
    /// 收发循环均在运行。
    Running = 1,
    /// 至少一个循环已经结束，正在收尾。
    Draining = 2,
    /// 两个循环都已结束，套接字已释放，两条管道均已完成。
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// 新建连接共享的装配参数。
#[derive(Clone, Debug)]
pub(crate) struct ConnectionContext {
    pub(crate) options: SocketTransportOptions,
    pub(crate) pool: SlabMemoryPool,
    pub(crate) trace: SocketsTrace,
    pub(crate) tracker: Option<ConnectionTracker>,
}

struct ConnectionInner {
    connection_id: String,
    local_addr: TransportSocketAddr,
    remote_addr: TransportSocketAddr,
    socket: Arc<SocketHandle>,
    state: AtomicU8,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<TransportError>>,
    output_canceler: ReadCanceler,
    closed: watch::Sender<bool>,
    trace: SocketsTrace,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn enter_draining(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Running as u8,
            ConnectionState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn take_abort_reason(&self) -> TransportError {
        self.abort_reason
            .lock()
            .take()
            .unwrap_or_else(|| TransportError::connection_aborted("the connection was aborted"))
    }

    /// 接收错误分类：重置与中止类在已声明中止时视为无害。
    fn classify_receive_error(&self, error: io::Error) -> Option<TransportError> {
        let id = self.connection_id.as_str();
        if is_connection_reset(&error) {
            if self.is_aborted() {
                return None;
            }
            self.trace.connection_reset(id);
            return Some(TransportError::ConnectionReset {
                source: Some(error),
            });
        }
        if is_connection_abort(&error) {
            if self.is_aborted() {
                return None;
            }
            let error = TransportError::connection_aborted(error.to_string());
            self.trace.connection_error(id, &error);
            return Some(error);
        }
        let error = map_io_error(RECEIVE, error);
        self.trace.connection_error(id, &error);
        Some(error)
    }

    /// 发送错误分类：重置与中止类不上报。
    fn classify_send_error(&self, error: io::Error) -> Option<TransportError> {
        if is_connection_reset(&error) || is_connection_abort(&error) {
            return None;
        }
        let error = map_io_error(SEND, error);
        self.trace.connection_error(&self.connection_id, &error);
        Some(error)
    }
}

/// 连接的可克隆控制句柄：查询状态、主动中止、等待关闭。
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn local_addr(&self) -> TransportSocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> TransportSocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// 中止连接。
    ///
    /// # 契约（What）
    /// - 记录中止原因（仅首次生效）并设置中止标记；
    /// - 打断发送循环挂起中的出站读取，释放套接字让接收循环尽快返回；
    /// - 协议层随后会在入站管道上观察到 [`TransportError::ConnectionAborted`]，其中携带 `reason`。
    pub fn abort(&self, reason: impl Into<String>) {
        let inner = &self.inner;
        let reason = reason.into();
        inner.trace.connection_aborted(&inner.connection_id, &reason);
        {
            let mut slot = inner.abort_reason.lock();
            if slot.is_none() {
                *slot = Some(TransportError::connection_aborted(reason));
            }
        }
        inner.aborted.store(true, Ordering::Release);
        inner.output_canceler.cancel();
        inner.socket.dispose();
    }

    /// 等待连接进入 `Closed`。
    pub async fn closed(&self) {
        let mut receiver = self.inner.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.inner.connection_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// 一条已建立的套接字连接，对协议层呈现为一对字节管道。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议层只需要“读入站字节、写出站字节”两件事；套接字收发、背压、终止协调全部收敛在连接内部；
/// - 接收循环与发送循环相互独立运行，各自的终止原因需要合并成一次关闭流程，
///   并把失败原因以管道完成错误的方式传给协议层。
///
/// ## 核心机制（How）
/// - 入站管道：接收循环是唯一生产者，协议层通过 [`SocketConnection::input`] 消费；
/// - 出站管道：协议层通过 [`SocketConnection::output`] 生产，发送循环是唯一消费者；
/// - 两个循环各占一个 Tokio 任务；发送循环所在任务在结束后负责收尾：
///   若接收循环尚未结束则立即释放套接字，随后等待接收循环，完成出站读端并发布关闭通知。
///
/// ## 契约（What）
/// - 状态按 `Starting → Running → Draining → Closed` 单向推进；
/// - 对端 FIN 使入站管道无错误完成；对端重置使入站管道以 [`TransportError::ConnectionReset`] 完成；
/// - 丢弃 `SocketConnection`（或分别完成两端管道）即请求优雅关闭：发送循环写完剩余数据后
///   执行 `shutdown(Both)`；
/// - 套接字恰好释放一次。
///
/// ## 注意事项（Trade-offs）
/// - 接收循环因 FIN 结束时不会释放套接字，协议层仍可继续写出响应；
/// - 发送循环结束后会设置中止标记，此后接收侧出现的重置或中止类错误不再单独上报，
///   入站管道改为以中止原因完成。
pub struct SocketConnection {
    handle: ConnectionHandle,
    input: PipeReader,
    output: PipeWriter,
}

impl SocketConnection {
    /// 以客户端身份建立连接。
    pub async fn connect(
        addr: TransportSocketAddr,
        options: SocketTransportOptions,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(SocketAddr::from(addr))
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        options.apply(&stream)?;
        let context = ConnectionContext {
            options,
            pool: SlabMemoryPool::new(),
            trace: SocketsTrace::new("client"),
            tracker: None,
        };
        Self::start(stream, &context)
    }

    /// 包装已建立的套接字并启动收发循环。
    pub(crate) fn start(
        stream: TcpStream,
        context: &ConnectionContext,
    ) -> Result<Self, TransportError> {
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let remote_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;

        let socket = SocketHandle::new(stream);
        let receiver = Receiver::new(Arc::clone(&socket));
        let sender = Sender::new(Arc::clone(&socket));
        let options = &context.options;
        let (input_writer, input_reader) = pipe(options.input_pipe_options(&context.pool));
        let (output_writer, output_reader) = pipe(options.output_pipe_options(&context.pool));
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(ConnectionInner {
            connection_id: next_connection_id(),
            local_addr: TransportSocketAddr::from(local_addr),
            remote_addr: TransportSocketAddr::from(remote_addr),
            socket,
            state: AtomicU8::new(ConnectionState::Starting as u8),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            output_canceler: output_reader.canceler(),
            closed,
            trace: context.trace.clone(),
        });

        let loops = ConnectionLoops {
            inner: Arc::clone(&inner),
            receiver,
            sender,
            input: input_writer,
            output: output_reader,
            settings: ReceiveSettings {
                wait_for_data: options.wait_for_data_before_allocating_buffer(),
                min_allocation_size: options.min_allocation_size(),
            },
            guard: context.tracker.as_ref().map(ConnectionTracker::track),
        };
        loops.spawn();

        Ok(Self {
            handle: ConnectionHandle { inner },
            input: input_reader,
            output: output_writer,
        })
    }

    pub fn connection_id(&self) -> &str {
        self.handle.connection_id()
    }

    pub fn local_addr(&self) -> TransportSocketAddr {
        self.handle.local_addr()
    }

    pub fn remote_addr(&self) -> TransportSocketAddr {
        self.handle.remote_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// 入站管道读端：接收循环写入的字节。
    pub fn input(&mut self) -> &mut PipeReader {
        &mut self.input
    }

    /// 出站管道写端：写入的字节由发送循环送往对端。
    pub fn output(&mut self) -> &mut PipeWriter {
        &mut self.output
    }

    /// 获取可克隆的控制句柄。
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// 拆分为入站读端、出站写端与控制句柄，便于读写分属不同任务。
    pub fn split(self) -> (PipeReader, PipeWriter, ConnectionHandle) {
        (self.input, self.output, self.handle)
    }

    /// 见 [`ConnectionHandle::abort`]。
    pub fn abort(&self, reason: impl Into<String>) {
        self.handle.abort(reason);
    }

    /// 等待连接进入 `Closed`。
    pub async fn closed(&self) {
        self.handle.closed().await
    }
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
struct ReceiveSettings {
    wait_for_data: bool,
    min_allocation_size: usize,
}

/// 收发循环持有的资源，启动时一次性移交给两个任务。
struct ConnectionLoops {
    inner: Arc<ConnectionInner>,
    receiver: Receiver,
    sender: Sender,
    input: PipeWriter,
    output: PipeReader,
    settings: ReceiveSettings,
    guard: Option<ConnectionGuard>,
}

impl ConnectionLoops {
    fn spawn(self) {
        let Self {
            inner,
            receiver,
            sender,
            input,
            output,
            settings,
            guard,
        } = self;
        inner.set_state(ConnectionState::Running);

        let receive_task = tokio::spawn(do_receive(Arc::clone(&inner), receiver, input, settings));
        tokio::spawn(async move {
            let (send_error, output) = do_send(Arc::clone(&inner), sender, output).await;
            if !receive_task.is_finished() {
                // 发送循环先结束：立即释放套接字，接收循环随之以中止类错误返回。
                inner.socket.dispose();
            }
            if let Err(join_error) = receive_task.await {
                let error = TransportError::connection_aborted(format!(
                    "receive loop terminated abnormally: {join_error}"
                ));
                inner.trace.connection_error(&inner.connection_id, &error);
            }

            inner.socket.dispose();
            output.complete(send_error.map(PipeError::new));
            inner.set_state(ConnectionState::Closed);
            inner.trace.connection_closed(&inner.connection_id);
            inner.closed.send_replace(true);
            drop(guard);
        });
    }
}

async fn do_receive(
    inner: Arc<ConnectionInner>,
    mut receiver: Receiver,
    mut input: PipeWriter,
    settings: ReceiveSettings,
) {
    let outcome = receive_loop(&inner, &mut receiver, &mut input, settings).await;
    let failed = outcome.is_err();
    let mut error = match outcome {
        Ok(()) => None,
        Err(err) => inner.classify_receive_error(err),
    };
    if error.is_none() && inner.is_aborted() {
        error = Some(inner.take_abort_reason());
    }
    inner.enter_draining();
    if failed {
        // 对端不会再响应：唤醒挂起在出站读取上的发送循环并释放套接字。
        // FIN 不走这里，半关闭期间应用仍可写出响应。
        inner.aborted.store(true, Ordering::Release);
        inner.output_canceler.cancel();
        inner.socket.dispose();
    }
    input.complete(error.map(PipeError::new));
}

async fn receive_loop(
    inner: &ConnectionInner,
    receiver: &mut Receiver,
    input: &mut PipeWriter,
    settings: ReceiveSettings,
) -> io::Result<()> {
    loop {
        if settings.wait_for_data {
            receiver.wait_for_data().await?;
        }

        let memory = input.get_memory(settings.min_allocation_size);
        let (result, memory) = receiver.receive(memory).await;
        input.advance(memory);
        if result? == 0 {
            inner.trace.connection_read_fin(&inner.connection_id);
            return Ok(());
        }

        match flush_input(inner, input).await {
            Ok(flushed) if flushed.is_completed() => return Ok(()),
            Ok(_) => {}
            // 协议层以错误完成了入站读端，不再接收。
            Err(_) => return Ok(()),
        }
    }
}

/// 提交入站数据；因背压挂起时记录暂停与恢复事件。
async fn flush_input(
    inner: &ConnectionInner,
    input: &mut PipeWriter,
) -> Result<FlushResult, PipeError> {
    let mut flush = input.flush();
    if let Some(result) = (&mut flush).now_or_never() {
        return result;
    }
    inner.trace.connection_pause(&inner.connection_id);
    let result = flush.await;
    inner.trace.connection_resume(&inner.connection_id);
    result
}

async fn do_send(
    inner: Arc<ConnectionInner>,
    mut sender: Sender,
    mut output: PipeReader,
) -> (Option<TransportError>, PipeReader) {
    let error = match send_loop(&mut sender, &mut output).await {
        Ok(()) => None,
        Err(err) => inner.classify_send_error(err),
    };
    inner.aborted.store(true, Ordering::Release);
    inner.enter_draining();
    inner.trace.connection_write_fin(&inner.connection_id);
    let _ = inner.socket.shutdown(ShutdownDirection::Both);
    (error, output)
}

async fn send_loop(sender: &mut Sender, output: &mut PipeReader) -> io::Result<()> {
    loop {
        let result = match output.read().await {
            Ok(result) => result,
            // 协议层以错误完成了出站写端，剩余数据已全部发出。
            Err(_) => return Ok(()),
        };
        if result.is_canceled() {
            return Ok(());
        }

        let buffer = result.buffer();
        if !buffer.is_empty() {
            sender.send(buffer).await?;
        }
        output.advance_to(buffer.len());

        if result.is_completed() {
            return Ok(());
        }
    }
}

/// 生成 13 位 base32 连接标识，起点取自当前时间，之后单调递增。
fn next_connection_id() -> String {
    const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";
    static LAST_ID: OnceLock<AtomicU64> = OnceLock::new();

    let counter = LAST_ID.get_or_init(|| {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64 / 100)
            .unwrap_or_default();
        AtomicU64::new(seed)
    });
    let id = counter.fetch_add(1, Ordering::Relaxed) + 1;
    (0..13)
        .rev()
        .map(|index| ENCODING[((id >> (index * 5)) & 31) as usize] as char)
        .collect()
}
