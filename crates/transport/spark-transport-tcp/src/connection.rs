use crate::{
    TcpSocketConfig,
    error::{self, closed_error, map_io_error},
};
use bytes::{Bytes, BytesMut};
use spark_transport::{
    ConnectionObserver, LinkError, PendingStream, StreamConnection, TransportSocketAddr,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream as TokioTcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// 发起出站 TCP 连接，必须在 Tokio 运行时内 `await`。
///
/// 成功时返回尚未开始读取的 [`PendingTcpStream`]；失败时返回
/// `spark.transport.tcp.connect_failed`，拒绝/重置类错误归类为 `Retryable`。
pub async fn connect(
    remote: TransportSocketAddr,
    config: TcpSocketConfig,
) -> Result<PendingTcpStream, LinkError> {
    let stream = TokioTcpStream::connect(SocketAddr::from(remote))
        .await
        .map_err(|err| map_io_error(error::CONNECT, err))?;
    PendingTcpStream::from_stream(stream, config)
}

/// 已建立、尚未启动读写任务的 TCP 连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接建立与“开始投递字节”是两个时刻：通道层需要先构造缓冲（观察者），
///   再调用 [`PendingStream::start`]，这样首批到达的字节一定有去处；
/// - 记录构造时所在运行时的 [`Handle`]，`start` 可以在任意线程调用而不依赖线程局部上下文。
///
/// ## 契约（What）
/// - 构造时已应用 [`TcpSocketConfig`] 的连接级选项；
/// - `start` 恰好一次（`Box<Self>` 保证），返回 [`TcpConnection`]。
#[derive(Debug)]
pub struct PendingTcpStream {
    stream: TokioTcpStream,
    local_addr: TransportSocketAddr,
    peer_addr: TransportSocketAddr,
    config: TcpSocketConfig,
    runtime: Handle,
}

impl PendingTcpStream {
    /// 包装一条已连接的流；必须在运行时上下文中调用。
    pub(crate) fn from_stream(
        stream: TokioTcpStream,
        config: TcpSocketConfig,
    ) -> Result<Self, LinkError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        Ok(Self {
            stream,
            local_addr: TransportSocketAddr::from(local),
            peer_addr: TransportSocketAddr::from(peer),
            config,
            runtime: Handle::current(),
        })
    }
}

impl PendingStream for PendingTcpStream {
    fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> TransportSocketAddr {
        self.peer_addr
    }

    fn start(self: Box<Self>, observer: Arc<dyn ConnectionObserver>) -> Arc<dyn StreamConnection> {
        let PendingTcpStream {
            stream,
            local_addr,
            peer_addr,
            config,
            runtime,
        } = *self;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        runtime.spawn(read_loop(
            reader,
            observer,
            stop_rx,
            config.read_chunk_size(),
            peer_addr,
        ));
        runtime.spawn(write_loop(writer, rx, stop_tx, peer_addr));
        Arc::new(TcpConnection {
            tx,
            closing: AtomicBool::new(false),
            local_addr,
            peer_addr,
        })
    }
}

enum WriteOp {
    Data(Bytes),
    Close,
}

/// 已启动的 TCP 连接句柄。
///
/// - `write` 把数据放入有序写队列，队列由专属写任务消费，因此可以从任意线程调用；
/// - `close_gracefully` 排在已入队数据之后执行，保证“先写后关”的顺序；
/// - 句柄被丢弃时写任务同样冲刷队列并关闭连接。
#[derive(Debug)]
pub struct TcpConnection {
    tx: mpsc::UnboundedSender<WriteOp>,
    closing: AtomicBool,
    local_addr: TransportSocketAddr,
    peer_addr: TransportSocketAddr,
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOp::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            WriteOp::Close => f.write_str("Close"),
        }
    }
}

impl StreamConnection for TcpConnection {
    fn write(&self, data: Bytes) -> Result<usize, LinkError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(closed_error(error::WRITE));
        }
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        self.tx
            .send(WriteOp::Data(data))
            .map_err(|_| closed_error(error::WRITE))?;
        Ok(len)
    }

    fn close_gracefully(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WriteOp::Close);
        }
    }

    fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> TransportSocketAddr {
        self.peer_addr
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    observer: Arc<dyn ConnectionObserver>,
    mut stop: oneshot::Receiver<()>,
    chunk_size: usize,
    peer: TransportSocketAddr,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        tokio::select! {
            biased;
            _ = &mut stop => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    trace!(peer = %peer, "tcp peer closed its write half");
                    break;
                }
                Ok(n) => {
                    trace!(peer = %peer, bytes = n, "tcp bytes received");
                    observer.on_bytes(buf.split().freeze());
                }
                Err(err) => {
                    let err = map_io_error(error::READ, err);
                    debug!(code = err.code(), peer = %peer, error = %err, "tcp read ended");
                    break;
                }
            },
        }
    }
    observer.on_closed();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    stop_reader: oneshot::Sender<()>,
    peer: TransportSocketAddr,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(err) = writer.write_all(&bytes).await {
                    let err = map_io_error(error::WRITE, err);
                    warn!(code = err.code(), peer = %peer, error = %err, "tcp write failed, dropping queued data");
                    break;
                }
            }
            WriteOp::Close => break,
        }
    }
    rx.close();
    if let Err(err) = writer.shutdown().await {
        let err = map_io_error(error::SHUTDOWN, err);
        debug!(code = err.code(), peer = %peer, error = %err, "tcp shutdown failed");
    }
    let _ = stop_reader.send(());
}
