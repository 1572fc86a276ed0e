#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-udp

## 模块使命（Why）
- **统一 UDP 通路**：围绕 Tokio `UdpSocket` 实现 `spark-transport` 的报文契约，
  让通道层以与字节流相同的“观察者 + 写队列”模型使用无连接传输。
- **同步可见的端口**：监听端点在调用线程上同步绑定，端口冲突与系统分配端口立即可见。

## 核心契约（What）
- [`UdpEndpoint::bind`]：绑定本地地址，得到尚未收发的端点；
- [`UdpEndpoint::open`]：为出站通道打开临时套接字，可选 `connect` 关联远端，
  关联后来自其他地址的报文由内核过滤；
- [`UdpConnection`]：收发任务的句柄，`close` 在冲刷已入队报文后释放套接字，
  [`DatagramConnection::wait_released`] 可阻塞等待端口真正可复用。

## 实现策略（How）
- 绑定与关联使用标准库同步套接字完成，`start` 时在记录的运行时 [`Handle`] 上转换为 Tokio 套接字；
- 单一任务以 `tokio::select!` 同时驱动“出站队列”与“入站接收”，报文边界原样保留；
- 发往关联对端的报文走 `send`，其余走 `send_to`。
"#]

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spark_transport::{
    ConnectionObserver, DatagramConnection, ErrorCategory, LinkError, PendingDatagram,
    ReleaseGuard, ReleaseWaiter, TransportSocketAddr, release_latch,
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// 接收失败后的退避时长，避免持续出错的套接字把事件循环打满。
const RECV_BACKOFF: Duration = Duration::from_millis(20);

/// IPv4 下 UDP 报文的理论上限。
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// UDP 套接字选项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpSocketOptions {
    broadcast: bool,
    max_datagram_size: usize,
}

impl Default for UdpSocketOptions {
    fn default() -> Self {
        Self {
            broadcast: false,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl UdpSocketOptions {
    /// 启用或关闭广播。
    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// 单个报文的最大字节数，同时决定接收缓冲大小；取值被限制在 `1..=65535`。
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size.clamp(1, MAX_DATAGRAM_SIZE);
        self
    }

    /// 当前是否启用广播。
    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// 将配置应用到实际套接字。
    fn apply(&self, sock: &StdUdpSocket) -> io::Result<()> {
        sock.set_broadcast(self.broadcast)?;
        Ok(())
    }
}

/// UDP 传输错误。
#[derive(Debug, Error)]
pub enum UdpError {
    /// 绑定失败。
    #[error("无法绑定 UDP 套接字到 {addr}: {source}")]
    Bind {
        addr: TransportSocketAddr,
        #[source]
        source: io::Error,
    },
    /// 关联远端失败。
    #[error("无法关联 UDP 对端 {peer}: {source}")]
    Associate {
        peer: TransportSocketAddr,
        #[source]
        source: io::Error,
    },
    /// 设置套接字选项失败。
    #[error("配置 UDP 套接字失败: {0}")]
    Configure(#[source] io::Error),
    /// 查询本地地址失败。
    #[error("无法获取 UDP 套接字本地地址: {0}")]
    LocalAddr(#[source] io::Error),
    /// 报文超过配置上限。
    #[error("UDP 报文过大: {len} 字节，上限 {max} 字节")]
    Oversized { len: usize, max: usize },
    /// 收发任务已退出。
    #[error("UDP 套接字已关闭")]
    Closed,
}

impl UdpError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            UdpError::Bind { .. } => "spark.transport.udp.bind_failed",
            UdpError::Associate { .. } => "spark.transport.udp.associate_failed",
            UdpError::Configure(_) => "spark.transport.udp.configure_failed",
            UdpError::LocalAddr(_) => "spark.transport.udp.local_addr_failed",
            UdpError::Oversized { .. } => "spark.transport.udp.oversized",
            UdpError::Closed => "spark.transport.udp.write_failed",
        }
    }
}

impl From<UdpError> for LinkError {
    fn from(err: UdpError) -> Self {
        let code = err.code();
        match err {
            UdpError::Bind { source, .. } => LinkError::io(code, "udp bind", source),
            UdpError::Associate { source, .. } => LinkError::io(code, "udp connect", source),
            UdpError::Configure(source) => LinkError::io(code, "udp configure", source),
            UdpError::LocalAddr(source) => LinkError::io(code, "udp local_addr", source),
            oversized @ UdpError::Oversized { .. } => {
                LinkError::new(code, oversized.to_string(), ErrorCategory::NonRetryable)
            }
            UdpError::Closed => LinkError::closed(code, "udp write"),
        }
    }
}

/// 已绑定、尚未开始收发的 UDP 端点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 报文监听没有“接受连接”的概念：绑定完成即可收包，因此端点必须在观察者就绪后再启动；
/// - 记录运行时 [`Handle`]，使 `start` 可以在任意线程调用。
///
/// ## 契约（What）
/// - `bind` / `open` 均为同步调用，不需要处于运行时上下文；
/// - `associated_peer` 仅在 `open(.., associate = true, ..)` 时为 `Some`；
/// - 端点在 `start` 之前被丢弃时，套接字随之关闭。
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: StdUdpSocket,
    local_addr: TransportSocketAddr,
    peer: Option<TransportSocketAddr>,
    options: UdpSocketOptions,
    runtime: Handle,
}

impl UdpEndpoint {
    /// 绑定到指定地址；端口 `0` 表示由系统分配。
    pub fn bind(
        local: TransportSocketAddr,
        options: UdpSocketOptions,
        runtime: Handle,
    ) -> Result<Self, UdpError> {
        let socket = StdUdpSocket::bind(SocketAddr::from(local)).map_err(|source| {
            UdpError::Bind {
                addr: local,
                source,
            }
        })?;
        Self::from_socket(socket, None, options, runtime)
    }

    /// 为出站通道打开临时端口；`associate` 为真时把套接字关联到 `remote`。
    ///
    /// 报文传输没有握手，该调用不验证远端是否可达。
    pub fn open(
        remote: TransportSocketAddr,
        options: UdpSocketOptions,
        associate: bool,
        runtime: Handle,
    ) -> Result<Self, UdpError> {
        let local = remote.unspecified_like();
        let socket = StdUdpSocket::bind(SocketAddr::from(local)).map_err(|source| {
            UdpError::Bind {
                addr: local,
                source,
            }
        })?;
        let peer = if associate {
            socket
                .connect(SocketAddr::from(remote))
                .map_err(|source| UdpError::Associate {
                    peer: remote,
                    source,
                })?;
            Some(remote)
        } else {
            None
        };
        Self::from_socket(socket, peer, options, runtime)
    }

    fn from_socket(
        socket: StdUdpSocket,
        peer: Option<TransportSocketAddr>,
        options: UdpSocketOptions,
        runtime: Handle,
    ) -> Result<Self, UdpError> {
        let local = socket.local_addr().map_err(UdpError::LocalAddr)?;
        options.apply(&socket).map_err(UdpError::Configure)?;
        socket.set_nonblocking(true).map_err(UdpError::Configure)?;
        Ok(Self {
            socket,
            local_addr: TransportSocketAddr::from(local),
            peer,
            options,
            runtime,
        })
    }

    pub fn options(&self) -> &UdpSocketOptions {
        &self.options
    }
}

impl PendingDatagram for UdpEndpoint {
    fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    fn associated_peer(&self) -> Option<TransportSocketAddr> {
        self.peer
    }

    fn start(
        self: Box<Self>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<dyn DatagramConnection> {
        let UdpEndpoint {
            socket,
            local_addr,
            peer,
            options,
            runtime,
        } = *self;
        let (tx, rx) = mpsc::unbounded_channel();
        let (guard, waiter) = release_latch();
        runtime.spawn(drive(
            socket,
            observer,
            rx,
            guard,
            local_addr,
            peer.map(SocketAddr::from),
            options.max_datagram_size(),
        ));
        Arc::new(UdpConnection {
            tx,
            closed: AtomicBool::new(false),
            released: waiter,
            local_addr,
            max_datagram_size: options.max_datagram_size(),
        })
    }
}

enum Outbound {
    Datagram(Bytes, SocketAddr),
    Close,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Datagram(bytes, to) => write!(f, "Datagram({} bytes -> {to})", bytes.len()),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

/// 已启动的 UDP 收发句柄。
#[derive(Debug)]
pub struct UdpConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    released: ReleaseWaiter,
    local_addr: TransportSocketAddr,
    max_datagram_size: usize,
}

impl UdpConnection {
    fn enqueue(&self, data: Bytes, to: TransportSocketAddr) -> Result<usize, UdpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UdpError::Closed);
        }
        let len = data.len();
        if len > self.max_datagram_size {
            return Err(UdpError::Oversized {
                len,
                max: self.max_datagram_size,
            });
        }
        self.tx
            .send(Outbound::Datagram(data, SocketAddr::from(to)))
            .map_err(|_| UdpError::Closed)?;
        Ok(len)
    }
}

impl DatagramConnection for UdpConnection {
    fn write_datagram(&self, data: Bytes, to: TransportSocketAddr) -> Result<usize, LinkError> {
        self.enqueue(data, to).map_err(LinkError::from)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn wait_released(&self, timeout: Duration) -> bool {
        self.released.wait(timeout)
    }

    fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }
}

async fn drive(
    socket: StdUdpSocket,
    observer: Arc<dyn ConnectionObserver>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    guard: ReleaseGuard,
    local: TransportSocketAddr,
    peer: Option<SocketAddr>,
    max_datagram_size: usize,
) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(code = "spark.transport.udp.configure_failed", local = %local, error = %err, "udp socket could not be registered");
            observer.on_closed();
            drop(guard);
            return;
        }
    };
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        tokio::select! {
            biased;
            outbound = rx.recv() => match outbound {
                Some(Outbound::Datagram(data, to)) => {
                    let sent = if peer == Some(to) {
                        socket.send(&data).await
                    } else {
                        socket.send_to(&data, to).await
                    };
                    if let Err(err) = sent {
                        warn!(code = "spark.transport.udp.write_failed", local = %local, to = %to, error = %err, "udp send failed");
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    trace!(local = %local, from = %from, bytes = n, "udp datagram received");
                    observer.on_datagram(Bytes::copy_from_slice(&buf[..n]), TransportSocketAddr::from(from));
                }
                // 已关联的套接字会把 ICMP 端口不可达报告为接收错误，继续收包即可。
                Err(err) => {
                    debug!(code = "spark.transport.udp.read_failed", local = %local, error = %err, "udp receive error");
                    tokio::time::sleep(RECV_BACKOFF).await;
                }
            },
        }
    }
    rx.close();
    drop(socket);
    debug!(local = %local, "udp socket released");
    observer.on_closed();
    drop(guard);
}
