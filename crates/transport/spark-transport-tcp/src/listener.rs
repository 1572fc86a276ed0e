use crate::{
    PendingTcpStream, TcpSocketConfig,
    error::{self, map_io_error},
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use spark_transport::{
    AcceptFn, LinkError, ListenerHandle, ReleaseGuard, ReleaseWaiter, TransportKind,
    TransportSocketAddr, release_latch,
};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::Duration;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// 接受失败后的退避时长，避免 `EMFILE` 之类的持续错误把循环打满。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(20);

/// 已绑定、尚未开始接受连接的 TCP 监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 监听端口的分配必须对调用方同步可见：`bind` 返回时端口已经被占用，
///   冲突也在此刻暴露，而不是在事件循环里异步失败；
/// - 真正的 `accept` 循环需要 Tokio 反应器，因此与绑定拆开，由 [`TcpListener::serve`]
///   产出的 [`AcceptLoop`] 在事件循环线程上驱动。
///
/// ## 逻辑 (How)
/// - `bind`：用 `socket2` 创建套接字，按配置设置 `SO_REUSEADDR`，`bind` + `listen`
///   后切换为非阻塞并转换为标准库监听器；
/// - `serve`：创建停止信号与释放闩锁，分别交给句柄与循环。
///
/// ## 契约 (What)
/// - **前置条件**：`bind` 可以在任意线程调用，无需运行时；
/// - **后置条件**：`local_addr` 返回系统分配后的真实地址；
/// - **错误语义**：绑定失败返回 `spark.transport.tcp.bind_failed`，端口占用归类为 `AddrInUse`。
#[derive(Debug)]
pub struct TcpListener {
    inner: StdTcpListener,
    local_addr: TransportSocketAddr,
    config: TcpSocketConfig,
}

impl TcpListener {
    /// 同步绑定到指定地址。
    pub fn bind(addr: TransportSocketAddr, config: TcpSocketConfig) -> Result<Self, LinkError> {
        let socket_addr = SocketAddr::from(addr);
        let socket = Socket::new(
            Domain::for_address(socket_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .set_reuse_address(config.reuse_address())
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        socket
            .bind(&socket_addr.into())
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .listen(config.backlog_i32())
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let inner: StdTcpListener = socket.into();
        let local = inner
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok(Self {
            inner,
            local_addr: TransportSocketAddr::from(local),
            config,
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    /// 拆分为可跨线程持有的句柄与需要在运行时内驱动的接受循环。
    ///
    /// 每个入站连接以 [`PendingTcpStream`] 的形式交给 `on_accept`；若 `AcceptLoop`
    /// 从未被驱动就被丢弃，句柄同样会观察到“已释放”。
    pub fn serve(self, on_accept: AcceptFn) -> (TcpListenerHandle, AcceptLoop) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (guard, waiter) = release_latch();
        let handle = TcpListenerHandle {
            local_addr: self.local_addr,
            stop: Mutex::new(Some(stop_tx)),
            released: waiter,
        };
        let accept_loop = AcceptLoop {
            listener: self.inner,
            local_addr: self.local_addr,
            config: self.config,
            on_accept,
            stop: stop_rx,
            guard,
        };
        (handle, accept_loop)
    }
}

/// 接受循环，必须在 Tokio 运行时内 `await`。
pub struct AcceptLoop {
    listener: StdTcpListener,
    local_addr: TransportSocketAddr,
    config: TcpSocketConfig,
    on_accept: AcceptFn,
    stop: oneshot::Receiver<()>,
    guard: ReleaseGuard,
}

impl std::fmt::Debug for AcceptLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptLoop")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl AcceptLoop {
    /// 持续接受连接，直到句柄发出停止信号或被丢弃。
    pub async fn run(self) {
        let AcceptLoop {
            listener,
            local_addr,
            config,
            on_accept,
            mut stop,
            guard,
        } = self;
        let listener = match TokioTcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                let err = map_io_error(error::BIND, err);
                warn!(code = err.code(), local = %local_addr, error = %err, "tcp listener could not be registered");
                drop(guard);
                return;
            }
        };
        debug!(local = %local_addr, "tcp accept loop started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => match PendingTcpStream::from_stream(stream, config.clone()) {
                        Ok(pending) => (on_accept)(Box::new(pending)),
                        Err(err) => {
                            warn!(code = err.code(), local = %local_addr, error = %err, "dropping inbound tcp connection");
                        }
                    },
                    Err(err) => {
                        let err = map_io_error(error::ACCEPT, err);
                        warn!(code = err.code(), local = %local_addr, error = %err, "tcp accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        drop(listener);
        debug!(local = %local_addr, "tcp accept loop stopped");
        drop(guard);
    }
}

/// 监听句柄：停止信号 + 释放等待。
#[derive(Debug)]
pub struct TcpListenerHandle {
    local_addr: TransportSocketAddr,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    released: ReleaseWaiter,
}

impl ListenerHandle for TcpListenerHandle {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn local_addr(&self) -> TransportSocketAddr {
        self.local_addr
    }

    fn stop_listening(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }

    fn wait_released(&self, timeout: Duration) -> bool {
        self.released.wait(timeout)
    }
}
