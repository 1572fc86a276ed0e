//! 出站建连：把异步的连接建立表达为恰好一次的显式结果。

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use spark_transport::{
    DatagramOutcome, StreamOutcome, TransportKind, TransportProvider, TransportSocketAddr,
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::channel::{Channel, ChannelCore, ChannelState, DatagramOwner};
use crate::error::ChannelError;

/// 出站连接器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 建连请求可能来自任意线程，真正的连接在事件循环上发生；连接器只负责把请求投递出去，
///   并把结果包装成通道交还调用方；
/// - 失败必须可观测：字节流建连失败以 [`ChannelError::ConnectFailed`] 交付，而不是“回调永不触发”。
///
/// ## 契约（What）
/// - 目标地址为 `target:port`，`target` 取自配置 `server.listen_iface`；
/// - 字节流：传输层完成连接后交付 `Active` 通道；
/// - 报文：本地临时套接字打开即交付，通道对端地址已预置为目标，
///   是否 `connect` 关联由传输实现的配置决定；
/// - 返回 `Ok` 表示请求已被受理，结果稍后恰好交付一次；返回 `Err` 时不会交付任何结果。
pub struct Connector {
    provider: Arc<dyn TransportProvider>,
    target: IpAddr,
}

impl Connector {
    pub fn new(provider: Arc<dyn TransportProvider>, target: IpAddr) -> Self {
        Self { provider, target }
    }

    /// 发起建连，返回可等待的 [`OpenRequest`]。
    pub fn open(&self, kind: TransportKind, port: u16) -> Result<OpenRequest, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.open_with(kind, port, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(OpenRequest { rx, done: false })
    }

    /// 发起建连，结果交给 `on_ready`（在事件循环线程上调用，恰好一次）。
    pub fn open_with<F>(&self, kind: TransportKind, port: u16, on_ready: F) -> Result<(), ChannelError>
    where
        F: FnOnce(Result<Channel, ChannelError>) + Send + 'static,
    {
        let remote = TransportSocketAddr::new(self.target, port);
        debug!(kind = %kind, remote = %remote, "opening outbound channel");
        let posted = match kind {
            TransportKind::Stream => {
                let outcome: StreamOutcome = Box::new(move |result| {
                    let delivered = match result {
                        Ok(pending) => {
                            let core = ChannelCore::new(TransportKind::Stream);
                            let conn = pending.start(core.clone());
                            Ok(Channel::stream(core, conn, ChannelState::Active))
                        }
                        Err(source) => {
                            debug!(remote = %remote, code = source.code(), error = %source, "outbound stream connect failed");
                            Err(ChannelError::ConnectFailed { remote, source })
                        }
                    };
                    on_ready(delivered);
                });
                self.provider.connect_stream(remote, outcome)
            }
            TransportKind::Datagram => {
                let outcome: DatagramOutcome = Box::new(move |result| {
                    let delivered = match result {
                        Ok(pending) => {
                            let core = ChannelCore::new(TransportKind::Datagram);
                            core.set_remote(pending.associated_peer().unwrap_or(remote));
                            let conn = pending.start(core.clone());
                            Ok(Channel::datagram(
                                core,
                                conn,
                                DatagramOwner::Exclusive,
                                ChannelState::Active,
                            ))
                        }
                        Err(source) => {
                            debug!(remote = %remote, code = source.code(), error = %source, "outbound datagram socket failed");
                            Err(ChannelError::ConnectFailed { remote, source })
                        }
                    };
                    on_ready(delivered);
                });
                self.provider.connect_datagram(remote, outcome)
            }
        };
        posted.map_err(|_| ChannelError::EventLoopStopped)
    }
}

/// 一次出站建连的受理凭证，恰好解析为一个结果。
///
/// - 作为 `Future` 等待（任意运行时）；
/// - [`OpenRequest::try_take`] 非阻塞查询；
/// - [`OpenRequest::wait`] 在普通线程上阻塞等待。
///
/// 传输层在交付结果前退出时解析为 [`ChannelError::Cancelled`]。
#[derive(Debug)]
pub struct OpenRequest {
    rx: oneshot::Receiver<Result<Channel, ChannelError>>,
    done: bool,
}

impl OpenRequest {
    /// 结果已就绪时取出；尚未就绪，或结果已被取走，返回 `None`。
    pub fn try_take(&mut self) -> Option<Result<Channel, ChannelError>> {
        if self.done {
            return None;
        }
        let taken = match self.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(ChannelError::Cancelled),
        };
        self.done = true;
        Some(taken)
    }

    /// 阻塞当前线程直到结果就绪。
    ///
    /// 不得在异步上下文中调用（与 `tokio::sync::oneshot::Receiver::blocking_recv` 的前置条件相同），
    /// 异步代码应直接 `.await`。
    pub fn wait(self) -> Result<Channel, ChannelError> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(ChannelError::Cancelled))
    }
}

impl Future for OpenRequest {
    type Output = Result<Channel, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(ChannelError::Cancelled));
        }
        let polled = Pin::new(&mut self.rx).poll(cx);
        polled.map(|received| {
            self.done = true;
            received.unwrap_or_else(|_| Err(ChannelError::Cancelled))
        })
    }
}
