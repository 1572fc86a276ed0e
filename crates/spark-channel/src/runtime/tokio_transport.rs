use std::sync::Arc;

use spark_transport::{
    AcceptFn, DatagramOutcome, ErrorCategory, LinkError, ListenerHandle, PendingDatagram,
    PendingStream, StreamOutcome, TransportProvider, TransportSocketAddr,
};
use spark_transport_tcp::{TcpListener, TcpSocketConfig};
use spark_transport_udp::{UdpEndpoint, UdpSocketOptions};
use tokio::runtime::Handle;

use crate::config::ChannelConfig;
use crate::runtime::EventLoop;

const LOOP_STOPPED: &str = "spark.channel.event_loop_stopped";

/// 基于 [`EventLoop`] 与 Tokio 套接字的传输提供方。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `spark-transport-tcp` / `spark-transport-udp` 的具体端点接到通道层的
///   [`TransportProvider`] 契约上；
/// - 需要运行时上下文的工作（建连、接受循环、临时报文套接字）全部以命令的形式投递到循环线程。
///
/// ## 契约（What）
/// - 监听在调用线程上同步绑定，端口冲突立即返回；接受循环随后在循环线程上启动；
/// - 出站报文套接字按 `udp.associate_peer` 决定是否关联目标；
/// - 事件循环已停止时，所有方法返回分类为 `Closed` 的 [`LinkError`]。
pub struct TokioTransport {
    event_loop: Arc<EventLoop>,
    tcp: TcpSocketConfig,
    udp: UdpSocketOptions,
    associate_peer: bool,
}

impl TokioTransport {
    pub fn new(event_loop: Arc<EventLoop>, config: &ChannelConfig) -> Self {
        Self {
            event_loop,
            tcp: config.tcp.to_socket_config(),
            udp: config.udp.to_socket_options(),
            associate_peer: config.udp.associate_peer,
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    fn submit(&self, operation: &str, task: impl FnOnce() + Send + 'static) -> Result<(), LinkError> {
        self.event_loop
            .submit(task)
            .map_err(|_| loop_stopped(operation))
    }
}

fn loop_stopped(operation: &str) -> LinkError {
    LinkError::new(
        LOOP_STOPPED,
        format!("{operation}: event loop is not running"),
        ErrorCategory::Closed,
    )
}

impl TransportProvider for TokioTransport {
    fn connect_stream(
        &self,
        remote: TransportSocketAddr,
        outcome: StreamOutcome,
    ) -> Result<(), LinkError> {
        let config = self.tcp.clone();
        self.submit("tcp connect", move || {
            tokio::spawn(async move {
                let result = spark_transport_tcp::connect(remote, config)
                    .await
                    .map(|pending| Box::new(pending) as Box<dyn PendingStream>);
                outcome(result);
            });
        })
    }

    fn connect_datagram(
        &self,
        remote: TransportSocketAddr,
        outcome: DatagramOutcome,
    ) -> Result<(), LinkError> {
        let options = self.udp.clone();
        let associate = self.associate_peer;
        self.submit("udp open", move || {
            let result = UdpEndpoint::open(remote, options, associate, Handle::current())
                .map(|endpoint| Box::new(endpoint) as Box<dyn PendingDatagram>)
                .map_err(LinkError::from);
            outcome(result);
        })
    }

    fn listen_stream(
        &self,
        local: TransportSocketAddr,
        on_accept: AcceptFn,
    ) -> Result<Box<dyn ListenerHandle>, LinkError> {
        if !self.event_loop.is_running() {
            return Err(loop_stopped("tcp listen"));
        }
        let listener = TcpListener::bind(local, self.tcp.clone())?;
        let (handle, accept_loop) = listener.serve(on_accept);
        self.submit("tcp listen", move || {
            tokio::spawn(accept_loop.run());
        })?;
        Ok(Box::new(handle))
    }

    fn on_io_thread(&self) -> bool {
        self.event_loop.is_loop_thread()
    }

    fn listen_datagram(
        &self,
        local: TransportSocketAddr,
    ) -> Result<Box<dyn PendingDatagram>, LinkError> {
        if !self.event_loop.is_running() {
            return Err(loop_stopped("udp listen"));
        }
        let endpoint = UdpEndpoint::bind(local, self.udp.clone(), self.event_loop.handle())?;
        Ok(Box::new(endpoint))
    }
}
