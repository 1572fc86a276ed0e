use std::sync::Arc;

use crate::{LinkError, ListenerHandle, PendingDatagram, PendingStream, TransportSocketAddr};

/// 入站字节流连接到达时的回调，运行在事件循环线程上。
pub type AcceptFn = Arc<dyn Fn(Box<dyn PendingStream>) + Send + Sync>;

/// 出站字节流建连结果回调，恰好调用一次。
pub type StreamOutcome = Box<dyn FnOnce(Result<Box<dyn PendingStream>, LinkError>) + Send>;

/// 出站报文套接字打开结果回调，恰好调用一次。
pub type DatagramOutcome = Box<dyn FnOnce(Result<Box<dyn PendingDatagram>, LinkError>) + Send>;

/// 事件循环传输提供方。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“非阻塞建连、监听、写、关闭”这组事件循环原语收敛为一个对象安全的 trait，
///   通道层据此工作，而不关心背后是 Tokio 还是测试用的内存实现；
/// - 建连结果通过显式的 `Result` 回调返回，失败同样可观测。
///
/// ## 契约（What）
/// - 所有方法都可以从任意线程调用；实现负责把需要事件循环上下文的工作投递到循环线程；
/// - `connect_stream` / `connect_datagram` 立即返回：`Ok(())` 表示请求已被事件循环受理，
///   `outcome` 稍后在循环线程上恰好调用一次；`Err` 表示请求无法投递（分类 `Closed`），`outcome` 不会被调用；
///   受理后若事件循环在执行前退出，`outcome` 会被丢弃而不调用（调用方应将其视为取消）；
/// - `connect_datagram` 只在本地打开临时套接字，从不验证远端可达性；
/// - `listen_stream` / `listen_datagram` 同步完成绑定，端口冲突以 [`LinkError`]
///   （分类 `AddrInUse`）返回；`listen_stream` 之后每个入站连接都会调用一次 `on_accept`。
pub trait TransportProvider: Send + Sync + 'static {
    fn connect_stream(
        &self,
        remote: TransportSocketAddr,
        outcome: StreamOutcome,
    ) -> Result<(), LinkError>;

    fn connect_datagram(
        &self,
        remote: TransportSocketAddr,
        outcome: DatagramOutcome,
    ) -> Result<(), LinkError>;

    fn listen_stream(
        &self,
        local: TransportSocketAddr,
        on_accept: AcceptFn,
    ) -> Result<Box<dyn ListenerHandle>, LinkError>;

    fn listen_datagram(
        &self,
        local: TransportSocketAddr,
    ) -> Result<Box<dyn PendingDatagram>, LinkError>;

    /// 同步执行回调、没有独立 I/O 线程的实现保持默认值。
    fn on_io_thread(&self) -> bool {
        false
    }
}
