use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::{LinkError, TransportSocketAddr};

/// 传输提供方向上层投递事件的回调目标。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对应事件循环里的 `onBytesReceived` / `onDatagramReceived`：I/O 任务读到数据后立即推送，
///   不等待调用方轮询；
/// - 观察者在端点启动之前就已存在，因此“连接建立后立刻到达的首批字节”不会丢失。
///
/// ## 契约（What）
/// - 回调运行在事件循环线程上，必须快速返回，不得阻塞；
/// - 同一连接的 `on_bytes` 调用按网络到达顺序串行发生；
/// - `on_closed` 在读方向结束（EOF、错误或主动关闭）后至多调用一次。
pub trait ConnectionObserver: Send + Sync + 'static {
    /// 字节流数据到达。
    fn on_bytes(&self, chunk: Bytes);

    /// 报文到达，`from` 为发送方地址。默认实现忽略来源。
    fn on_datagram(&self, chunk: Bytes, from: TransportSocketAddr) {
        let _ = from;
        self.on_bytes(chunk);
    }

    /// 读方向结束。
    fn on_closed(&self) {}
}

/// 已启动的字节流连接句柄。
///
/// - `write` 只负责把数据交给 I/O 任务的有序写队列，返回入队的字节数；真正的写出异步完成，
///   失败只会体现在日志与后续 `write` 的 `Closed` 错误上；
/// - `close_gracefully` 先冲刷已入队的数据，再半关闭写方向并停止读取；重复调用无副作用。
pub trait StreamConnection: Send + Sync + fmt::Debug + 'static {
    fn write(&self, data: Bytes) -> Result<usize, LinkError>;

    fn close_gracefully(&self);

    fn local_addr(&self) -> TransportSocketAddr;

    fn peer_addr(&self) -> TransportSocketAddr;
}

/// 已启动的报文套接字句柄。
pub trait DatagramConnection: Send + Sync + fmt::Debug + 'static {
    /// 将一个报文排队发往 `to`。
    fn write_datagram(&self, data: Bytes, to: TransportSocketAddr) -> Result<usize, LinkError>;

    /// 停止收发并释放底层套接字，可重复调用。
    fn close(&self);

    /// 阻塞等待套接字真正释放，超时返回 `false`。
    ///
    /// 会阻塞当前线程，调用方负责避免在事件循环线程上调用。
    fn wait_released(&self, timeout: Duration) -> bool;

    fn local_addr(&self) -> TransportSocketAddr;
}

/// 已建立但尚未开始收发的字节流端点。
///
/// 通道层先创建缓冲（观察者），再调用 [`PendingStream::start`]，从而保证观察者先于首个字节就位。
pub trait PendingStream: Send + 'static {
    fn local_addr(&self) -> TransportSocketAddr;

    fn peer_addr(&self) -> TransportSocketAddr;

    /// 启动读泵与写队列，返回连接句柄。
    fn start(self: Box<Self>, observer: Arc<dyn ConnectionObserver>) -> Arc<dyn StreamConnection>;
}

/// 已绑定但尚未开始收发的报文端点。
pub trait PendingDatagram: Send + 'static {
    fn local_addr(&self) -> TransportSocketAddr;

    /// 若套接字已与某个对端关联（`connect`），返回该对端。
    fn associated_peer(&self) -> Option<TransportSocketAddr>;

    fn start(
        self: Box<Self>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<dyn DatagramConnection>;
}
