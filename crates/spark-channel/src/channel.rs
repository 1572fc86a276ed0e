//! # Channel：单条传输端点之上的缓冲通道
//!
//! ## 核心意图（Why）
//! - 事件循环线程推送字节（生产者），协议引擎线程收取、窥视、回滚与发送（消费者），
//!   两侧在同一把互斥锁下操作缓冲，交错时也保持一致；
//! - 字节流与报文共享同一套接口，差异只体现在发送目标与关闭行为上。
//!
//! ## 行为契约（What）
//! - `recv` 原子地取走整个缓冲并记为 `last_consumed`；
//! - `rollback(0)` 把整段 `last_consumed` 放回缓冲前部，`rollback(n)` 只放回其末尾 `n` 字节，
//!   `n` 超出长度时退化为整段；回滚不清除 `last_consumed`，连续两次回滚会重复放回；
//! - `close` 只把状态推进到终态一次，之后 `send` 返回 [`ChannelError::Closed`]，缓冲读取仍可用。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng;
use spark_transport::{
    ConnectionObserver, DatagramConnection, StreamConnection, TransportKind, TransportSocketAddr,
};
use tracing::{debug, trace};

use crate::error::ChannelError;

/// 通道标识：创建时随机生成的 4 字节，仅用于识别与日志。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 4]);

impl ChannelId {
    pub(crate) fn random() -> Self {
        Self(rand::rng().random())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}

/// 通道生命周期：入站通道在队列中为 `Pending`，被收取后为 `Active`；出站通道直接 `Active`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Pending = 0,
    Active = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Pending,
            1 => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }
}

#[derive(Default)]
struct RecvBuffer {
    pending: BytesMut,
    last_consumed: Bytes,
}

impl RecvBuffer {
    fn append(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn take(&mut self) -> Bytes {
        let taken = self.pending.split().freeze();
        self.last_consumed = taken.clone();
        taken
    }

    fn peek(&self) -> Bytes {
        Bytes::copy_from_slice(&self.pending)
    }

    fn rollback(&mut self, n: usize) {
        let consumed = &self.last_consumed;
        let restore = if n == 0 || n >= consumed.len() {
            consumed.clone()
        } else {
            consumed.slice(consumed.len() - n..)
        };
        if restore.is_empty() {
            return;
        }
        let mut rebuilt = BytesMut::with_capacity(restore.len() + self.pending.len());
        rebuilt.extend_from_slice(&restore);
        rebuilt.extend_from_slice(&self.pending);
        self.pending = rebuilt;
    }
}

/// 通道中由 I/O 回调写入的部分：标识、缓冲与最近对端。
///
/// 它就是交给传输层的观察者，因此先于端点启动存在，首批字节不会丢失。
pub(crate) struct ChannelCore {
    id: ChannelId,
    kind: TransportKind,
    buffer: Mutex<RecvBuffer>,
    remote: Mutex<Option<TransportSocketAddr>>,
}

impl ChannelCore {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::random(),
            kind,
            buffer: Mutex::new(RecvBuffer::default()),
            remote: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn set_remote(&self, remote: TransportSocketAddr) {
        *self.remote.lock() = Some(remote);
    }

    fn append(&self, chunk: &[u8]) {
        self.buffer.lock().append(chunk);
    }
}

impl ConnectionObserver for ChannelCore {
    fn on_bytes(&self, chunk: Bytes) {
        trace!(channel = %self.id, bytes = chunk.len(), "bytes received");
        self.append(&chunk);
    }

    fn on_datagram(&self, chunk: Bytes, from: TransportSocketAddr) {
        trace!(channel = %self.id, bytes = chunk.len(), remote = %from, "datagram received");
        // 对端地址与载荷在同一把缓冲锁下更新，收取方看到的地址总与最新载荷匹配。
        let mut buffer = self.buffer.lock();
        *self.remote.lock() = Some(from);
        buffer.append(&chunk);
    }

    fn on_closed(&self) {
        debug!(channel = %self.id, kind = %self.kind, "transport read side ended");
    }
}

/// 入站报文套接字的持有方；通道关闭时通知它解绑并补充新通道。
pub(crate) trait DatagramRelease: Send + Sync {
    fn release(&self, id: ChannelId);
}

#[derive(Clone)]
pub(crate) enum DatagramOwner {
    /// 出站通道独占套接字，关闭即释放。
    Exclusive,
    /// 入站通道共享监听套接字。
    Listener(Weak<dyn DatagramRelease>),
}

#[derive(Clone)]
enum Link {
    Stream(Arc<dyn StreamConnection>),
    Datagram {
        conn: Arc<dyn DatagramConnection>,
        owner: DatagramOwner,
    },
}

struct ChannelInner {
    core: Arc<ChannelCore>,
    state: AtomicU8,
    link: Link,
}

/// 缓冲的双向逻辑连接，背后是一条 TCP 流或一个 UDP 关联。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 协议引擎按“收取 → 试解析 → 回滚多读部分”的节奏消费字节，`rollback` 让试探式解析无需自备缓冲；
/// - 句柄可廉价克隆，注册表队列与调用方可以同时持有同一通道。
///
/// ## 契约（What）
/// - 所有缓冲操作在通道自己的互斥锁内执行，可与事件循环线程的追加并发进行；
/// - `send` 对字节流写入连接，对报文发往最近一次得知的对端；返回排队的字节数，
///   写出失败异步发生，本层不报告部分写；
/// - `close` 对字节流请求优雅关闭（先冲刷已排队数据），对出站报文释放本地套接字，
///   对入站报文从监听套接字上解绑。
///
/// ## 注意事项（Trade-offs）
/// - 句柄全部被丢弃等同于放弃连接：字节流写队列随之关闭。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.channel_id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn stream(
        core: Arc<ChannelCore>,
        conn: Arc<dyn StreamConnection>,
        state: ChannelState,
    ) -> Self {
        Self::with_link(core, Link::Stream(conn), state)
    }

    pub(crate) fn datagram(
        core: Arc<ChannelCore>,
        conn: Arc<dyn DatagramConnection>,
        owner: DatagramOwner,
        state: ChannelState,
    ) -> Self {
        Self::with_link(core, Link::Datagram { conn, owner }, state)
    }

    fn with_link(core: Arc<ChannelCore>, link: Link, state: ChannelState) -> Self {
        debug!(channel = %core.id, kind = %core.kind, "channel created");
        Self {
            inner: Arc::new(ChannelInner {
                core,
                state: AtomicU8::new(state as u8),
                link,
            }),
        }
    }

    /// 从队列中被收取时调用：`Pending → Active`，其余状态不变。
    pub(crate) fn activate(&self) {
        let _ = self.inner.state.compare_exchange(
            ChannelState::Pending as u8,
            ChannelState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// 追加新到达的字节；线程安全，可与 `recv`/`peek`/`rollback` 并发调用。
    pub fn append_to_buffer(&self, chunk: &[u8]) {
        self.inner.core.append(chunk);
    }

    /// 取走当前缓冲的全部字节。
    pub fn recv(&self) -> Bytes {
        self.inner.core.buffer.lock().take()
    }

    /// 返回当前缓冲的副本，不消费。
    pub fn peek(&self) -> Bytes {
        self.inner.core.buffer.lock().peek()
    }

    /// 把上一次 `recv` 的结果（`n == 0`）或其末尾 `n` 字节放回缓冲前部。
    pub fn rollback(&self, n: usize) {
        self.inner.core.buffer.lock().rollback(n);
    }

    /// 发送数据，返回交给传输层的字节数。
    pub fn send(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let id = self.channel_id();
        if self.is_closed() {
            return Err(ChannelError::Closed { id });
        }
        let payload = Bytes::copy_from_slice(data);
        match &self.inner.link {
            Link::Stream(conn) => conn
                .write(payload)
                .map_err(|source| ChannelError::Write { id, source }),
            Link::Datagram { conn, .. } => {
                let remote = (*self.inner.core.remote.lock()).ok_or(ChannelError::NoPeer { id })?;
                conn.write_datagram(payload, remote)
                    .map_err(|source| ChannelError::Write { id, source })
            }
        }
    }

    /// 与 [`Channel::send`] 相同；传输层内部缓冲，不需要分块循环。
    pub fn send_all(&self, data: &[u8]) -> Result<usize, ChannelError> {
        self.send(data)
    }

    /// 关闭通道，重复调用无副作用。
    pub fn close(&self) {
        let previous = self
            .inner
            .state
            .swap(ChannelState::Closed as u8, Ordering::AcqRel);
        if previous == ChannelState::Closed as u8 {
            return;
        }
        match &self.inner.link {
            Link::Stream(conn) => conn.close_gracefully(),
            Link::Datagram {
                conn,
                owner: DatagramOwner::Exclusive,
            } => conn.close(),
            Link::Datagram {
                owner: DatagramOwner::Listener(listener),
                ..
            } => {
                if let Some(listener) = listener.upgrade() {
                    listener.release(self.channel_id());
                }
            }
        }
        debug!(channel = %self.channel_id(), kind = %self.kind(), "channel closed");
    }

    pub fn is_alive(&self) -> bool {
        !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.core.id
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.core.kind
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// 本地套接字地址。
    pub fn local_addr(&self) -> TransportSocketAddr {
        match &self.inner.link {
            Link::Stream(conn) => conn.local_addr(),
            Link::Datagram { conn, .. } => conn.local_addr(),
        }
    }

    /// 报文通道最近一次得知的对端；字节流通道恒为 `None`。
    pub fn remote_addr(&self) -> Option<TransportSocketAddr> {
        match self.kind() {
            TransportKind::Datagram => *self.inner.core.remote.lock(),
            TransportKind::Stream => None,
        }
    }
}
