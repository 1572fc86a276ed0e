//! # ChannelRegistry：入站注册表与监听管理
//!
//! ## 核心意图（Why）
//! - 端口 → 监听句柄、端口 → 未收取通道队列，两张表由同一把互斥锁保护，
//!   “检查后插入”的幂等监听与“弹出队首”的收取都是原子的；
//! - 注册表是显式构造的对象，没有模块级全局状态。
//!
//! ## 行为契约（What）
//! - `start_listener`：端口已有同类监听时直接返回该端口；端口 0 总是新建临时端口监听；
//! - `accept_new_channel`：必要时先启动监听，再非阻塞地弹出最早到达的通道；
//! - `stop_accepting_new_channels`：移除监听、停止套接字，并关闭队列中所有未收取的通道；
//!   已被收取的通道不受影响；
//! - 每次启动监听分配新的代号，已停止监听的迟到连接会被直接关闭，不会进入新队列。
//!
//! ## 风险提示（Trade-offs）
//! - 持锁期间会调用传输层的同步绑定；绑定本身不等待事件循环，因此不会与 I/O 回调互相阻塞；
//! - 队列中的通道在锁外关闭，关闭回调可以安全地重新进入注册表。

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_transport::{
    AcceptFn, ConnectionObserver, DatagramConnection, ListenerHandle, PendingStream,
    TransportKind, TransportProvider, TransportSocketAddr,
};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelCore, ChannelId, ChannelState, DatagramOwner, DatagramRelease};
use crate::error::ChannelError;

enum ListenerSlot {
    Stream(Box<dyn ListenerHandle>),
    Datagram(Arc<DatagramDispatch>),
}

impl ListenerSlot {
    fn stop(&self) {
        match self {
            ListenerSlot::Stream(handle) => handle.stop_listening(),
            ListenerSlot::Datagram(dispatch) => dispatch.shutdown(),
        }
    }

    fn wait_released(&self, timeout: Duration) -> bool {
        match self {
            ListenerSlot::Stream(handle) => handle.wait_released(timeout),
            ListenerSlot::Datagram(dispatch) => dispatch.wait_released(timeout),
        }
    }
}

struct ListenerEntry {
    kind: TransportKind,
    generation: u64,
    slot: ListenerSlot,
}

#[derive(Default)]
struct RegistryState {
    listeners: HashMap<u16, ListenerEntry>,
    inbound: HashMap<u16, VecDeque<Channel>>,
}

/// 注册表中会被 I/O 回调访问的部分。
pub(crate) struct RegistryShared {
    state: Mutex<RegistryState>,
}

impl RegistryShared {
    /// 若 `port` 上仍是 `generation` 代的监听，则把通道放入队尾。
    fn enqueue(&self, port: u16, generation: u64, channel: Channel) -> Result<(), Channel> {
        let mut state = self.state.lock();
        let current = state
            .listeners
            .get(&port)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return Err(channel);
        }
        debug!(channel = %channel.channel_id(), port, "inbound channel queued");
        state.inbound.entry(port).or_default().push_back(channel);
        Ok(())
    }
}

/// 入站注册表 + 监听管理器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对应协议引擎视角下的“某端口上的收件箱”：事件循环线程把新连接包装为通道放入队列，
///   调用方线程按 FIFO 取走；
/// - 监听生命周期为 `absent → listening → absent`，停止后再次启动得到全新的监听与空队列。
///
/// ## 契约（What）
/// - 所有方法可从任意线程调用；
/// - 绑定失败以 [`ChannelError::BindConflict`] / [`ChannelError::Listen`] 返回，注册表状态不变；
/// - 端口已被另一种传输类型占用时返回 [`ChannelError::KindMismatch`]；
/// - 在事件循环线程以外停止监听时（包括其他 Tokio 运行时的工作线程），会有界等待套接字真正关闭，
///   随后即可在同一端口重新监听。
pub struct ChannelRegistry {
    provider: Arc<dyn TransportProvider>,
    iface: IpAddr,
    stop_timeout: Duration,
    shared: Arc<RegistryShared>,
    generations: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(provider: Arc<dyn TransportProvider>, iface: IpAddr, stop_timeout: Duration) -> Self {
        Self {
            provider,
            iface,
            stop_timeout,
            shared: Arc::new(RegistryShared {
                state: Mutex::new(RegistryState::default()),
            }),
            generations: AtomicU64::new(1),
        }
    }

    /// 确保 `port` 上存在 `kind` 类监听，返回实际绑定的端口。
    pub fn start_listener(&self, kind: TransportKind, port: u16) -> Result<u16, ChannelError> {
        let mut state = self.shared.state.lock();
        self.ensure_listener(&mut state, kind, port)
    }

    /// 非阻塞地取走 `port` 上最早到达的未收取通道；队列为空返回 `Ok(None)`。
    pub fn accept_new_channel(
        &self,
        kind: TransportKind,
        port: u16,
    ) -> Result<Option<Channel>, ChannelError> {
        if port == 0 {
            return Err(ChannelError::EphemeralAccept);
        }
        let channel = {
            let mut state = self.shared.state.lock();
            self.ensure_listener(&mut state, kind, port)?;
            state.inbound.get_mut(&port).and_then(VecDeque::pop_front)
        };
        if let Some(channel) = &channel {
            channel.activate();
            debug!(channel = %channel.channel_id(), port, kind = %kind, "inbound channel claimed");
        }
        Ok(channel)
    }

    /// 停止 `port` 上的监听并关闭所有未收取的通道；端口上没有监听时什么也不做。
    pub fn stop_accepting_new_channels(
        &self,
        kind: TransportKind,
        port: u16,
    ) -> Result<(), ChannelError> {
        if port == 0 {
            return Err(ChannelError::EphemeralAccept);
        }
        let (entry, drained) = {
            let mut state = self.shared.state.lock();
            if let Some(entry) = state.listeners.get(&port) {
                if entry.kind != kind {
                    return Err(ChannelError::KindMismatch {
                        port,
                        active: entry.kind,
                        requested: kind,
                    });
                }
            }
            let entry = state.listeners.remove(&port);
            let drained = state.inbound.remove(&port).unwrap_or_default();
            (entry, drained)
        };

        if let Some(entry) = &entry {
            entry.slot.stop();
        }
        let closed = drained.len();
        for channel in drained {
            channel.close();
        }
        if let Some(entry) = entry {
            debug!(port, kind = %kind, closed, "listener stopped");
            // 事件循环线程上等待会阻塞套接字自身的关闭。
            if !self.provider.on_io_thread() && !entry.slot.wait_released(self.stop_timeout) {
                warn!(port, timeout_ms = self.stop_timeout.as_millis() as u64, "listener socket not released before timeout");
            }
        }
        Ok(())
    }

    /// 当前处于监听状态的端口，升序。
    pub fn listening_ports(&self) -> Vec<u16> {
        let state = self.shared.state.lock();
        let mut ports: Vec<u16> = state.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// `port` 上等待收取的通道数。
    pub fn pending_len(&self, port: u16) -> usize {
        self.shared
            .state
            .lock()
            .inbound
            .get(&port)
            .map_or(0, VecDeque::len)
    }

    fn ensure_listener(
        &self,
        state: &mut RegistryState,
        kind: TransportKind,
        port: u16,
    ) -> Result<u16, ChannelError> {
        if port != 0 {
            if let Some(entry) = state.listeners.get(&port) {
                if entry.kind != kind {
                    return Err(ChannelError::KindMismatch {
                        port,
                        active: entry.kind,
                        requested: kind,
                    });
                }
                return Ok(port);
            }
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let local = TransportSocketAddr::new(self.iface, port);
        let (bound, slot, first) = match kind {
            TransportKind::Stream => {
                let handle = self
                    .provider
                    .listen_stream(local, self.accept_fn(generation))
                    .map_err(|source| ChannelError::from_listen(port, source))?;
                (handle.local_addr().port(), ListenerSlot::Stream(handle), None)
            }
            TransportKind::Datagram => {
                let pending = self
                    .provider
                    .listen_datagram(local)
                    .map_err(|source| ChannelError::from_listen(port, source))?;
                let bound = pending.local_addr().port();
                let dispatch = DatagramDispatch::new(bound, generation, Arc::downgrade(&self.shared));
                // 接收者先于套接字启动就位，首个报文不会落空。
                let core = dispatch.rebind();
                let observer: Arc<dyn ConnectionObserver> = dispatch.clone();
                dispatch.attach(pending.start(observer));
                let first = dispatch.channel_for(core);
                (bound, ListenerSlot::Datagram(dispatch), first)
            }
        };

        // TCP 与 UDP 端口空间独立，临时端口可能撞上另一种类型已占用的表项。
        if let Some(existing) = state.listeners.get(&bound) {
            let active = existing.kind;
            slot.stop();
            if let Some(first) = first {
                first.close();
            }
            return Err(ChannelError::KindMismatch {
                port: bound,
                active,
                requested: kind,
            });
        }
        state.listeners.insert(
            bound,
            ListenerEntry {
                kind,
                generation,
                slot,
            },
        );
        let queue = state.inbound.entry(bound).or_default();
        if let Some(first) = first {
            queue.push_back(first);
        }
        debug!(port = bound, requested = port, kind = %kind, generation, "listener started");
        Ok(bound)
    }

    fn accept_fn(&self, generation: u64) -> AcceptFn {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |pending: Box<dyn PendingStream>| {
            let port = pending.local_addr().port();
            let core = ChannelCore::new(TransportKind::Stream);
            let conn = pending.start(core.clone());
            let channel = Channel::stream(core, conn, ChannelState::Pending);
            let Some(shared) = shared.upgrade() else {
                channel.close();
                return;
            };
            if let Err(late) = shared.enqueue(port, generation, channel) {
                debug!(channel = %late.channel_id(), port, "listener already stopped, closing late connection");
                late.close();
            }
        })
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        let (entries, queues) = {
            let mut state = self.shared.state.lock();
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.inbound),
            )
        };
        for entry in entries.values() {
            entry.slot.stop();
        }
        for channel in queues.into_values().flatten() {
            channel.close();
        }
    }
}

/// 入站报文监听套接字的分发器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 报文监听没有“每连接一个套接字”，整个套接字由一个通道代表；
/// - 该通道被收取、使用并关闭后，监听仍在，分发器立即为同一套接字补充一个新通道排队，
///   协议引擎可以循环“收取 → 服务 → 关闭”。
///
/// ## 契约（What）
/// - 收到的报文交给当前绑定的通道：先更新其对端地址，再追加载荷；
/// - 没有绑定通道时（补充前的短暂窗口）报文被丢弃并记录警告；
/// - `shutdown` 后不再补充，套接字关闭。
pub(crate) struct DatagramDispatch {
    port: u16,
    generation: u64,
    conn: OnceLock<Arc<dyn DatagramConnection>>,
    current: Mutex<Option<Arc<ChannelCore>>>,
    stopped: AtomicBool,
    registry: Weak<RegistryShared>,
    this: Weak<DatagramDispatch>,
}

impl DatagramDispatch {
    fn new(port: u16, generation: u64, registry: Weak<RegistryShared>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            port,
            generation,
            conn: OnceLock::new(),
            current: Mutex::new(None),
            stopped: AtomicBool::new(false),
            registry,
            this: this.clone(),
        })
    }

    fn attach(&self, conn: Arc<dyn DatagramConnection>) {
        let _ = self.conn.set(conn);
    }

    /// 创建新的接收缓冲并绑定为当前接收者。
    fn rebind(&self) -> Arc<ChannelCore> {
        let core = ChannelCore::new(TransportKind::Datagram);
        *self.current.lock() = Some(core.clone());
        core
    }

    fn channel_for(&self, core: Arc<ChannelCore>) -> Option<Channel> {
        let conn = self.conn.get()?.clone();
        let owner: Weak<dyn DatagramRelease> = self.this.clone();
        Some(Channel::datagram(
            core,
            conn,
            DatagramOwner::Listener(owner),
            ChannelState::Pending,
        ))
    }

    fn current(&self) -> Option<Arc<ChannelCore>> {
        self.current.lock().clone()
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.current.lock().take();
        if let Some(conn) = self.conn.get() {
            conn.close();
        }
    }

    fn wait_released(&self, timeout: Duration) -> bool {
        self.conn
            .get()
            .is_none_or(|conn| conn.wait_released(timeout))
    }
}

impl ConnectionObserver for DatagramDispatch {
    fn on_bytes(&self, chunk: Bytes) {
        match self.current() {
            Some(core) => core.on_bytes(chunk),
            None => warn!(port = self.port, bytes = chunk.len(), "datagram dropped, no channel attached"),
        }
    }

    fn on_datagram(&self, chunk: Bytes, from: TransportSocketAddr) {
        match self.current() {
            Some(core) => core.on_datagram(chunk, from),
            None => warn!(port = self.port, bytes = chunk.len(), remote = %from, "datagram dropped, no channel attached"),
        }
    }

    fn on_closed(&self) {
        debug!(port = self.port, "datagram listener socket closed");
    }
}

impl DatagramRelease for DatagramDispatch {
    fn release(&self, id: ChannelId) {
        {
            let mut current = self.current.lock();
            if current.as_ref().is_none_or(|core| core.id() != id) {
                return;
            }
            *current = None;
        }
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let core = self.rebind();
        let Some(fresh) = self.channel_for(core) else {
            return;
        };
        match registry.enqueue(self.port, self.generation, fresh) {
            Ok(()) => debug!(port = self.port, released = %id, "datagram listener re-armed"),
            Err(orphan) => {
                self.stopped.store(true, Ordering::Release);
                orphan.close();
            }
        }
    }
}
