//! 确定性的内存传输提供方。
//!
//! - 所有回调都在调用线程上同步执行，测试无需等待；
//! - `occupy` 模拟进程外占用端口，`refuse_connects` 模拟对端拒绝，`halt` 模拟事件循环停止；
//! - 入站连接由 `inject_stream` 注入，报文由 [`MemoryDatagramPeer::deliver`] 注入。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_transport::{
    AcceptFn, ConnectionObserver, DatagramConnection, DatagramOutcome, LinkError,
    ListenerHandle, PendingDatagram, PendingStream, StreamConnection, StreamOutcome,
    TransportKind, TransportProvider, TransportSocketAddr,
};

const FIRST_EPHEMERAL: u16 = 40_000;

/// 字节流连接的“对端视角”：注入字节、检查写出与关闭。
pub struct MemoryStreamPeer {
    local: TransportSocketAddr,
    peer: TransportSocketAddr,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    written: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryStreamPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStreamPeer")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryStreamPeer {
    fn new(local: TransportSocketAddr, peer: TransportSocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            peer,
            observer: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// 模拟网络上到达的字节；连接尚未启动时返回 `false`。
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => {
                observer.on_bytes(Bytes::copy_from_slice(bytes));
                true
            }
            None => false,
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> TransportSocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> TransportSocketAddr {
        self.peer
    }
}

struct MemoryPendingStream {
    peer: Arc<MemoryStreamPeer>,
}

impl PendingStream for MemoryPendingStream {
    fn local_addr(&self) -> TransportSocketAddr {
        self.peer.local
    }

    fn peer_addr(&self) -> TransportSocketAddr {
        self.peer.peer
    }

    fn start(self: Box<Self>, observer: Arc<dyn ConnectionObserver>) -> Arc<dyn StreamConnection> {
        *self.peer.observer.lock() = Some(observer);
        Arc::new(MemoryStreamConn { peer: self.peer })
    }
}

#[derive(Debug)]
struct MemoryStreamConn {
    peer: Arc<MemoryStreamPeer>,
}

impl StreamConnection for MemoryStreamConn {
    fn write(&self, data: Bytes) -> Result<usize, LinkError> {
        if self.peer.is_closed() {
            return Err(LinkError::closed("memory.stream.write", "memory write"));
        }
        self.peer.written.lock().extend_from_slice(&data);
        Ok(data.len())
    }

    fn close_gracefully(&self) {
        self.peer.closed.store(true, Ordering::SeqCst);
    }

    fn local_addr(&self) -> TransportSocketAddr {
        self.peer.local
    }

    fn peer_addr(&self) -> TransportSocketAddr {
        self.peer.peer
    }
}

/// 报文套接字的“网络视角”：注入报文、检查发送与关闭。
pub struct MemoryDatagramPeer {
    local: TransportSocketAddr,
    associated: Option<TransportSocketAddr>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    sent: Mutex<Vec<(Bytes, TransportSocketAddr)>>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryDatagramPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatagramPeer")
            .field("local", &self.local)
            .field("associated", &self.associated)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryDatagramPeer {
    fn new(local: TransportSocketAddr, associated: Option<TransportSocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            local,
            associated,
            observer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// 模拟来自 `from` 的报文；套接字已关闭或未启动时返回 `false`。
    pub fn deliver(&self, bytes: &[u8], from: TransportSocketAddr) -> bool {
        if self.is_closed() {
            return false;
        }
        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => {
                observer.on_datagram(Bytes::copy_from_slice(bytes), from);
                true
            }
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<(Bytes, TransportSocketAddr)> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> TransportSocketAddr {
        self.local
    }

    pub fn associated(&self) -> Option<TransportSocketAddr> {
        self.associated
    }
}

struct MemoryPendingDatagram {
    peer: Arc<MemoryDatagramPeer>,
}

impl PendingDatagram for MemoryPendingDatagram {
    fn local_addr(&self) -> TransportSocketAddr {
        self.peer.local
    }

    fn associated_peer(&self) -> Option<TransportSocketAddr> {
        self.peer.associated
    }

    fn start(
        self: Box<Self>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<dyn DatagramConnection> {
        *self.peer.observer.lock() = Some(observer);
        Arc::new(MemoryDatagramConn { peer: self.peer })
    }
}

#[derive(Debug)]
struct MemoryDatagramConn {
    peer: Arc<MemoryDatagramPeer>,
}

impl DatagramConnection for MemoryDatagramConn {
    fn write_datagram(&self, data: Bytes, to: TransportSocketAddr) -> Result<usize, LinkError> {
        if self.peer.is_closed() {
            return Err(LinkError::closed("memory.datagram.write", "memory write"));
        }
        let len = data.len();
        self.peer.sent.lock().push((data, to));
        Ok(len)
    }

    fn close(&self) {
        self.peer.closed.store(true, Ordering::SeqCst);
    }

    fn wait_released(&self, _timeout: Duration) -> bool {
        self.peer.is_closed()
    }

    fn local_addr(&self) -> TransportSocketAddr {
        self.peer.local
    }
}

struct StreamListener {
    on_accept: AcceptFn,
    stopped: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryState {
    next_port: u16,
    occupied: HashSet<u16>,
    stream_listeners: HashMap<u16, StreamListener>,
    retired_listeners: HashMap<u16, AcceptFn>,
    datagram_sockets: HashMap<u16, Arc<MemoryDatagramPeer>>,
    outbound_streams: Vec<Arc<MemoryStreamPeer>>,
    outbound_datagrams: Vec<Arc<MemoryDatagramPeer>>,
    listen_calls: usize,
}

impl MemoryState {
    fn allocate(&mut self, requested: u16) -> Result<u16, LinkError> {
        if requested != 0 {
            if self.occupied.contains(&requested) {
                return Err(LinkError::io(
                    "memory.bind_failed",
                    "memory bind",
                    io::Error::from(io::ErrorKind::AddrInUse),
                ));
            }
            return Ok(requested);
        }
        loop {
            let port = FIRST_EPHEMERAL.wrapping_add(self.next_port);
            self.next_port = self.next_port.wrapping_add(1);
            if !self.occupied.contains(&port) {
                return Ok(port);
            }
        }
    }
}

/// 内存传输提供方。
#[derive(Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    refuse_connects: AtomicBool,
    halted: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟进程外已占用的端口。
    pub fn occupy(&self, port: u16) {
        self.state.lock().occupied.insert(port);
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// 模拟事件循环停止：之后所有请求都无法投递。
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// 在 `port` 的活动监听上注入一个入站连接。
    pub fn inject_stream(&self, port: u16) -> Option<Arc<MemoryStreamPeer>> {
        let on_accept = {
            let state = self.state.lock();
            let listener = state.stream_listeners.get(&port)?;
            if listener.stopped.load(Ordering::SeqCst) {
                return None;
            }
            listener.on_accept.clone()
        };
        Some(self.accept_with(port, on_accept))
    }

    /// 通过 `port` 上已停止监听的回调注入连接，模拟停止后迟到的 accept。
    pub fn inject_late_stream(&self, port: u16) -> Option<Arc<MemoryStreamPeer>> {
        let on_accept = self.state.lock().retired_listeners.get(&port)?.clone();
        Some(self.accept_with(port, on_accept))
    }

    fn accept_with(&self, port: u16, on_accept: AcceptFn) -> Arc<MemoryStreamPeer> {
        let remote = {
            let mut state = self.state.lock();
            let remote_port = FIRST_EPHEMERAL.wrapping_add(10_000).wrapping_add(state.next_port);
            state.next_port = state.next_port.wrapping_add(1);
            remote_port
        };
        let peer = MemoryStreamPeer::new(
            TransportSocketAddr::loopback_v4(port),
            TransportSocketAddr::loopback_v4(remote),
        );
        on_accept(Box::new(MemoryPendingStream { peer: peer.clone() }));
        peer
    }

    /// `port` 上的入站报文套接字。
    pub fn datagram_socket(&self, port: u16) -> Option<Arc<MemoryDatagramPeer>> {
        self.state.lock().datagram_sockets.get(&port).cloned()
    }

    pub fn outbound_streams(&self) -> Vec<Arc<MemoryStreamPeer>> {
        self.state.lock().outbound_streams.clone()
    }

    pub fn outbound_datagrams(&self) -> Vec<Arc<MemoryDatagramPeer>> {
        self.state.lock().outbound_datagrams.clone()
    }

    /// 成功创建的监听总数。
    pub fn listen_calls(&self) -> usize {
        self.state.lock().listen_calls
    }

    fn ensure_running(&self, operation: &str) -> Result<(), LinkError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(LinkError::closed("memory.halted", operation));
        }
        Ok(())
    }
}

impl TransportProvider for MemoryTransport {
    fn connect_stream(
        &self,
        remote: TransportSocketAddr,
        outcome: StreamOutcome,
    ) -> Result<(), LinkError> {
        self.ensure_running("memory connect")?;
        if self.refuse_connects.load(Ordering::SeqCst) {
            outcome(Err(LinkError::io(
                "memory.connect_failed",
                "memory connect",
                io::Error::from(io::ErrorKind::ConnectionRefused),
            )));
            return Ok(());
        }
        let peer = {
            let mut state = self.state.lock();
            let local = state.allocate(0)?;
            let peer = MemoryStreamPeer::new(TransportSocketAddr::loopback_v4(local), remote);
            state.outbound_streams.push(peer.clone());
            peer
        };
        outcome(Ok(Box::new(MemoryPendingStream { peer })));
        Ok(())
    }

    fn connect_datagram(
        &self,
        remote: TransportSocketAddr,
        outcome: DatagramOutcome,
    ) -> Result<(), LinkError> {
        self.ensure_running("memory open")?;
        let peer = {
            let mut state = self.state.lock();
            let local = state.allocate(0)?;
            let peer = MemoryDatagramPeer::new(TransportSocketAddr::loopback_v4(local), Some(remote));
            state.outbound_datagrams.push(peer.clone());
            peer
        };
        outcome(Ok(Box::new(MemoryPendingDatagram { peer })));
        Ok(())
    }

    fn listen_stream(
        &self,
        local: TransportSocketAddr,
        on_accept: AcceptFn,
    ) -> Result<Box<dyn ListenerHandle>, LinkError> {
        self.ensure_running("memory listen")?;
        let mut state = self.state.lock();
        let port = state.allocate(local.port())?;
        state.occupied.insert(port);
        state.listen_calls += 1;
        let stopped = Arc::new(AtomicBool::new(false));
        state.stream_listeners.insert(
            port,
            StreamListener {
                on_accept,
                stopped: stopped.clone(),
            },
        );
        Ok(Box::new(MemoryListenerHandle {
            port,
            stopped,
            state: self.state.clone(),
        }))
    }

    fn listen_datagram(
        &self,
        local: TransportSocketAddr,
    ) -> Result<Box<dyn PendingDatagram>, LinkError> {
        self.ensure_running("memory listen")?;
        let mut state = self.state.lock();
        let port = state.allocate(local.port())?;
        state.occupied.insert(port);
        state.listen_calls += 1;
        let peer = MemoryDatagramPeer::new(TransportSocketAddr::loopback_v4(port), None);
        state.datagram_sockets.insert(port, peer.clone());
        Ok(Box::new(MemoryPendingDatagram { peer }))
    }
}

struct MemoryListenerHandle {
    port: u16,
    stopped: Arc<AtomicBool>,
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for MemoryListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListenerHandle")
            .field("port", &self.port)
            .finish()
    }
}

impl ListenerHandle for MemoryListenerHandle {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn local_addr(&self) -> TransportSocketAddr {
        TransportSocketAddr::loopback_v4(self.port)
    }

    fn stop_listening(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        state.occupied.remove(&self.port);
        if let Some(listener) = state.stream_listeners.remove(&self.port) {
            state.retired_listeners.insert(self.port, listener.on_accept);
        }
    }

    fn wait_released(&self, _timeout: Duration) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
